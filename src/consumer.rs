// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module subscribes to a queue with bounded prefetch and hands every
//! delivery to a caller-supplied callback. Acknowledgment is the callback's
//! responsibility; nothing is auto-acked here.
//!
//! Shutdown is cooperative: when the shutdown token fires, the consumer
//! cancels its subscription tag, lets the in-flight callback finish and
//! returns once the delivery stream closes. No new message is delivered to
//! the tag after the cancel. A transport error while waiting for deliveries
//! is fatal: it is logged and the process exits so the supervisor can
//! restart the worker and the broker can requeue unacknowledged messages.

use crate::{
    configs::AppConfigs,
    errors::AmqpError,
    registry::{SharedRegistry, DEFAULT_CONNECTION},
    shutdown::Shutdown,
    topology::TopologyBuilder,
};
use futures_util::{Stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
};
use std::future::Future;
use tracing::{debug, error, info};

/// Consumes messages from a single queue.
pub struct Consumer {
    registry: SharedRegistry,
    connection_name: String,
    queue: String,
    consumer_tag: Option<String>,
    prefetch_count: u16,
}

impl Consumer {
    /// Creates a consumer for the configured queue with a prefetch of one.
    ///
    /// The consumer tag defaults to the hostname when not overridden.
    pub fn new(registry: SharedRegistry, cfgs: &AppConfigs) -> Result<Consumer, AmqpError> {
        let queue = cfgs.rabbitmq.queue.clone().ok_or_else(|| {
            AmqpError::ConfigurationError(
                "RabbitMQ queue is undefined. Set RABBITMQ_QUEUE or call queue(...)".to_owned(),
            )
        })?;

        Ok(Consumer {
            registry,
            connection_name: DEFAULT_CONNECTION.to_owned(),
            queue,
            consumer_tag: None,
            prefetch_count: 1,
        })
    }

    /// Creates a consumer and runs the given topology build once before
    /// first use.
    pub async fn with_topology(
        registry: SharedRegistry,
        cfgs: &AppConfigs,
        builder: &TopologyBuilder,
    ) -> Result<Consumer, AmqpError> {
        builder.execute().await?;
        Consumer::new(registry, cfgs)
    }

    /// Overrides the queue.
    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_owned();
        self
    }

    /// Overrides the consumer tag.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    /// Overrides the prefetch count.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Overrides the registry connection used for consuming.
    pub fn connection(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    /// Blocks processing deliveries until the subscription ends.
    ///
    /// Each delivery is handed to `handler` with its delivery metadata and
    /// acker; the handler must ack or reject it. The calling task is
    /// dedicated to this loop: it returns only after a shutdown trigger has
    /// cancelled the subscription and the stream has drained.
    ///
    /// # Parameters
    /// * `shutdown` - Cancellation token observed between deliveries
    /// * `handler` - Callback invoked once per delivery, owning the
    ///   acknowledgment of each message
    ///
    /// # Returns
    /// Ok(()) once the subscription stream closes after a cancel, or an
    /// AmqpError from the QoS, consume or cancel handshakes.
    pub async fn receive<F, Fut>(&self, shutdown: &Shutdown, handler: F) -> Result<(), AmqpError>
    where
        F: Fn(Delivery) -> Fut,
        Fut: Future<Output = ()>,
    {
        let channel = self.registry.read().await.channel(&self.connection_name)?;
        let tag = self.consumer_tag.clone().unwrap_or_else(hostname);

        channel
            .basic_qos(
                self.prefetch_count,
                BasicQosOptions { global: false },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(self.queue.clone())
            })?;

        let stream = channel
            .basic_consume(
                &self.queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    queue = self.queue,
                    "error to create the consumer"
                );
                AmqpError::ConsumerDeclarationError(self.queue.clone())
            })?;

        debug!(queue = self.queue, consumer_tag = tag, "consuming queue");

        let cancel = {
            let channel = channel.clone();
            let tag = tag.clone();
            move || {
                let channel = channel.clone();
                let tag = tag.clone();
                async move {
                    channel
                        .basic_cancel(&tag, BasicCancelOptions { nowait: false })
                        .await
                        .map_err(|err| {
                            error!(
                                error = err.to_string(),
                                consumer_tag = tag,
                                "failure to cancel consumer"
                            );
                            AmqpError::CancelConsumerError(tag.clone())
                        })
                }
            }
        };

        self.consume_stream(stream, shutdown, handler, cancel, &tag)
            .await
    }

    /// The delivery loop, separated from the broker handshakes.
    ///
    /// An in-flight handler always runs to completion; the shutdown branch
    /// is only taken between deliveries. After a successful cancel the
    /// subscription stream drains its remaining deliveries and closes,
    /// which ends the loop.
    async fn consume_stream<S, F, Fut, C, CFut>(
        &self,
        mut stream: S,
        shutdown: &Shutdown,
        handler: F,
        cancel: C,
        tag: &str,
    ) -> Result<(), AmqpError>
    where
        S: Stream<Item = Result<Delivery, lapin::Error>> + Unpin,
        F: Fn(Delivery) -> Fut,
        Fut: Future<Output = ()>,
        C: Fn() -> CFut,
        CFut: Future<Output = Result<(), AmqpError>>,
    {
        let mut cancelled = false;
        loop {
            tokio::select! {
                delivery = stream.next() => match delivery {
                    Some(Ok(delivery)) => handler(delivery).await,
                    Some(Err(err)) => {
                        error!(
                            error = err.to_string(),
                            connection = self.connection_name,
                            queue = self.queue,
                            consumer_tag = tag,
                            "error while reading queue"
                        );
                        // Fail fast: the supervisor restarts the worker and
                        // the broker requeues anything unacknowledged.
                        std::process::exit(1);
                    }
                    None => break,
                },
                _ = shutdown.recv(), if !cancelled => {
                    info!(
                        queue = self.queue,
                        consumer_tag = tag,
                        "shutdown requested, cancelling subscription"
                    );

                    cancel().await?;
                    cancelled = true;
                }
            }
        }

        debug!(queue = self.queue, consumer_tag = tag, "queue finished reading");
        Ok(())
    }
}

/// Default consumer tag: the machine hostname.
fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "consumer".to_owned())
    }

    #[cfg(not(unix))]
    {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "consumer".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;

    async fn registry() -> SharedRegistry {
        let cfgs = AppConfigs::from_lookup(&|_| None);
        ConnectionRegistry::new(&cfgs).await.unwrap().shared()
    }

    fn configs_with_queue() -> AppConfigs {
        AppConfigs::from_lookup(&|key| match key {
            "RABBITMQ_QUEUE" => Some("orders.process".to_owned()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn new_requires_a_queue() {
        let cfgs = AppConfigs::from_lookup(&|_| None);
        let err = Consumer::new(registry().await, &cfgs).map(|_| ()).unwrap_err();

        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn defaults_to_prefetch_one_on_the_default_connection() {
        let consumer = Consumer::new(registry().await, &configs_with_queue()).unwrap();

        assert_eq!(consumer.prefetch_count, 1);
        assert_eq!(consumer.connection_name, DEFAULT_CONNECTION);
        assert!(consumer.consumer_tag.is_none());
    }

    #[tokio::test]
    async fn receive_fails_without_a_registered_connection() {
        let consumer = Consumer::new(registry().await, &configs_with_queue()).unwrap();
        let shutdown = Shutdown::new();

        let err = consumer
            .receive(&shutdown, |_delivery| async {})
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AmqpError::ConnectionNotFoundError("default".to_owned())
        );
    }

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            delivery_tag: tag,
            exchange: "orders".into(),
            routing_key: "orders.process".into(),
            redelivered: false,
            properties: lapin::BasicProperties::default(),
            data: b"payload".to_vec(),
            acker: lapin::acker::Acker::default(),
        }
    }

    #[tokio::test]
    async fn shutdown_cancels_once_and_drains_the_in_flight_delivery() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, Mutex};

        let consumer = Consumer::new(registry().await, &configs_with_queue()).unwrap();
        let shutdown = Shutdown::new();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));

        // One delivery already in flight when the shutdown lands.
        tx.send(Ok(delivery(1))).unwrap();
        shutdown.trigger();

        let handled = Arc::new(AtomicUsize::new(0));
        let cancels = Arc::new(AtomicUsize::new(0));

        let handler = {
            let handled = handled.clone();
            move |_delivery: Delivery| {
                let handled = handled.clone();
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                }
            }
        };

        // A successful cancel closes the subscription stream.
        let cancel = {
            let cancels = cancels.clone();
            let sender = Arc::new(Mutex::new(Some(tx)));
            move || {
                cancels.fetch_add(1, Ordering::SeqCst);
                sender.lock().unwrap().take();
                async { Ok::<(), AmqpError>(()) }
            }
        };

        consumer
            .consume_stream(stream, &shutdown, handler, cancel, "test")
            .await
            .unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_failure_surfaces_from_the_loop() {
        let consumer = Consumer::new(registry().await, &configs_with_queue()).unwrap();
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let (_tx, mut rx) =
            tokio::sync::mpsc::unbounded_channel::<Result<Delivery, lapin::Error>>();
        let stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));

        let err = consumer
            .consume_stream(
                stream,
                &shutdown,
                |_delivery| async {},
                || async { Err::<(), _>(AmqpError::CancelConsumerError("test".to_owned())) },
                "test",
            )
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::CancelConsumerError("test".to_owned()));
    }
}
