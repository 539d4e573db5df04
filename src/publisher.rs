// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module publishes messages to a named exchange/routing-key pair over
//! a channel resolved from the connection registry. Messages go out with
//! persistent delivery mode so they survive a broker restart once routed to
//! a durable queue.
//!
//! Publish failures are logged with their full context and re-raised; retry
//! policy belongs to the caller, not to this module.

use crate::{
    configs::AppConfigs,
    errors::AmqpError,
    registry::{SharedRegistry, DEFAULT_CONNECTION},
    topology::TopologyBuilder,
};
use futures_util::future::join_all;
use lapin::{
    options::BasicPublishOptions, publisher_confirm::Confirmation, types::ShortString,
    BasicProperties, Channel,
};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// AMQP delivery mode for messages persisted to disk by the broker.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publishes messages to one exchange/routing-key pair.
pub struct Publisher {
    registry: SharedRegistry,
    connection_name: String,
    exchange: String,
    routing_key: String,
}

impl Publisher {
    /// Creates a publisher from the configured exchange and routing key.
    ///
    /// No topology is provisioned; use [`Publisher::with_topology`] when
    /// the exchange and queues should be ensured first.
    pub fn new(registry: SharedRegistry, cfgs: &AppConfigs) -> Publisher {
        Publisher {
            registry,
            connection_name: DEFAULT_CONNECTION.to_owned(),
            exchange: cfgs.rabbitmq.exchange.clone().unwrap_or_default(),
            routing_key: cfgs.rabbitmq.routing_key.clone().unwrap_or_default(),
        }
    }

    /// Creates a publisher and runs the given topology build once, so the
    /// exchange, queue and dead-letter queue exist before the first send.
    pub async fn with_topology(
        registry: SharedRegistry,
        cfgs: &AppConfigs,
        builder: &TopologyBuilder,
    ) -> Result<Publisher, AmqpError> {
        builder.execute().await?;
        Ok(Publisher::new(registry, cfgs))
    }

    /// Overrides the exchange.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    /// Overrides the routing key.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Overrides the registry connection used for publishing.
    pub fn connection(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    /// Validates the publisher state and resolves the channel. No network
    /// call is made when validation fails.
    async fn checked_channel(&self, payload_len: usize) -> Result<Arc<Channel>, AmqpError> {
        if self.exchange.is_empty() {
            return Err(AmqpError::ConfigurationError(
                "RabbitMQ exchange is undefined. Set RABBITMQ_EXCHANGE or call exchange(...)"
                    .to_owned(),
            ));
        }

        if self.routing_key.is_empty() {
            return Err(AmqpError::ConfigurationError(
                "RabbitMQ routing key is undefined. Set RABBITMQ_QUEUE_ROUTING_KEY or call routing_key(...)"
                    .to_owned(),
            ));
        }

        if payload_len == 0 {
            return Err(AmqpError::ConfigurationError(
                "message is empty - provide a non-empty message to send".to_owned(),
            ));
        }

        self.registry.read().await.channel(&self.connection_name)
    }

    fn properties() -> BasicProperties {
        BasicProperties::default()
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
    }

    /// Publishes a single persistent message.
    ///
    /// # Parameters
    /// * `payload` - The message body, published as-is
    ///
    /// # Returns
    /// Ok(()) once the message is handed to the transport;
    /// [`AmqpError::ConfigurationError`] when the exchange or routing key
    /// is unset or the message is empty,
    /// [`AmqpError::ConnectionNotFoundError`] when the connection is not
    /// registered, and [`AmqpError::PublishingError`] when the broker or
    /// transport rejects the publish. Failures are not retried here.
    pub async fn send(&self, payload: &[u8]) -> Result<(), AmqpError> {
        let channel = self.checked_channel(payload.len()).await?;

        match channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                payload,
                Self::properties(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    connection = self.connection_name,
                    exchange = self.exchange,
                    routing_key = self.routing_key,
                    message_length = payload.len(),
                    "error publishing message"
                );
                Err(AmqpError::PublishingError)
            }
            _ => {
                debug!(
                    exchange = self.exchange,
                    routing_key = self.routing_key,
                    message_length = payload.len(),
                    "message queued"
                );
                Ok(())
            }
        }
    }

    /// Publishes a batch of persistent messages and flushes them together.
    ///
    /// Registry channels run in publisher-confirm mode, so every publish
    /// yields a broker confirm that the flush awaits.
    ///
    /// Either every message is handed to the broker and confirmed, or an
    /// error is returned. The caller cannot tell which messages landed on
    /// a failed batch; this is a documented limitation of the batch
    /// contract, not something this method hides.
    pub async fn send_batch(&self, payloads: &[Vec<u8>]) -> Result<(), AmqpError> {
        let total: usize = payloads.iter().map(Vec::len).sum();
        let channel = self.checked_channel(total).await?;

        let mut confirms = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let confirm = channel
                .basic_publish(
                    &self.exchange,
                    &self.routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    Self::properties(),
                )
                .await
                .map_err(|err| {
                    error!(
                        error = err.to_string(),
                        connection = self.connection_name,
                        exchange = self.exchange,
                        routing_key = self.routing_key,
                        batch_size = payloads.len(),
                        "error publishing batch message"
                    );
                    AmqpError::PublishingError
                })?;

            confirms.push(confirm);
        }

        for result in join_all(confirms).await {
            match result {
                Ok(Confirmation::Nack(_)) => {
                    error!(
                        exchange = self.exchange,
                        routing_key = self.routing_key,
                        batch_size = payloads.len(),
                        "broker nacked a batch message"
                    );
                    return Err(AmqpError::PublishingError);
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        exchange = self.exchange,
                        routing_key = self.routing_key,
                        batch_size = payloads.len(),
                        "error flushing batch"
                    );
                    return Err(AmqpError::PublishingError);
                }
                _ => {}
            }
        }

        debug!(
            exchange = self.exchange,
            routing_key = self.routing_key,
            batch_size = payloads.len(),
            "batch queued"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;

    async fn publisher_from(lookup: &dyn Fn(&str) -> Option<String>) -> Publisher {
        let empty = AppConfigs::from_lookup(&|_| None);
        let registry = ConnectionRegistry::new(&empty).await.unwrap().shared();
        Publisher::new(registry, &AppConfigs::from_lookup(lookup))
    }

    #[tokio::test]
    async fn send_requires_an_exchange() {
        let publisher = publisher_from(&|_| None).await;

        let err = publisher.send(b"payload").await.unwrap_err();
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn send_rejects_empty_messages() {
        let publisher = publisher_from(&|key| match key {
            "RABBITMQ_EXCHANGE" => Some("orders".to_owned()),
            "RABBITMQ_QUEUE" => Some("orders.process".to_owned()),
            _ => None,
        })
        .await;

        let err = publisher.send(b"").await.unwrap_err();
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn send_fails_without_a_registered_connection() {
        let publisher = publisher_from(&|key| match key {
            "RABBITMQ_EXCHANGE" => Some("orders".to_owned()),
            "RABBITMQ_QUEUE" => Some("orders.process".to_owned()),
            _ => None,
        })
        .await;

        let err = publisher.send(b"payload").await.unwrap_err();
        assert_eq!(
            err,
            AmqpError::ConnectionNotFoundError("default".to_owned())
        );
    }

    #[tokio::test]
    async fn batch_validates_before_any_network_call() {
        let publisher = publisher_from(&|_| None).await;

        let err = publisher
            .send_batch(&[b"a".to_vec(), b"b".to_vec()])
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }
}
