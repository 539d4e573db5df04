// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module declares the broker-side topology: one exchange, one primary
//! queue and one dead-letter queue, bound together so that a rejected or
//! expired message is never silently dropped.
//!
//! The canonical build performed by [`TopologyBuilder::execute`]:
//! 1. declare the exchange
//! 2. declare the dead-letter queue `<queue>.dlx` with no arguments
//! 3. declare the primary queue with `x-dead-letter-exchange` pointing back
//!    at the exchange and `x-dead-letter-routing-key` set to `dlx`
//! 4. bind the dead-letter queue to the exchange with routing key `dlx`
//! 5. bind the primary queue to the exchange with the configured routing key
//!
//! Every declaration is an idempotent re-declaration: the broker treats an
//! identical redeclare as a no-op and a mismatched one as an error, which
//! surfaces here as a fatal declare error and is never retried.

use crate::{
    configs::{AppConfigs, DLX_QUEUE_SUFFIX, DLX_ROUTING_KEY},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    registry::{SharedRegistry, DEFAULT_CONNECTION},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortInt, ShortString},
    Channel,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field used to specify queue expiry
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";
/// Header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";
/// Header field used to specify the maximum message priority
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";

/// Live broker-side counters for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub messages: u32,
    pub consumers: u32,
}

/// Declarative builder for the exchange / queue / dead-letter-queue trio.
///
/// Exchange, queue and routing key default from the configuration and can
/// be overridden through the setters. The channel is resolved through the
/// connection registry by connection name at declaration time.
pub struct TopologyBuilder {
    registry: SharedRegistry,
    connection_name: String,
    exchange: String,
    queue: String,
    routing_key: String,
}

impl TopologyBuilder {
    /// Creates a builder from the configured exchange, queue and routing
    /// key. Fails with a configuration error when either the exchange or
    /// the queue is unset.
    pub fn new(registry: SharedRegistry, cfgs: &AppConfigs) -> Result<Self, AmqpError> {
        let exchange = cfgs.rabbitmq.exchange.clone().ok_or_else(|| {
            AmqpError::ConfigurationError(
                "RabbitMQ exchange is undefined. Set RABBITMQ_EXCHANGE or call exchange(...)"
                    .to_owned(),
            )
        })?;

        let queue = cfgs.rabbitmq.queue.clone().ok_or_else(|| {
            AmqpError::ConfigurationError(
                "RabbitMQ queue is undefined. Set RABBITMQ_QUEUE or call queue(...)".to_owned(),
            )
        })?;

        let routing_key = cfgs.rabbitmq.routing_key.clone().unwrap_or_else(|| queue.clone());

        Ok(TopologyBuilder {
            registry,
            connection_name: DEFAULT_CONNECTION.to_owned(),
            exchange,
            queue,
            routing_key,
        })
    }

    /// Overrides the exchange name.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    /// Overrides the primary queue name.
    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_owned();
        self
    }

    /// Overrides the routing key.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Overrides the registry connection the declarations go through.
    pub fn connection(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    /// Name of the dead-letter queue paired with the primary queue.
    pub fn dlx_queue_name(&self) -> String {
        format!("{}{}", self.queue, DLX_QUEUE_SUFFIX)
    }

    async fn channel(&self) -> Result<Arc<Channel>, AmqpError> {
        self.registry.read().await.channel(&self.connection_name)
    }

    /// Declares an exchange on the builder's connection.
    pub async fn create_exchange(&self, def: &ExchangeDefinition<'_>) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        debug!("creating exchange: {}", def.name);

        match channel
            .exchange_declare(
                def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    /// Declares a queue on the builder's connection, carrying the typed
    /// broker arguments from the definition.
    pub async fn create_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        debug!("creating queue: {}", def.name());

        match channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: def.no_wait,
                },
                queue_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name().to_owned()))
            }
            _ => {
                debug!("queue: {} was created", def.name());
                Ok(())
            }
        }
    }

    /// Reads the live message and consumer counts for a queue.
    ///
    /// Uses a passive declaration, so the queue must already exist; asking
    /// about an unknown queue is a declare error.
    pub async fn queue_status(&self, queue: &str) -> Result<QueueStatus, AmqpError> {
        let channel = self.channel().await?;

        match channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(state) => Ok(QueueStatus {
                messages: state.message_count(),
                consumers: state.consumer_count(),
            }),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = queue,
                    "error to inspect the queue"
                );
                Err(AmqpError::DeclareQueueError(queue.to_owned()))
            }
        }
    }

    /// Binds a queue to an exchange under a routing key.
    pub async fn bind(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        let channel = self.channel().await?;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match channel
            .queue_bind(
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
                QueueBindOptions {
                    nowait: binding.no_wait,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingError(
                    binding.queue_name.to_owned(),
                    binding.exchange_name.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Installs the canonical topology.
    ///
    /// Safe to run at every startup: identical redeclarations are no-ops on
    /// the broker side. A mismatched redeclaration is a configuration
    /// problem and fails the whole build.
    ///
    /// # Returns
    /// Ok(()) once the exchange, both queues and both bindings exist, or
    /// the first declare/bind error; nothing already declared is rolled
    /// back.
    pub async fn execute(&self) -> Result<(), AmqpError> {
        let dlx_queue = self.dlx_queue_name();

        self.create_exchange(&ExchangeDefinition::new(&self.exchange))
            .await?;

        self.create_queue(&QueueDefinition::new(&dlx_queue)).await?;
        self.create_queue(
            &QueueDefinition::new(&self.queue).dead_letter(&self.exchange, DLX_ROUTING_KEY),
        )
        .await?;

        self.bind(
            &QueueBinding::new(&dlx_queue)
                .exchange(&self.exchange)
                .routing_key(DLX_ROUTING_KEY),
        )
        .await?;
        self.bind(
            &QueueBinding::new(&self.queue)
                .exchange(&self.exchange)
                .routing_key(&self.routing_key),
        )
        .await?;

        debug!(
            exchange = self.exchange,
            queue = self.queue,
            dlx_queue = dlx_queue,
            "topology installed"
        );

        Ok(())
    }
}

/// Builds the declaration argument table from a queue definition.
///
/// Only arguments that are actually set appear in the table.
pub(crate) fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(ttl) = def.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(expires) = def.expires {
        args.insert(
            ShortString::from(AMQP_HEADERS_EXPIRES),
            AMQPValue::LongInt(LongInt::from(expires)),
        );
    }

    if let Some(max_length) = def.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max_length)),
        );
    }

    if let Some(max_length_bytes) = def.max_length_bytes {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max_length_bytes)),
        );
    }

    if let Some(exchange) = &def.dead_letter_exchange {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }

    if let Some(key) = &def.dead_letter_routing_key {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(key.clone())),
        );
    }

    if let Some(max_priority) = def.max_priority {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
            AMQPValue::ShortInt(ShortInt::from(max_priority)),
        );
    }

    FieldTable::from(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;

    async fn builder_for(exchange: &str, queue: &str) -> TopologyBuilder {
        let cfgs = AppConfigs::from_lookup(&|_| None);
        let registry = ConnectionRegistry::new(&cfgs).await.unwrap().shared();

        let cfgs = AppConfigs::from_lookup(&{
            let exchange = exchange.to_owned();
            let queue = queue.to_owned();
            move |key: &str| match key {
                "RABBITMQ_EXCHANGE" => Some(exchange.clone()),
                "RABBITMQ_QUEUE" => Some(queue.clone()),
                _ => None,
            }
        });

        TopologyBuilder::new(registry, &cfgs).unwrap()
    }

    #[tokio::test]
    async fn builder_requires_exchange_and_queue() {
        let cfgs = AppConfigs::from_lookup(&|_| None);
        let registry = ConnectionRegistry::new(&cfgs).await.unwrap().shared();

        let err = TopologyBuilder::new(registry, &cfgs).map(|_| ()).unwrap_err();
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn routing_key_defaults_to_queue_name() {
        let builder = builder_for("orders", "orders.process").await;

        assert_eq!(builder.routing_key, "orders.process");
        assert_eq!(builder.dlx_queue_name(), "orders.process.dlx");
    }

    #[tokio::test]
    async fn declarations_fail_without_a_registered_connection() {
        let builder = builder_for("orders", "orders.process").await;

        let err = builder
            .create_exchange(&ExchangeDefinition::new("orders"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AmqpError::ConnectionNotFoundError("default".to_owned())
        );
    }

    #[tokio::test]
    async fn queue_status_fails_without_a_registered_connection() {
        let builder = builder_for("orders", "orders.process").await;

        let err = builder.queue_status("orders.process").await.unwrap_err();
        assert_eq!(
            err,
            AmqpError::ConnectionNotFoundError("default".to_owned())
        );
    }

    #[test]
    fn queue_arguments_carry_dead_letter_target() {
        let def = QueueDefinition::new("orders.process").dead_letter("orders", "dlx");
        let args = queue_arguments(&def);
        let inner = args.inner();

        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from("orders")))
        );
        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from("dlx")))
        );
    }

    #[test]
    fn queue_arguments_skip_unset_options() {
        let def = QueueDefinition::new("orders.process");
        assert!(queue_arguments(&def).inner().is_empty());

        let def = def.ttl(60_000).max_length(1_000);
        let args = queue_arguments(&def);
        let inner = args.inner();

        assert_eq!(inner.len(), 2);
        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongInt(LongInt::from(60_000)))
        );
    }
}
