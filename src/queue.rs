// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! Types for defining RabbitMQ queues and their bindings, including the
//! typed broker arguments (TTL, length limits, dead-letter targets) that the
//! topology builder turns into an argument table on declaration.

/// Definition of a RabbitMQ queue with its declaration options.
///
/// Queues are durable by default. Broker arguments are optional and only
/// the ones that are set end up in the declaration's argument table.
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) passive: bool,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) expires: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
    pub(crate) max_priority: Option<i16>,
}

impl QueueDefinition {
    /// Creates a durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            ..QueueDefinition::default()
        }
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Makes the declaration passive, checking for existence without
    /// creating the queue.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the queue transient instead of the default durable.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when the last consumer disconnects.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Sets the no_wait flag, making the declaration non-blocking.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the per-message TTL in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the queue expiry in milliseconds of disuse.
    pub fn expires(mut self, expires: i32) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Routes rejected, expired and overflowed messages to the given
    /// exchange with the given routing key instead of dropping them.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    /// Enables message priorities up to the given maximum.
    pub fn max_priority(mut self, max: i16) -> Self {
        self.max_priority = Some(max);
        self
    }
}

/// Configuration for binding a queue to an exchange under a routing key.
#[derive(Debug, Clone)]
pub struct QueueBinding<'qb> {
    pub(crate) queue_name: &'qb str,
    pub(crate) exchange_name: &'qb str,
    pub(crate) routing_key: &'qb str,
    pub(crate) no_wait: bool,
}

impl<'qb> QueueBinding<'qb> {
    /// Creates a binding for the given queue. The exchange and routing key
    /// default to empty strings and should be set through the setters.
    pub fn new(queue: &'qb str) -> QueueBinding<'qb> {
        QueueBinding {
            queue_name: queue,
            exchange_name: "",
            routing_key: "",
            no_wait: false,
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &'qb str) -> Self {
        self.exchange_name = exchange;
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &'qb str) -> Self {
        self.routing_key = key;
        self
    }

    /// Sets the no_wait flag, making the bind non-blocking.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_queue_is_durable_with_no_arguments() {
        let def = QueueDefinition::new("orders.process");

        assert_eq!(def.name(), "orders.process");
        assert!(def.durable);
        assert!(!def.exclusive);
        assert!(def.ttl.is_none());
        assert!(def.dead_letter_exchange.is_none());
    }

    #[test]
    fn dead_letter_sets_both_arguments() {
        let def = QueueDefinition::new("orders.process").dead_letter("orders", "dlx");

        assert_eq!(def.dead_letter_exchange.as_deref(), Some("orders"));
        assert_eq!(def.dead_letter_routing_key.as_deref(), Some("dlx"));
    }

    #[test]
    fn binding_setters_chain() {
        let binding = QueueBinding::new("orders.process")
            .exchange("orders")
            .routing_key("orders.process");

        assert_eq!(binding.queue_name, "orders.process");
        assert_eq!(binding.exchange_name, "orders");
        assert_eq!(binding.routing_key, "orders.process");
        assert!(!binding.no_wait);
    }
}
