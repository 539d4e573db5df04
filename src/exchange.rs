// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management
//!
//! Types for defining RabbitMQ exchanges. Exchanges route published messages
//! to bound queues based on the routing key and the exchange type; this
//! module provides a builder for declaring them.

/// Types of exchanges supported by the topology builder.
///
/// - Direct: routes on an exact routing-key match
/// - Fanout: broadcasts to every bound queue
/// - Topic: routes on wildcard routing-key patterns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of a RabbitMQ exchange with its declaration options.
///
/// Exchanges are durable by default; everything else is opt-in through the
/// chaining setters.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition<'ex> {
    pub(crate) name: &'ex str,
    pub(crate) kind: ExchangeKind,
    pub(crate) passive: bool,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
}

impl<'ex> ExchangeDefinition<'ex> {
    /// Creates a durable direct exchange definition with the given name.
    pub fn new(name: &'ex str) -> ExchangeDefinition<'ex> {
        ExchangeDefinition {
            name,
            kind: ExchangeKind::Direct,
            passive: false,
            durable: true,
            auto_delete: false,
            internal: false,
            no_wait: false,
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Makes the declaration passive, checking for existence without
    /// creating the exchange.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange transient instead of the default durable.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Sets the no_wait flag, making the declaration non-blocking.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}
