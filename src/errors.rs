// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error types for the messaging core and the worker
//! supervision layer. `AmqpError` covers connection, topology and data-path
//! failures; `WorkerError` covers slot locking, process spawning and drain
//! handling.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Configuration errors are always fatal to the calling operation and are
/// never retried internally. Transport errors on open propagate to the
/// caller; transport errors on close are logged and swallowed so that
/// cleanup of the remaining resource can continue.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// A required configuration field is missing or empty
    #[error("missing configuration: {0}")]
    ConfigurationError(String),

    /// The named connection is not registered in the connection registry
    #[error("connection `{0}` is not registered")]
    ConnectionNotFoundError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindingError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on a queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer subscription
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Transport error while waiting for deliveries
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Represents errors that can occur while supervising worker processes.
///
/// Lock contention is not an error: `SlotLock::try_acquire` reports it as
/// `Ok(false)` and the supervisor moves on to the next slot.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The named worker type is not present in the worker registry
    #[error("unknown worker `{0}`")]
    UnknownWorker(String),

    /// Filesystem error on a pid file, lock file or the drain marker
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error acquiring or releasing a slot lock
    #[error("slot lock error on `{0}`: {1}")]
    Lock(String, String),

    /// Error spawning a worker child process
    #[error("failure to spawn worker `{0}`")]
    Spawn(String),

    /// Error serializing or deserializing the drain marker
    #[error("drain marker error: {0}")]
    DrainMarker(#[from] serde_json::Error),

    /// Error surfaced by the worker's own run loop
    #[error(transparent)]
    Amqp(#[from] AmqpError),
}
