// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! This module loads the broker and worker configuration from the process
//! environment. Every field can also be overridden programmatically through
//! the builder-style setters on the definition types, so the environment is
//! a default, not a requirement.
//!
//! Recognized variables:
//! - `RABBITMQ_HOST` (default `127.0.0.1`)
//! - `RABBITMQ_PORT` (default `5672`)
//! - `RABBITMQ_VHOST` (default `/`)
//! - `RABBITMQ_USERNAME`, `RABBITMQ_PASSWORD`
//! - `RABBITMQ_EXCHANGE`, `RABBITMQ_QUEUE`
//! - `RABBITMQ_QUEUE_ROUTING_KEY` (defaults to the queue name)
//! - `RABBITMQ_DLX_QUEUE` (defaults to `<queue>.dlx`)
//! - `RABBITMQ_DLX_QUEUE_ROUTING_KEY` (default `dlx`)
//! - `RABBITMQ_HEARTBEAT` (seconds, default `60`)
//! - `RABBITMQ_CONNECTION_TIMEOUT` (milliseconds, default `10000`)
//! - `WORKERS_PID_DIR` (default `storage/pids`)
//! - `WORKERS_DRAIN_FILE` (default `storage/framework/drain`)
//! - `WORKERS_LOG_FILE`
//! - `WORKERS_COMMAND` (space separated; defaults to the current executable)

use serde::Deserialize;
use std::path::PathBuf;

/// Suffix appended to the primary queue name to derive the default
/// dead-letter queue name.
pub const DLX_QUEUE_SUFFIX: &str = ".dlx";

/// Fixed routing key used for dead-letter bindings.
pub const DLX_ROUTING_KEY: &str = "dlx";

/// Top-level configuration for an application embedding this crate.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfigs {
    /// Application name, propagated as the AMQP connection name.
    pub name: String,
    pub rabbitmq: RabbitMQConfigs,
    pub workers: WorkerConfigs,
}

/// Broker connection and topology defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub dlx_queue: Option<String>,
    pub dlx_routing_key: String,
    /// Heartbeat interval in seconds.
    pub heartbeat: u16,
    /// Connection timeout in milliseconds.
    pub connection_timeout: u64,
}

/// Worker supervision configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfigs {
    /// Base directory for pid-lock files, one subdirectory per worker type.
    pub pid_dir: PathBuf,
    /// Path of the drain marker file.
    pub drain_file: PathBuf,
    /// File that spawned workers append their output to.
    pub log_file: Option<PathBuf>,
    /// Command line used to launch worker children. The worker name is
    /// appended as the last argument. Empty means "re-invoke the current
    /// executable with `worker` as the first argument".
    pub command: Vec<String>,
}

impl AppConfigs {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Loads the configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        AppConfigs {
            name: lookup("APP_NAME").unwrap_or_else(|| "rabbitmq-workers".to_owned()),
            rabbitmq: RabbitMQConfigs::from_lookup(lookup),
            workers: WorkerConfigs::from_lookup(lookup),
        }
    }
}

impl RabbitMQConfigs {
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let queue = lookup("RABBITMQ_QUEUE");

        RabbitMQConfigs {
            host: lookup("RABBITMQ_HOST").unwrap_or_else(|| "127.0.0.1".to_owned()),
            port: parse_or(lookup("RABBITMQ_PORT"), 5672),
            vhost: lookup("RABBITMQ_VHOST").unwrap_or_else(|| "/".to_owned()),
            user: lookup("RABBITMQ_USERNAME"),
            password: lookup("RABBITMQ_PASSWORD"),
            exchange: lookup("RABBITMQ_EXCHANGE"),
            routing_key: lookup("RABBITMQ_QUEUE_ROUTING_KEY").or_else(|| queue.clone()),
            dlx_queue: lookup("RABBITMQ_DLX_QUEUE")
                .or_else(|| queue.as_ref().map(|q| format!("{q}{DLX_QUEUE_SUFFIX}"))),
            dlx_routing_key: lookup("RABBITMQ_DLX_QUEUE_ROUTING_KEY")
                .unwrap_or_else(|| DLX_ROUTING_KEY.to_owned()),
            heartbeat: parse_or(lookup("RABBITMQ_HEARTBEAT"), 60),
            connection_timeout: parse_or(lookup("RABBITMQ_CONNECTION_TIMEOUT"), 10_000),
            queue,
        }
    }

    /// True when every field required to open a connection is present.
    ///
    /// The connection registry only opens the eager `default` connection
    /// when this holds.
    pub fn has_credentials(&self) -> bool {
        !self.host.is_empty() && self.user.is_some() && self.password.is_some()
    }
}

impl WorkerConfigs {
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        WorkerConfigs {
            pid_dir: lookup("WORKERS_PID_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("storage/pids")),
            drain_file: lookup("WORKERS_DRAIN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("storage/framework/drain")),
            log_file: lookup("WORKERS_LOG_FILE").map(PathBuf::from),
            command: lookup("WORKERS_COMMAND")
                .map(|raw| raw.split_whitespace().map(str::to_owned).collect())
                .unwrap_or_default(),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
