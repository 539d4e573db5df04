// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Registry
//!
//! This module centralizes every broker connection the process holds. Each
//! entry is a named pair of one transport connection and the single channel
//! opened on it; publishers, consumers and the topology builder all resolve
//! their channel here by connection name instead of holding private handles.
//!
//! The registry is explicitly constructed at process entry and passed around
//! behind an [`SharedRegistry`] handle; there is no hidden global instance.

use crate::{
    channel::{new_amqp_channel, require_credentials},
    configs::{AppConfigs, RabbitMQConfigs},
    errors::AmqpError,
};
use lapin::{Channel, Connection};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Name of the connection opened eagerly at registry construction.
pub const DEFAULT_CONNECTION: &str = "default";

/// Shared handle to the single per-process registry instance.
pub type SharedRegistry = Arc<RwLock<ConnectionRegistry>>;

struct ConnectionEntry {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
}

/// Process-wide set of named broker connections.
///
/// Invariant: at most one entry per name. A second `add_connection` for an
/// existing name returns `Ok(false)` and leaves the original entry alone.
pub struct ConnectionRegistry {
    app_name: String,
    connections: HashMap<String, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Creates the registry. When the configuration carries complete
    /// credentials, a connection named [`DEFAULT_CONNECTION`] is opened
    /// eagerly; open failures propagate to the caller.
    pub async fn new(cfgs: &AppConfigs) -> Result<Self, AmqpError> {
        let mut registry = ConnectionRegistry {
            app_name: cfgs.name.clone(),
            connections: HashMap::default(),
        };

        if cfgs.rabbitmq.has_credentials() {
            registry
                .add_connection(DEFAULT_CONNECTION, &cfgs.rabbitmq)
                .await?;
        }

        Ok(registry)
    }

    /// Wraps the registry for sharing across the process.
    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Opens a new named connection and its channel.
    ///
    /// Fails fast with a configuration error when a required field is
    /// missing. Transport failures during open propagate as
    /// [`AmqpError::ConnectionError`] / [`AmqpError::ChannelError`].
    ///
    /// # Parameters
    /// * `name` - Registry name for the new connection
    /// * `cfg` - Broker configuration the connection is opened from
    ///
    /// # Returns
    /// * `Ok(true)` when the connection was opened and registered
    /// * `Ok(false)` without effect when `name` is already registered
    pub async fn add_connection(
        &mut self,
        name: &str,
        cfg: &RabbitMQConfigs,
    ) -> Result<bool, AmqpError> {
        require_credentials(cfg)?;

        if self.connections.contains_key(name) {
            debug!(name = name, "connection already registered");
            return Ok(false);
        }

        let (connection, channel) = new_amqp_channel(&self.app_name, cfg).await?;

        self.connections.insert(
            name.to_owned(),
            ConnectionEntry {
                connection,
                channel,
            },
        );

        debug!(name = name, "connection registered");
        Ok(true)
    }

    /// True iff an entry exists for `name`.
    pub fn check_connection(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    /// Returns the transport connection registered under `name`.
    pub fn connection(&self, name: &str) -> Result<Arc<Connection>, AmqpError> {
        self.connections
            .get(name)
            .map(|entry| entry.connection.clone())
            .ok_or_else(|| AmqpError::ConnectionNotFoundError(name.to_owned()))
    }

    /// Returns the channel registered under `name`.
    pub fn channel(&self, name: &str) -> Result<Arc<Channel>, AmqpError> {
        self.connections
            .get(name)
            .map(|entry| entry.channel.clone())
            .ok_or_else(|| AmqpError::ConnectionNotFoundError(name.to_owned()))
    }

    /// Closes and evicts the named connection.
    ///
    /// The channel and the connection are closed independently; a failure
    /// to close one is logged and does not block closing the other, and the
    /// entry is evicted either way. Returns `false` when `name` was absent.
    pub async fn remove_connection(&mut self, name: &str) -> bool {
        let Some(entry) = self.connections.remove(name) else {
            return false;
        };

        if let Err(err) = entry.channel.close(200, "closing").await {
            error!(
                error = err.to_string(),
                name = name,
                "failure to close channel"
            );
        }

        if let Err(err) = entry.connection.close(200, "closing").await {
            error!(
                error = err.to_string(),
                name = name,
                "failure to close connection"
            );
        }

        debug!(name = name, "connection removed");
        true
    }

    /// Atomic remove-then-add under the same name.
    ///
    /// When the add fails after a successful remove the name is left
    /// absent; callers detect this through [`Self::check_connection`].
    pub async fn update_connection(
        &mut self,
        name: &str,
        cfg: &RabbitMQConfigs,
    ) -> Result<bool, AmqpError> {
        if !self.remove_connection(name).await {
            return Ok(false);
        }

        self.add_connection(name, cfg).await
    }

    /// Best-effort teardown of every registered connection.
    pub async fn close_all(&mut self) {
        let names: Vec<String> = self.connections.keys().cloned().collect();
        for name in names {
            self.remove_connection(&name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_registry() -> ConnectionRegistry {
        ConnectionRegistry {
            app_name: "test".to_owned(),
            connections: HashMap::default(),
        }
    }

    fn configs_without_credentials() -> RabbitMQConfigs {
        RabbitMQConfigs::from_lookup(&|_| None)
    }

    #[tokio::test]
    async fn add_connection_fails_fast_on_missing_credentials() {
        let mut registry = empty_registry();

        let err = registry
            .add_connection("default", &configs_without_credentials())
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::ConfigurationError(_)));
        assert!(!registry.check_connection("default"));
    }

    #[tokio::test]
    async fn lookups_report_not_found() {
        let registry = empty_registry();

        assert!(!registry.check_connection("default"));
        assert_eq!(
            registry.channel("default").unwrap_err(),
            AmqpError::ConnectionNotFoundError("default".to_owned())
        );
        assert_eq!(
            registry.connection("missing").unwrap_err(),
            AmqpError::ConnectionNotFoundError("missing".to_owned())
        );
    }

    #[tokio::test]
    async fn remove_connection_returns_false_when_absent() {
        let mut registry = empty_registry();
        assert!(!registry.remove_connection("default").await);
    }

    #[tokio::test]
    async fn update_connection_returns_false_when_absent() {
        let mut registry = empty_registry();

        let updated = registry
            .update_connection("default", &configs_without_credentials())
            .await
            .unwrap();

        assert!(!updated);
    }

    #[tokio::test]
    async fn new_registry_without_credentials_opens_nothing() {
        let cfgs = AppConfigs::from_lookup(&|_| None);
        let registry = ConnectionRegistry::new(&cfgs).await.unwrap();

        assert!(!registry.check_connection(DEFAULT_CONNECTION));
    }
}
