// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels. It
//! establishes a connection to the RabbitMQ server from a [`RabbitMQConfigs`]
//! and opens the single channel that the rest of the crate multiplexes over.

use crate::{configs::RabbitMQConfigs, errors::AmqpError};
use lapin::{
    options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Checks that every field required to open a connection is present.
///
/// Fails fast with a [`AmqpError::ConfigurationError`] naming the missing
/// field, before any network call is made.
pub(crate) fn require_credentials<'c>(
    cfg: &'c RabbitMQConfigs,
) -> Result<(&'c str, &'c str), AmqpError> {
    if cfg.host.is_empty() {
        return Err(AmqpError::ConfigurationError(
            "RabbitMQ host is undefined. Set RABBITMQ_HOST or provide a host".to_owned(),
        ));
    }

    let user = cfg.user.as_deref().ok_or_else(|| {
        AmqpError::ConfigurationError(
            "RabbitMQ username is undefined. Set RABBITMQ_USERNAME or provide a username"
                .to_owned(),
        )
    })?;

    let password = cfg.password.as_deref().ok_or_else(|| {
        AmqpError::ConfigurationError(
            "RabbitMQ password is undefined. Set RABBITMQ_PASSWORD or provide a password"
                .to_owned(),
        )
    })?;

    Ok((user, password))
}

/// Creates a new AMQP connection and a channel on top of it.
///
/// Both are wrapped in `Arc` so the connection registry can hand them out
/// to publishers and consumers without reopening anything. The channel is
/// put into publisher-confirm mode before it is returned.
///
/// # Parameters
/// * `app_name` - Application name, reported to the broker as the
///   connection name
/// * `cfg` - Configuration containing RabbitMQ connection details like
///   host, port, credentials, etc.
///
/// # Returns
/// * `Result<(Arc<Connection>, Arc<Channel>), AmqpError>` -
///   The connection and its confirm-mode channel on success;
///   [`AmqpError::ConfigurationError`] when a required field is missing,
///   [`AmqpError::ConnectionError`] when the transport cannot be opened,
///   [`AmqpError::ChannelError`] when the channel cannot be created or
///   confirm mode cannot be enabled.
pub async fn new_amqp_channel(
    app_name: &str,
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    let (user, password) = require_credentials(cfg)?;

    debug!("creating amqp connection...");
    let options =
        ConnectionProperties::default().with_connection_name(LongString::from(app_name));

    let uri = format!(
        "amqp://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}",
        user,
        password,
        cfg.host,
        cfg.port,
        urlencode_vhost(&cfg.vhost),
        cfg.heartbeat,
        cfg.connection_timeout,
    );

    let conn = match Connection::connect(&uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(
                error = err.to_string(),
                host = cfg.host,
                port = cfg.port,
                "failure to connect"
            );
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }?;

    // Confirm mode makes every basic_publish return a broker confirm that
    // the publisher awaits on batch flushes.
    if let Err(err) = channel.confirm_select(ConfirmSelectOptions::default()).await {
        error!(error = err.to_string(), "error to enable publisher confirms");
        return Err(AmqpError::ChannelError {});
    }

    debug!("channel created");
    Ok((Arc::new(conn), Arc::new(channel)))
}

/// The default vhost `/` must appear as `%2f` in an AMQP URI.
fn urlencode_vhost(vhost: &str) -> String {
    vhost.replace('/', "%2f")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_configs() -> RabbitMQConfigs {
        RabbitMQConfigs::from_lookup(&|key| match key {
            "RABBITMQ_USERNAME" => Some("guest".to_owned()),
            "RABBITMQ_PASSWORD" => Some("guest".to_owned()),
            _ => None,
        })
    }

    #[test]
    fn require_credentials_accepts_complete_configs() {
        let cfg = base_configs();
        assert_eq!(require_credentials(&cfg), Ok(("guest", "guest")));
    }

    #[test]
    fn require_credentials_rejects_missing_username() {
        let mut cfg = base_configs();
        cfg.user = None;

        let err = require_credentials(&cfg).unwrap_err();
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[test]
    fn require_credentials_rejects_missing_password() {
        let mut cfg = base_configs();
        cfg.password = None;

        let err = require_credentials(&cfg).unwrap_err();
        assert!(matches!(err, AmqpError::ConfigurationError(_)));
    }

    #[test]
    fn default_vhost_is_percent_encoded() {
        assert_eq!(urlencode_vhost("/"), "%2f");
        assert_eq!(urlencode_vhost("orders"), "orders");
    }
}
