// Copyright (c) 2025, The Typebus Authors
// MIT License
// All rights reserved.

//! # Connection Strategies
//!
//! Two ways of reaching the broker share the same channel-action contract:
//!
//! - [`ShortTermConnection`] opens a fresh connection and channel per call and
//!   closes both afterwards. Topology operations use this so they stay
//!   isolated from any long-lived failure state.
//! - [`LongTermConnection`] keeps one connection and channel open across
//!   calls for low-latency polling, reconnecting lazily when the channel has
//!   gone away. All access is serialized under one lock so concurrent callers
//!   share the single underlying channel safely.
//!
//! Construction failures surface immediately as descriptive errors; no code
//! path hands out a missing channel.

use crate::{config::ConnectionConfig, errors::MessagingError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{future::Future, sync::Arc};
use tracing::{debug, error};

/// Reply code used when closing connections we own.
const CLOSE_OK: u16 = 200;

async fn connect(
    config: &ConnectionConfig,
    connection_name: &str,
) -> Result<(Connection, Channel), MessagingError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(connection_name.to_owned()));

    let conn = match Connection::connect(&config.amqp_uri(), options).await {
        Ok(c) => c,
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            return Err(MessagingError::ConnectionError);
        }
    };
    debug!("amqp connected");

    match conn.create_channel().await {
        Ok(channel) => {
            debug!("channel created");
            Ok((conn, channel))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(MessagingError::ChannelError)
        }
    }
}

/// Per-call connection strategy.
///
/// Every `with_channel` opens a connection and channel, runs the action and
/// closes the connection again.
pub struct ShortTermConnection {
    config: ConnectionConfig,
    connection_name: String,
}

impl ShortTermConnection {
    /// Creates a short-term strategy for the given broker.
    pub fn new(config: ConnectionConfig, connection_name: &str) -> ShortTermConnection {
        ShortTermConnection {
            config,
            connection_name: connection_name.to_owned(),
        }
    }

    /// Performs an action against the broker on a throwaway channel.
    pub async fn with_channel<T, F, Fut>(&self, action: F) -> Result<T, MessagingError>
    where
        F: FnOnce(Arc<Channel>) -> Fut,
        Fut: Future<Output = Result<T, MessagingError>>,
    {
        let (conn, channel) = connect(&self.config, &self.connection_name).await?;
        let result = action(Arc::new(channel)).await;

        if let Err(err) = conn.close(CLOSE_OK, "short-term connection complete").await {
            debug!(
                error = err.to_string(),
                "error closing short-term connection"
            );
        }

        result
    }
}

struct Live {
    connection: Connection,
    channel: Arc<Channel>,
}

/// Long-term connection strategy for polling.
///
/// The connection and channel are opened on first use and kept across calls.
/// If the channel is found closed, the next call reconnects transparently.
pub struct LongTermConnection {
    config: ConnectionConfig,
    connection_name: String,
    inner: tokio::sync::Mutex<Option<Live>>,
}

impl LongTermConnection {
    /// Creates a long-term strategy for the given broker. No I/O happens
    /// until the first `with_channel` call.
    pub fn new(config: ConnectionConfig, connection_name: &str) -> LongTermConnection {
        LongTermConnection {
            config,
            connection_name: connection_name.to_owned(),
            inner: tokio::sync::Mutex::new(None),
        }
    }

    /// Performs an action against the broker on the shared channel.
    ///
    /// The internal lock is held for the duration of the action, so two
    /// concurrent callers never interleave on the channel.
    pub async fn with_channel<T, F, Fut>(&self, action: F) -> Result<T, MessagingError>
    where
        F: FnOnce(Arc<Channel>) -> Fut,
        Fut: Future<Output = Result<T, MessagingError>>,
    {
        let mut slot = self.inner.lock().await;
        let channel = self.ensure_channel(&mut slot).await?;
        action(channel).await
    }

    /// Closes any existing connection. The next call reconnects.
    pub async fn reset(&self) {
        let mut slot = self.inner.lock().await;
        if let Some(live) = slot.take() {
            debug!("resetting long-term connection");
            if let Err(err) = live.connection.close(CLOSE_OK, "long-term reset").await {
                debug!(
                    error = err.to_string(),
                    "error closing long-term connection"
                );
            }
        }
    }

    async fn ensure_channel(
        &self,
        slot: &mut Option<Live>,
    ) -> Result<Arc<Channel>, MessagingError> {
        if let Some(live) = slot.as_mut() {
            if live.channel.status().connected() {
                return Ok(live.channel.clone());
            }

            // Channel died but the connection may still be usable.
            if live.connection.status().connected() {
                match live.connection.create_channel().await {
                    Ok(channel) => {
                        debug!("re-created channel on existing connection");
                        live.channel = Arc::new(channel);
                        return Ok(live.channel.clone());
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "error to re-create the channel");
                        // fall through to a full reconnect
                    }
                }
            }
        }

        let (connection, channel) = connect(&self.config, &self.connection_name).await?;
        let channel = Arc::new(channel);
        *slot = Some(Live {
            connection,
            channel: channel.clone(),
        });
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    #[tokio::test]
    async fn reset_before_first_use_is_a_no_op() {
        let conn = LongTermConnection::new(ConnectionConfig::default(), "test");
        conn.reset().await;
        assert!(conn.inner.lock().await.is_none());
    }
}
