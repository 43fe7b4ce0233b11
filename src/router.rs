// Copyright (c) 2025, The Typebus Authors
// MIT License
// All rights reserved.

//! # Message Router
//!
//! Broker-facing routing: declares sources (exchanges) and destinations
//! (queues), links them, publishes, and performs leased reads with
//! acknowledge/reject.
//!
//! Topology-mutating operations serialize on a single router-wide lock and
//! run over the short-term connection strategy; the data path (send, get,
//! finish, cancel) runs over the long-term strategy, which serializes
//! internally. Declarations are idempotent: declaring the same source,
//! destination or link twice creates exactly one broker-side object.

use crate::{
    config::{Expires, ANONYMOUS_SENDER},
    connection::{LongTermConnection, ShortTermConnection},
    contract::CHAIN_SEPARATOR,
    errors::MessagingError,
    otel,
    route_cache::RouteCache,
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicRejectOptions,
        ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, ExchangeKind,
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};
use tracing::{debug, error};
use uuid::Uuid;

/// Fixed prefix identifying the dead-letter pair of a limited destination.
/// Part of the observable contract for operator tooling.
pub const DEAD_LETTER_PREFIX: &str = "dead-letter-";

/// Header carrying the full, untruncated contract chain of a message.
pub const CONTRACT_STACK_HEADER: &str = "x-contract-stack";

/// Exchange argument carrying a source's contract chain for introspection.
pub const CONTRACT_METADATA_ARGUMENT: &str = "x-contract-stack";

/// Queue argument naming the dead-letter exchange for expired messages.
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument for per-message TTL.
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Content type applied to published message bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP short-string limit for the visible `type` property.
const SHORT_STRING_LIMIT: usize = 255;

/// The dead-letter queue/exchange name paired with a destination.
pub fn dead_letter_name(destination: &str) -> String {
    format!("{DEAD_LETTER_PREFIX}{destination}")
}

/// Truncates a contract chain to the short-string limit at a `;` boundary.
///
/// The truncated copy is best-effort for broker tooling; the full value is
/// always carried in the [`CONTRACT_STACK_HEADER`] header.
pub(crate) fn truncate_type_description(description: &str) -> &str {
    if description.len() <= SHORT_STRING_LIMIT {
        return description;
    }
    let mut cut = SHORT_STRING_LIMIT;
    while !description.is_char_boundary(cut) {
        cut -= 1;
    }
    let head = &description[..cut];
    match head.rfind(CHAIN_SEPARATOR) {
        Some(idx) => &head[..idx],
        None => head,
    }
}

/// Properties of a delivered message, used for reading and acknowledging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    /// Broker-scoped lease handle for `finish`/`cancel`.
    pub delivery_tag: u64,
    /// The contract chain the sender gave this message (full header copy
    /// preferred over the truncated visible property).
    pub original_type: String,
    /// Exchange the message was originally published to.
    pub exchange: String,
    /// Correlation id of the message, if given.
    pub correlation_id: Option<String>,
    /// Sender name (reply-to address) of the message, if given.
    pub sender_name: Option<String>,
}

/// Name filter used when tearing down routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameFilter {
    /// Match every known name.
    All,
    /// Match names starting with the given prefix.
    Prefix(String),
    /// Match one exact name.
    Exact(String),
}

impl NameFilter {
    /// True when the filter matches the given name.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            NameFilter::All => true,
            NameFilter::Prefix(prefix) => name.starts_with(prefix.as_str()),
            NameFilter::Exact(exact) => name == exact,
        }
    }
}

/// Basic actions to drive the broker's routing graph.
///
/// The concrete implementation is [`MessageRouter`]; the trait exists so the
/// type router, facade and pending messages can be exercised against a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRouting: Send + Sync {
    /// Idempotently declares a source exchange routing by a single implicit
    /// key. `metadata` (the source's contract chain) is stored as an
    /// exchange argument for introspection.
    async fn add_source(&self, name: &str, metadata: &str) -> Result<(), MessagingError>;

    /// Idempotently declares a fanout source delivering to all links.
    async fn add_broadcast_source(&self, name: &str, metadata: &str)
        -> Result<(), MessagingError>;

    /// Idempotently declares a durable destination queue.
    async fn add_destination(&self, name: &str) -> Result<(), MessagingError>;

    /// Declares a destination with a message TTL and paired dead-letter
    /// wiring. A non-positive expiry behaves as `add_destination`.
    async fn add_limited_destination(
        &self,
        name: &str,
        expiry: Expires,
    ) -> Result<(), MessagingError>;

    /// Idempotently binds a destination to a source.
    async fn link(&self, source: &str, destination: &str) -> Result<(), MessagingError>;

    /// Unbinds a destination from a source; a no-op if the link is absent.
    async fn unlink(&self, source: &str, destination: &str) -> Result<(), MessagingError>;

    /// Routes messages from a child source into a parent source.
    /// Self-routing is a configuration error.
    async fn route_sources(&self, child: &str, parent: &str) -> Result<(), MessagingError>;

    /// Publishes to a source. Unrouted sources drop silently (non-mandatory
    /// publish). A missing correlation id is replaced with a fresh unique
    /// one, and a missing sender with the anonymous marker.
    async fn send(
        &self,
        source: &str,
        type_description: &str,
        sender_name: Option<String>,
        correlation_id: Option<String>,
        data: &[u8],
    ) -> Result<(), MessagingError>;

    /// Claims a message from a destination without removing it. The message
    /// is not redelivered to another `get` until `finish` or `cancel`.
    async fn get(
        &self,
        destination: &str,
    ) -> Result<Option<(Vec<u8>, MessageProperties)>, MessagingError>;

    /// `get` followed immediately by `finish`: transient consumption where
    /// loss on crash is acceptable.
    async fn get_and_finish(
        &self,
        destination: &str,
    ) -> Result<Option<(Vec<u8>, MessageProperties)>, MessagingError> {
        match self.get(destination).await? {
            Some((data, properties)) => {
                self.finish(properties.delivery_tag).await?;
                Ok(Some((data, properties)))
            }
            None => Ok(None),
        }
    }

    /// Permanently removes a message claimed by `get`.
    async fn finish(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    /// Returns a claimed message to the head of its queue, making it the
    /// next one delivered.
    async fn cancel(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    /// Drops all waiting messages from a destination.
    async fn purge(&self, destination: &str) -> Result<(), MessagingError>;

    /// Deletes every known source and destination matching the filter, then
    /// clears local bookkeeping and resets the route cache and the stale
    /// long-term channel.
    async fn remove_routing(&self, filter: NameFilter) -> Result<(), MessagingError>;
}

#[derive(Default)]
struct KnownNames {
    queues: HashSet<String>,
    exchanges: HashSet<String>,
}

/// Synchronous-feeling message routing over RabbitMQ.
pub struct MessageRouter {
    long_term: Arc<LongTermConnection>,
    short_term: ShortTermConnection,
    route_cache: Arc<RouteCache>,
    names: tokio::sync::Mutex<KnownNames>,
}

impl MessageRouter {
    /// Creates a router over the two connection strategies.
    pub fn new(
        long_term: Arc<LongTermConnection>,
        short_term: ShortTermConnection,
        route_cache: Arc<RouteCache>,
    ) -> MessageRouter {
        MessageRouter {
            long_term,
            short_term,
            route_cache,
            names: tokio::sync::Mutex::new(KnownNames::default()),
        }
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        metadata: &str,
    ) -> Result<(), MessagingError> {
        if name.trim().is_empty() {
            return Err(MessagingError::ContractViolation(
                "source name is not valid".to_owned(),
            ));
        }

        let mut names = self.names.lock().await;
        let mut args = BTreeMap::new();
        if !metadata.is_empty() {
            args.insert(
                ShortString::from(CONTRACT_METADATA_ARGUMENT),
                AMQPValue::LongString(LongString::from(metadata)),
            );
        }

        debug!(name, "creating exchange");
        self.short_term
            .with_channel(|channel: Arc<Channel>| async move {
                channel
                    .exchange_declare(
                        name,
                        kind,
                        ExchangeDeclareOptions {
                            passive: false,
                            durable: true,
                            auto_delete: false,
                            internal: false,
                            nowait: false,
                        },
                        FieldTable::from(args),
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), name, "error to declare the exchange");
                        MessagingError::DeclareExchangeError(name.to_owned())
                    })
            })
            .await?;

        names.exchanges.insert(name.to_owned());
        Ok(())
    }
}

#[async_trait]
impl MessageRouting for MessageRouter {
    async fn add_source(&self, name: &str, metadata: &str) -> Result<(), MessagingError> {
        self.declare_exchange(name, ExchangeKind::Direct, metadata)
            .await
    }

    async fn add_broadcast_source(
        &self,
        name: &str,
        metadata: &str,
    ) -> Result<(), MessagingError> {
        self.declare_exchange(name, ExchangeKind::Fanout, metadata)
            .await
    }

    async fn add_destination(&self, name: &str) -> Result<(), MessagingError> {
        if name.trim().is_empty() {
            return Err(MessagingError::ContractViolation(
                "destination name is not valid".to_owned(),
            ));
        }

        let mut names = self.names.lock().await;

        debug!(name, "creating queue");
        self.short_term
            .with_channel(|channel: Arc<Channel>| async move {
                channel
                    .queue_declare(name, durable_queue_options(), FieldTable::default())
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), name, "error to declare the queue");
                        MessagingError::DeclareQueueError(name.to_owned())
                    })
            })
            .await?;

        names.queues.insert(name.to_owned());
        Ok(())
    }

    async fn add_limited_destination(
        &self,
        name: &str,
        expiry: Expires,
    ) -> Result<(), MessagingError> {
        if !expiry.is_limited() {
            return self.add_destination(name).await;
        }
        if name.trim().is_empty() {
            return Err(MessagingError::ContractViolation(
                "destination name is not valid".to_owned(),
            ));
        }

        let dead_name = dead_letter_name(name);
        let mut names = self.names.lock().await;

        debug!(name, dead_name, ttl = expiry.milliseconds, "creating limited queue");
        let dead = dead_name.clone();
        self.short_term
            .with_channel(|channel: Arc<Channel>| async move {
                // Dead-letter pair: a fanout exchange that disappears when
                // unused, and a durable queue of the same name bound to it.
                channel
                    .exchange_declare(
                        &dead,
                        ExchangeKind::Fanout,
                        ExchangeDeclareOptions {
                            passive: false,
                            durable: true,
                            auto_delete: true,
                            internal: false,
                            nowait: false,
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "failure to declare dead-letter exchange");
                        MessagingError::DeclareExchangeError(dead.clone())
                    })?;

                channel
                    .queue_declare(&dead, durable_queue_options(), FieldTable::default())
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "failure to declare dead-letter queue");
                        MessagingError::DeclareQueueError(dead.clone())
                    })?;

                channel
                    .queue_bind(
                        &dead,
                        &dead,
                        "",
                        QueueBindOptions { nowait: false },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "failure to bind dead-letter queue");
                        MessagingError::BindingError(dead.clone(), dead.clone())
                    })?;

                channel
                    .queue_declare(
                        name,
                        durable_queue_options(),
                        FieldTable::from(limited_queue_args(&dead, expiry)),
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), name, "error to declare the queue");
                        MessagingError::DeclareQueueError(name.to_owned())
                    })?;

                Ok(())
            })
            .await?;

        names.queues.insert(name.to_owned());
        names.queues.insert(dead_name.clone());
        names.exchanges.insert(dead_name);
        Ok(())
    }

    async fn link(&self, source: &str, destination: &str) -> Result<(), MessagingError> {
        let _names = self.names.lock().await;

        debug!(source, destination, "binding queue to exchange");
        self.short_term
            .with_channel(|channel: Arc<Channel>| async move {
                channel
                    .queue_bind(
                        destination,
                        source,
                        "",
                        QueueBindOptions { nowait: false },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error to bind queue to exchange");
                        MessagingError::BindingError(source.to_owned(), destination.to_owned())
                    })
            })
            .await
    }

    async fn unlink(&self, source: &str, destination: &str) -> Result<(), MessagingError> {
        let _names = self.names.lock().await;

        debug!(source, destination, "unbinding queue from exchange");
        self.short_term
            .with_channel(|channel: Arc<Channel>| async move {
                channel
                    .queue_unbind(destination, source, "", FieldTable::default())
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error to unbind queue from exchange");
                        MessagingError::UnbindingError(source.to_owned(), destination.to_owned())
                    })
            })
            .await
    }

    async fn route_sources(&self, child: &str, parent: &str) -> Result<(), MessagingError> {
        if child == parent {
            return Err(MessagingError::ContractViolation(
                "can't bind a source to itself".to_owned(),
            ));
        }

        let _names = self.names.lock().await;

        debug!(child, parent, "routing source to source");
        self.short_term
            .with_channel(|channel: Arc<Channel>| async move {
                channel
                    .exchange_bind(
                        parent,
                        child,
                        "",
                        ExchangeBindOptions { nowait: false },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error to bind exchange to exchange");
                        MessagingError::BindingError(child.to_owned(), parent.to_owned())
                    })
            })
            .await
    }

    async fn send(
        &self,
        source: &str,
        type_description: &str,
        sender_name: Option<String>,
        correlation_id: Option<String>,
        data: &[u8],
    ) -> Result<(), MessagingError> {
        let correlation = correlation_id.unwrap_or_else(new_correlation_id);
        let sender = sender_name.unwrap_or_else(|| ANONYMOUS_SENDER.to_owned());

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(CONTRACT_STACK_HEADER),
            AMQPValue::LongString(LongString::from(type_description)),
        );
        otel::inject_context(&mut headers);

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(truncate_type_description(type_description)))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_correlation_id(ShortString::from(correlation.as_str()))
            .with_reply_to(ShortString::from(sender))
            .with_headers(FieldTable::from(headers));

        self.long_term
            .with_channel(|channel: Arc<Channel>| async move {
                channel
                    .basic_publish(
                        source,
                        "",
                        BasicPublishOptions {
                            immediate: false,
                            mandatory: false,
                        },
                        data,
                        properties,
                    )
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), source, "error publishing message");
                        MessagingError::PublishingError(source.to_owned())
                    })?;
                Ok(())
            })
            .await
    }

    async fn get(
        &self,
        destination: &str,
    ) -> Result<Option<(Vec<u8>, MessageProperties)>, MessagingError> {
        let message = self
            .long_term
            .with_channel(|channel: Arc<Channel>| async move {
                channel
                    .basic_get(destination, BasicGetOptions { no_ack: false })
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), destination, "error reading message");
                        MessagingError::GetMessageError(destination.to_owned())
                    })
            })
            .await?;

        let Some(message) = message else {
            return Ok(None);
        };

        let delivery = message.delivery;
        let props = &delivery.properties;

        let full_chain = props
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(CONTRACT_STACK_HEADER))
            .and_then(|value| match value {
                AMQPValue::LongString(chain) => {
                    std::str::from_utf8(chain.as_bytes()).ok().map(str::to_owned)
                }
                _ => None,
            });
        let original_type = full_chain
            .or_else(|| props.kind().as_ref().map(|kind| kind.to_string()))
            .unwrap_or_default();

        let properties = MessageProperties {
            delivery_tag: delivery.delivery_tag,
            original_type,
            exchange: delivery.exchange.to_string(),
            correlation_id: props.correlation_id().as_ref().map(|id| id.to_string()),
            sender_name: props.reply_to().as_ref().map(|name| name.to_string()),
        };

        Ok(Some((delivery.data, properties)))
    }

    async fn finish(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.long_term
            .with_channel(|channel: Arc<Channel>| async move {
                channel
                    .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error whiling ack msg");
                        MessagingError::AckMessageError
                    })
            })
            .await
    }

    async fn cancel(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.long_term
            .with_channel(|channel: Arc<Channel>| async move {
                channel
                    .basic_reject(delivery_tag, BasicRejectOptions { requeue: true })
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error whiling reject msg");
                        MessagingError::RejectMessageError
                    })
            })
            .await
    }

    async fn purge(&self, destination: &str) -> Result<(), MessagingError> {
        let _names = self.names.lock().await;

        debug!(destination, "purging queue");
        self.short_term
            .with_channel(|channel: Arc<Channel>| async move {
                channel
                    .queue_purge(destination, QueuePurgeOptions { nowait: false })
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), destination, "error purging queue");
                        MessagingError::PurgeError(destination.to_owned())
                    })?;
                Ok(())
            })
            .await
    }

    async fn remove_routing(&self, filter: NameFilter) -> Result<(), MessagingError> {
        let mut names = self.names.lock().await;

        // Deleted topology invalidates cached routes and any channel that
        // still believes in them.
        self.route_cache.reset().await;

        let queues: Vec<String> = names
            .queues
            .iter()
            .filter(|name| filter.matches(name))
            .cloned()
            .collect();
        let exchanges: Vec<String> = names
            .exchanges
            .iter()
            .filter(|name| filter.matches(name))
            .cloned()
            .collect();

        debug!(
            queues = queues.len(),
            exchanges = exchanges.len(),
            "removing routing"
        );
        self.short_term
            .with_channel(|channel: Arc<Channel>| async move {
                for queue in &queues {
                    channel
                        .queue_delete(queue, QueueDeleteOptions::default())
                        .await
                        .map_err(|err| {
                            error!(error = err.to_string(), queue, "error deleting queue");
                            MessagingError::DeleteError(queue.clone())
                        })?;
                }
                for exchange in &exchanges {
                    channel
                        .exchange_delete(exchange, ExchangeDeleteOptions::default())
                        .await
                        .map_err(|err| {
                            error!(error = err.to_string(), exchange, "error deleting exchange");
                            MessagingError::DeleteError(exchange.clone())
                        })?;
                }
                Ok(())
            })
            .await?;

        names.queues.clear();
        names.exchanges.clear();
        Ok(())
    }
}

/// Routing for credentials without configure permissions on the broker.
///
/// Every topology-changing operation (declarations, links, purge, teardown)
/// is accepted and ignored; the topology is expected to be provisioned out of
/// band by an operator holding full permissions. The data path delegates to
/// the wrapped router unchanged.
pub struct ReducedPermissionRouter {
    inner: Arc<dyn MessageRouting>,
}

impl ReducedPermissionRouter {
    /// Wraps a router, stripping its topology-changing surface.
    pub fn over(inner: Arc<dyn MessageRouting>) -> ReducedPermissionRouter {
        ReducedPermissionRouter { inner }
    }
}

#[async_trait]
impl MessageRouting for ReducedPermissionRouter {
    async fn add_source(&self, _name: &str, _metadata: &str) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn add_broadcast_source(
        &self,
        _name: &str,
        _metadata: &str,
    ) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn add_destination(&self, _name: &str) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn add_limited_destination(
        &self,
        _name: &str,
        _expiry: Expires,
    ) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn link(&self, _source: &str, _destination: &str) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn unlink(&self, _source: &str, _destination: &str) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn route_sources(&self, _child: &str, _parent: &str) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn send(
        &self,
        source: &str,
        type_description: &str,
        sender_name: Option<String>,
        correlation_id: Option<String>,
        data: &[u8],
    ) -> Result<(), MessagingError> {
        self.inner
            .send(source, type_description, sender_name, correlation_id, data)
            .await
    }

    async fn get(
        &self,
        destination: &str,
    ) -> Result<Option<(Vec<u8>, MessageProperties)>, MessagingError> {
        self.inner.get(destination).await
    }

    async fn finish(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.inner.finish(delivery_tag).await
    }

    async fn cancel(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.inner.cancel(delivery_tag).await
    }

    async fn purge(&self, _destination: &str) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn remove_routing(&self, _filter: NameFilter) -> Result<(), MessagingError> {
        Ok(())
    }
}

/// Fresh correlation id for messages sent without one.
pub(crate) fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

fn durable_queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: true,
        exclusive: false,
        auto_delete: false,
        nowait: false,
    }
}

fn limited_queue_args(dead_name: &str, expiry: Expires) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from(dead_name)),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
        AMQPValue::LongLongInt(expiry.milliseconds),
    );
    args
}
