// Copyright (c) 2025, The Typebus Authors
// MIT License
// All rights reserved.

//! # Messaging Facade
//!
//! The high-level entry point: typed send and receive over contract-shaped
//! routing. The facade owns the contract registry, serialiser, route cache
//! and connection strategies; applications construct one per broker and
//! share it.
//!
//! Sending verifies the message's routing topology first, through the route
//! cache so repeated sends of the same contract skip the broker round-trips.
//! Receiving resolves the message's contract chain against locally bound
//! decoders and hands back a leased [`PendingMessage`].

use crate::{
    config::{Expires, MessagingConfig},
    connection::{LongTermConnection, ShortTermConnection},
    contract::{primary_contract, ContractRegistry, Contracted},
    errors::MessagingError,
    pending::PendingMessage,
    route_cache::RouteCache,
    router::{MessageRouter, MessageRouting, NameFilter},
    serialise::{MessageSerialiser, PreparedMessage},
    type_router::TypeRouter,
};
use serde::Serialize;
use std::{any::Any, sync::Arc};
use tracing::warn;

/// Typed messaging over contract-shaped routing.
pub struct MessagingBase {
    config: MessagingConfig,
    registry: Arc<ContractRegistry>,
    serialiser: MessageSerialiser,
    router: Arc<dyn MessageRouting>,
    type_router: TypeRouter,
    route_cache: Arc<RouteCache>,
}

impl MessagingBase {
    /// Creates a facade connected to the configured broker.
    ///
    /// No I/O happens here; connections open lazily on first use.
    pub fn new(config: MessagingConfig, registry: ContractRegistry) -> MessagingBase {
        let long_term = Arc::new(LongTermConnection::new(
            config.connection.clone(),
            "typebus-data",
        ));
        let short_term = ShortTermConnection::new(config.connection.clone(), "typebus-topology");
        let route_cache = Arc::new(RouteCache::new(long_term.clone()));
        let router: Arc<dyn MessageRouting> = Arc::new(MessageRouter::new(
            long_term,
            short_term,
            route_cache.clone(),
        ));
        MessagingBase::assemble(config, registry, router, route_cache)
    }

    /// Creates a facade over an explicit routing implementation.
    ///
    /// This is the seam for exercising the facade against a mock router.
    pub fn with_router(
        config: MessagingConfig,
        registry: ContractRegistry,
        router: Arc<dyn MessageRouting>,
    ) -> MessagingBase {
        let long_term = Arc::new(LongTermConnection::new(
            config.connection.clone(),
            "typebus-data",
        ));
        let route_cache = Arc::new(RouteCache::new(long_term));
        MessagingBase::assemble(config, registry, router, route_cache)
    }

    fn assemble(
        config: MessagingConfig,
        mut registry: ContractRegistry,
        router: Arc<dyn MessageRouting>,
        route_cache: Arc<RouteCache>,
    ) -> MessagingBase {
        if let Some(root) = &config.contract_root {
            registry.set_contract_root(root);
        }
        let registry = Arc::new(registry);
        let serialiser = MessageSerialiser::new(registry.clone());
        let type_router = TypeRouter::new(router.clone(), registry.clone());

        MessagingBase {
            config,
            registry,
            serialiser,
            router,
            type_router,
            route_cache,
        }
    }

    /// The full contract chain a message type sends under.
    pub fn contract_type_name<T: Contracted>(&self) -> Result<String, MessagingError> {
        self.registry.chain_string_of_message::<T>()
    }

    /// Creates a durable destination and links it to a contract's source,
    /// with the whole ancestor topology in place. The topology verification
    /// goes through the route cache, so a send following destination
    /// creation skips the broker round-trips.
    pub async fn create_destination<T: Contracted>(
        &self,
        destination: &str,
    ) -> Result<(), MessagingError> {
        let contract = primary_contract::<T>()?;
        self.ensure_routes(contract).await?;
        self.router.add_destination(destination).await?;
        self.router.link(contract, destination).await
    }

    /// Like [`create_destination`](Self::create_destination), with a message
    /// TTL and dead-letter pair on the destination.
    pub async fn create_limited_destination<T: Contracted>(
        &self,
        destination: &str,
        expiry: Expires,
    ) -> Result<(), MessagingError> {
        self.create_destination_for(primary_contract::<T>()?, destination, expiry)
            .await
    }

    /// Creates a destination for a contract named at runtime, for listening
    /// to contracts this process has no concrete message type for.
    pub async fn create_destination_for(
        &self,
        contract: &str,
        destination: &str,
        expiry: Expires,
    ) -> Result<(), MessagingError> {
        self.ensure_routes(contract).await?;
        self.router
            .add_limited_destination(destination, expiry)
            .await?;
        self.router.link(contract, destination).await
    }

    /// Serialises and publishes a message under its declared contract.
    ///
    /// Messages sent before any destination is linked are dropped by the
    /// broker; create destinations first.
    pub async fn send_message<T>(&self, message: &T) -> Result<(), MessagingError>
    where
        T: Contracted + Serialize,
    {
        self.send_with(message, None).await
    }

    /// Sends a message carrying an explicit correlation id.
    pub async fn send_message_with_correlation<T>(
        &self,
        message: &T,
        correlation_id: &str,
    ) -> Result<(), MessagingError>
    where
        T: Contracted + Serialize,
    {
        self.send_with(message, Some(correlation_id.to_owned())).await
    }

    /// Serialises a message into a detached, storable form without touching
    /// the broker.
    pub fn prepare_for_send<T>(&self, message: &T) -> Result<PreparedMessage, MessagingError>
    where
        T: Contracted + Serialize,
    {
        PreparedMessage::from_message(&self.serialiser, message)
    }

    /// Publishes a previously prepared message.
    pub async fn send_prepared(&self, message: &PreparedMessage) -> Result<(), MessagingError> {
        self.ensure_routes(message.type_name()).await?;
        self.router
            .send(
                message.type_name(),
                message.contract_type(),
                self.config.app_group_name.clone(),
                message.correlation_id().map(str::to_owned),
                message.body(),
            )
            .await
    }

    /// Receives and immediately finishes one message from a destination.
    ///
    /// `None` when the destination is empty.
    pub async fn get_message<T: Any + Send>(
        &self,
        destination: &str,
    ) -> Result<Option<T>, MessagingError> {
        match self.try_start_message::<T>(destination).await? {
            Some(pending) => {
                pending.finish().await?;
                Ok(Some(pending.into_message()))
            }
            None => Ok(None),
        }
    }

    /// Claims one message from a destination under a lease.
    ///
    /// The message's contract chain is resolved against locally bound
    /// decoders; a message this process cannot decode is returned to its
    /// queue and the resolution error propagates.
    pub async fn try_start_message<T: Any + Send>(
        &self,
        destination: &str,
    ) -> Result<Option<PendingMessage<T>>, MessagingError> {
        let Some((data, properties)) = self.router.get(destination).await? else {
            return Ok(None);
        };

        let decoded = match self
            .serialiser
            .deserialise_by_stack(&data, &properties.original_type)
        {
            Ok(decoded) => decoded,
            Err(err) => {
                self.return_to_queue(properties.delivery_tag).await;
                return Err(err);
            }
        };

        let message = match decoded.downcast::<T>() {
            Ok(message) => *message,
            Err(_) => {
                self.return_to_queue(properties.delivery_tag).await;
                return Err(MessagingError::ContractViolation(format!(
                    "message with contract chain `{}` does not decode to the requested type",
                    properties.original_type
                )));
            }
        };

        Ok(Some(PendingMessage::new(
            message,
            properties,
            self.router.clone(),
            self.config.effective_ack_timeout(),
        )))
    }

    /// Claims one message from this application group's own destination.
    pub async fn try_start_group_message<T: Any + Send>(
        &self,
    ) -> Result<Option<PendingMessage<T>>, MessagingError> {
        let destination = self.group_destination()?.to_owned();
        self.try_start_message(&destination).await
    }

    /// Claims one message without decoding it: the raw body under a lease.
    pub async fn try_start_message_raw(
        &self,
        destination: &str,
    ) -> Result<Option<PendingMessage<Vec<u8>>>, MessagingError> {
        let Some((data, properties)) = self.router.get(destination).await? else {
            return Ok(None);
        };
        Ok(Some(PendingMessage::new(
            data,
            properties,
            self.router.clone(),
            self.config.effective_ack_timeout(),
        )))
    }

    /// Drops all waiting messages from a destination.
    pub async fn purge(&self, destination: &str) -> Result<(), MessagingError> {
        self.router.purge(destination).await
    }

    /// Deletes matching sources and destinations and clears local caches.
    pub async fn remove_routing(&self, filter: NameFilter) -> Result<(), MessagingError> {
        self.router.remove_routing(filter).await
    }

    /// Forgets cached route setups and drops the long-term connection.
    ///
    /// The next send re-verifies topology on a fresh channel; use after
    /// external topology changes or to recover from a wedged connection.
    pub async fn reset_caches(&self) {
        self.route_cache.reset().await;
    }

    async fn ensure_routes(&self, contract: &str) -> Result<(), MessagingError> {
        self.route_cache
            .ensure(contract, || self.type_router.build_routes(contract))
            .await
    }

    async fn send_with<T>(
        &self,
        message: &T,
        correlation_id: Option<String>,
    ) -> Result<(), MessagingError>
    where
        T: Contracted + Serialize,
    {
        let contract = primary_contract::<T>()?;
        let (body, chain) = self.serialiser.serialise(message)?;
        self.ensure_routes(contract).await?;
        self.router
            .send(
                contract,
                &chain,
                self.config.app_group_name.clone(),
                correlation_id,
                &body,
            )
            .await
    }

    fn group_destination(&self) -> Result<&str, MessagingError> {
        self.config.app_group_name.as_deref().ok_or_else(|| {
            MessagingError::ContractViolation(
                "no application group name configured".to_owned(),
            )
        })
    }

    async fn return_to_queue(&self, delivery_tag: u64) {
        if let Err(err) = self.router.cancel(delivery_tag).await {
            warn!(
                error = ?err,
                delivery_tag,
                "failed to return undecodable message to its queue"
            );
        }
    }
}

impl std::fmt::Debug for MessagingBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingBase")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
