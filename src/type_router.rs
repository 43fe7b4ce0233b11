// Copyright (c) 2025, The Typebus Authors
// MIT License
// All rights reserved.

//! # Type Router
//!
//! Maps a contract DAG onto broker topology: one source per contract, with
//! child sources routed into their parents. Publishing to the most specific
//! contract's source then reaches every destination listening anywhere up
//! the ancestor chain.

use crate::{
    contract::ContractRegistry,
    errors::MessagingError,
    router::MessageRouting,
};
use std::{collections::HashSet, sync::Arc};
use tracing::debug;

/// Builds contract-shaped routing topology on the broker.
pub struct TypeRouter {
    router: Arc<dyn MessageRouting>,
    registry: Arc<ContractRegistry>,
}

impl TypeRouter {
    /// Creates a type router over a routing implementation and the contract
    /// DAG it should mirror.
    pub fn new(router: Arc<dyn MessageRouting>, registry: Arc<ContractRegistry>) -> TypeRouter {
        TypeRouter { router, registry }
    }

    /// Ensures a source exists for `contract` and every ancestor, and that
    /// each child source routes into its direct parents.
    ///
    /// Idempotent: existing sources and routes are re-declared identically.
    /// Diamond ancestors are visited once.
    pub async fn build_routes(&self, contract: &str) -> Result<(), MessagingError> {
        debug!(contract, "building routes");

        let mut visited: HashSet<String> = HashSet::new();
        let mut work = vec![contract.to_owned()];

        while let Some(current) = work.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }

            let chain = self.registry.chain_string_of(&current);
            self.router.add_source(&current, &chain).await?;

            for parent in self.registry.direct_parents(&current) {
                self.router.route_sources(&current, parent).await?;
                work.push(parent.clone());
            }
        }

        Ok(())
    }
}
