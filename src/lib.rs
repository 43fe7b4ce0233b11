// Copyright (c) 2025, The Typebus Authors
// MIT License
// All rights reserved.

mod otel;

pub mod config;
pub mod connection;
pub mod contract;
pub mod errors;
pub mod messaging;
pub mod pending;
pub mod route_cache;
pub mod router;
pub mod serialise;
pub mod type_router;

pub use config::{ConnectionConfig, Expires, MessagingConfig};
pub use contract::{ContractRegistry, Contracted};
pub use errors::MessagingError;
pub use messaging::MessagingBase;
pub use pending::PendingMessage;
pub use router::{NameFilter, ReducedPermissionRouter};
pub use serialise::PreparedMessage;
