// Copyright (c) 2025, The Typebus Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the crate-wide error type for messaging operations.
//! The `MessagingError` enum covers broker I/O failures (connection, channel,
//! declarations, publishing, reads and acknowledgements) as well as the
//! contract-configuration, resolution and lease-protocol error families.

use thiserror::Error;

/// Represents errors that can occur during messaging operations.
///
/// Broker failures carry the name of the offending object where one exists.
/// Lease-protocol violations are distinct variants so callers can tell a
/// double-finish from a double-cancel from a policy timeout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Error establishing a connection to the broker
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

    /// Error binding a destination or source to a source exchange
    #[error("failure to bind `{1}` to `{0}`")]
    BindingError(String, String),

    /// Error unbinding a destination from a source exchange
    #[error("failure to unbind `{1}` from `{0}`")]
    UnbindingError(String, String),

    /// Error publishing a message to the named source
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error reading a message from the named destination
    #[error("failure to read from `{0}`")]
    GetMessageError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message back onto its queue
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeError(String),

    /// Error deleting a queue or exchange during routing removal
    #[error("failure to delete `{0}`")]
    DeleteError(String),

    /// Caller bug in contract configuration: wrong number of direct
    /// contracts on a message type, a blank name, or a self-route.
    #[error("invalid contract configuration: {0}")]
    ContractViolation(String),

    /// No entry in a received contract chain resolves to a bound local type
    #[error("no known contract in chain `{0}`; is a contract binding missing?")]
    UnresolvableContract(String),

    /// The lease was already completed with `finish`
    #[error("message lease was already finished")]
    AlreadyFinished,

    /// The lease was already released with `cancel`
    #[error("message lease was already cancelled")]
    AlreadyCancelled,

    /// The lease timed out and was auto-cancelled before this call
    #[error("message lease already timed out and was returned to the queue")]
    LeaseTimedOut,

    /// A stored prepared message could not be reconstructed from bytes
    #[error("invalid prepared message")]
    InvalidPreparedMessage,

    /// Error encoding or decoding a message body
    #[error("serialisation failure: {0}")]
    SerialisationError(String),
}
