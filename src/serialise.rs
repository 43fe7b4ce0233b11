// Copyright (c) 2025, The Typebus Authors
// MIT License
// All rights reserved.

//! # Serialisation and Contract Stack Resolution
//!
//! Message bodies travel as JSON. Alongside the body goes the sender's
//! contract chain string; on receipt the chain is scanned for the first
//! contract the local process can decode, so a consumer written against an
//! older, narrower contract still understands messages from a newer, wider
//! producer.
//!
//! [`PreparedMessage`] is the detached form of an outgoing message, suitable
//! for store-and-forward: it round-trips losslessly through a 3-field
//! `TypeName|ContractType|Body` byte framing.

use crate::{
    contract::{primary_contract, ContractRegistry, Contracted},
    errors::MessagingError,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{any::Any, sync::Arc};

/// Serialises outgoing messages and resolves incoming contract stacks.
#[derive(Debug, Clone)]
pub struct MessageSerialiser {
    registry: Arc<ContractRegistry>,
}

impl MessageSerialiser {
    /// Creates a serialiser over the given contract registry.
    pub fn new(registry: Arc<ContractRegistry>) -> MessageSerialiser {
        MessageSerialiser { registry }
    }

    /// Serialises a message to bytes plus its declared contract chain,
    /// most specific contract first.
    pub fn serialise<T>(&self, message: &T) -> Result<(Vec<u8>, String), MessagingError>
    where
        T: Contracted + Serialize,
    {
        let chain = self.registry.chain_string_of_message::<T>()?;
        let body = serde_json::to_vec(message)
            .map_err(|err| MessagingError::SerialisationError(err.to_string()))?;
        Ok((body, chain))
    }

    /// Decodes bytes directly into a known type.
    pub fn deserialise<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, MessagingError> {
        serde_json::from_slice(data)
            .map_err(|err| MessagingError::SerialisationError(err.to_string()))
    }

    /// Decodes bytes into the first locally bound type named in the chain.
    ///
    /// Fails with a descriptive error when no entry in the chain resolves to
    /// a bound contract in this process.
    pub fn deserialise_by_stack(
        &self,
        data: &[u8],
        chain: &str,
    ) -> Result<Box<dyn Any + Send>, MessagingError> {
        let decoder = self.registry.resolve(chain)?;
        decoder(data)
    }
}

/// A pre-serialised message, detached from the facade.
///
/// Useful for store-and-forward on a client: prepare now, persist the bytes,
/// send later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMessage {
    type_name: String,
    contract_type: String,
    body: Vec<u8>,
    correlation_id: Option<String>,
}

impl PreparedMessage {
    /// Creates a prepared message from its routable type name, contract
    /// chain string and serialised body.
    pub fn new(type_name: &str, contract_type: &str, body: Vec<u8>) -> PreparedMessage {
        PreparedMessage {
            type_name: type_name.to_owned(),
            contract_type: contract_type.to_owned(),
            body,
            correlation_id: None,
        }
    }

    /// Builds a prepared message from a contracted object.
    pub fn from_message<T>(
        serialiser: &MessageSerialiser,
        message: &T,
    ) -> Result<PreparedMessage, MessagingError>
    where
        T: Contracted + Serialize,
    {
        let (body, chain) = serialiser.serialise(message)?;
        Ok(PreparedMessage::new(primary_contract::<T>()?, &chain, body))
    }

    /// Routable type name: the entry point into the exchange graph.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Contract chain string used for routing metadata and resolution.
    pub fn contract_type(&self) -> &str {
        &self.contract_type
    }

    /// Serialised message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Correlation id to send with, if one was attached.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Attaches an explicit correlation id.
    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    /// Renders the storable byte form: `TypeName|ContractType|Body`.
    ///
    /// The body may itself contain `|`; only the first two delimiters are
    /// structural.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(self.type_name.len() + self.contract_type.len() + self.body.len() + 2);
        bytes.extend_from_slice(self.type_name.as_bytes());
        bytes.push(b'|');
        bytes.extend_from_slice(self.contract_type.as_bytes());
        bytes.push(b'|');
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Restores a prepared message from its storable byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<PreparedMessage, MessagingError> {
        let first = bytes
            .iter()
            .position(|b| *b == b'|')
            .ok_or(MessagingError::InvalidPreparedMessage)?;
        let second = bytes[first + 1..]
            .iter()
            .position(|b| *b == b'|')
            .map(|offset| first + 1 + offset)
            .ok_or(MessagingError::InvalidPreparedMessage)?;

        let type_name = std::str::from_utf8(&bytes[..first])
            .map_err(|_| MessagingError::InvalidPreparedMessage)?;
        let contract_type = std::str::from_utf8(&bytes[first + 1..second])
            .map_err(|_| MessagingError::InvalidPreparedMessage)?;

        Ok(PreparedMessage::new(
            type_name,
            contract_type,
            bytes[second + 1..].to_vec(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::examples::*;

    fn serialiser() -> MessageSerialiser {
        let mut registry = registry();
        registry.bind_decoder::<SuperMetadata>(IMETADATA_FILE);
        MessageSerialiser::new(Arc::new(registry))
    }

    #[test]
    fn serialise_produces_the_full_chain_most_specific_first() {
        let (body, chain) = serialiser().serialise(&SuperMetadata::default()).unwrap();
        assert!(chain.starts_with("example.types.IMetadataFile;"));
        assert!(chain.ends_with(";example.types.IMsg"));
        assert!(!body.is_empty());
    }

    #[test]
    fn serialise_rejects_messages_without_a_single_direct_contract() {
        let mut registry = registry();
        registry.bind_decoder::<SuperMetadata>(IMETADATA_FILE);
        let serialiser = MessageSerialiser::new(Arc::new(registry));

        #[derive(serde::Serialize)]
        struct Loose;
        impl Contracted for Loose {
            fn direct_contracts() -> &'static [&'static str] {
                &[]
            }
        }

        assert!(matches!(
            serialiser.serialise(&Loose),
            Err(MessagingError::ContractViolation(_))
        ));
    }

    #[test]
    fn stack_resolution_falls_back_past_unknown_newest_types() {
        let serialiser = serialiser();
        let original = SuperMetadata::default();
        let (body, chain) = serialiser.serialise(&original).unwrap();

        // Pretend the producer had a newer, locally unknown contract on top.
        let wider_chain = format!("example.types.INewerThing;{chain}");
        let resolved = serialiser.deserialise_by_stack(&body, &wider_chain).unwrap();
        let resolved = resolved.downcast::<SuperMetadata>().unwrap();
        assert_eq!(*resolved, original);
    }

    #[test]
    fn stack_resolution_reports_fully_unknown_chains() {
        let serialiser = serialiser();
        assert!(matches!(
            serialiser.deserialise_by_stack(b"{}", "a.IX;b.IY"),
            Err(MessagingError::UnresolvableContract(_))
        ));
    }

    #[test]
    fn direct_deserialise_round_trips() {
        let serialiser = serialiser();
        let original = SuperMetadata::default();
        let (body, _) = serialiser.serialise(&original).unwrap();
        let back: SuperMetadata = serialiser.deserialise(&body).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn prepared_message_round_trips_through_bytes() {
        let prepared = PreparedMessage::new(
            "example.types.IMetadataFile",
            "example.types.IMetadataFile;example.types.IMsg",
            b"{\"x\":1}".to_vec(),
        );
        let back = PreparedMessage::from_bytes(&prepared.to_bytes()).unwrap();
        assert_eq!(back, prepared);
    }

    #[test]
    fn prepared_message_body_may_contain_delimiters_and_raw_bytes() {
        let body = vec![0u8, b'|', 255, b'|', 1, 2, 3];
        let prepared = PreparedMessage::new("t.IName", "t.IName", body.clone());
        let back = PreparedMessage::from_bytes(&prepared.to_bytes()).unwrap();
        assert_eq!(back.body(), body.as_slice());
        assert_eq!(back.type_name(), "t.IName");
    }

    #[test]
    fn prepared_message_with_too_few_fields_is_rejected() {
        assert_eq!(
            PreparedMessage::from_bytes(b"only-one-field"),
            Err(MessagingError::InvalidPreparedMessage)
        );
        assert_eq!(
            PreparedMessage::from_bytes(b"two|fields"),
            Err(MessagingError::InvalidPreparedMessage)
        );
    }

    #[test]
    fn empty_body_round_trips() {
        let prepared = PreparedMessage::new("t.IName", "t.IName;t.IMsg", Vec::new());
        let back = PreparedMessage::from_bytes(&prepared.to_bytes()).unwrap();
        assert!(back.body().is_empty());
    }

    #[test]
    fn explicit_correlation_id_is_preserved_on_the_prepared_path() {
        let prepared = PreparedMessage::new("t.IName", "t.IName", Vec::new())
            .with_correlation_id("corr-1234");
        assert_eq!(prepared.correlation_id(), Some("corr-1234"));
    }
}
