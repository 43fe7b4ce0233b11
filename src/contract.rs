// Copyright (c) 2025, The Typebus Authors
// MIT License
// All rights reserved.

//! # Contract Registry
//!
//! Messages are classified by *contract* identifiers: namespace-qualified
//! names forming an inheritance DAG (a contract may extend several parents).
//! The registry is the explicit, startup-time declaration of that DAG plus
//! the concrete types that decode each contract. It replaces any runtime
//! type introspection: everything the routing and resolution layers need is
//! registered here ahead of time.
//!
//! The ancestor chain of a contract — the contract itself plus every
//! transitive parent, deduplicated, most specific first — drives both the
//! exchange topology and cross-version deserialisation.

use crate::errors::MessagingError;
use serde::de::DeserializeOwned;
use std::{
    any::Any,
    collections::{HashMap, HashSet},
    fmt,
};

/// Separator between entries in a rendered contract chain.
pub const CHAIN_SEPARATOR: char = ';';

/// A message type's declared contracts.
///
/// Implementations list the contract identifiers declared *directly* on the
/// type — not the transitive ancestors, which come from the registry DAG.
/// A well-configured message type declares exactly one.
pub trait Contracted {
    /// Contract identifiers declared directly on this message type.
    fn direct_contracts() -> &'static [&'static str];
}

/// The single direct contract of a message type.
///
/// Zero or multiple direct contracts is a configuration error: it is the
/// law that gives every message a well-defined primary contract.
pub fn primary_contract<T: Contracted>() -> Result<&'static str, MessagingError> {
    match T::direct_contracts() {
        [only] => Ok(only),
        others => Err(MessagingError::ContractViolation(format!(
            "message type `{}` must declare exactly one direct contract, found {}",
            std::any::type_name::<T>(),
            others.len()
        ))),
    }
}

/// Strips assembly/build metadata from a qualified contract name.
///
/// Resolution must work across processes with different build metadata but
/// matching logical names, so everything from the first `,` is dropped while
/// namespace qualification is kept.
pub fn shorten(name: &str) -> &str {
    match name.find(',') {
        Some(idx) if idx >= 1 => &name[..idx],
        _ => name,
    }
}

type Decoder = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, MessagingError> + Send + Sync>;

/// Startup-time table of contracts, their parent edges and bound decoders.
#[derive(Default)]
pub struct ContractRegistry {
    parents: HashMap<String, Vec<String>>,
    decoders: HashMap<String, Decoder>,
    contract_root: Option<String>,
}

impl fmt::Debug for ContractRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractRegistry")
            .field("contracts", &self.parents.len())
            .field("decoders", &self.decoders.len())
            .field("contract_root", &self.contract_root)
            .finish()
    }
}

impl ContractRegistry {
    /// Creates an empty registry.
    pub fn new() -> ContractRegistry {
        ContractRegistry::default()
    }

    /// Declares a contract and its direct parents.
    ///
    /// Declaration order of the parents is meaningful: it fixes the sibling
    /// order in rendered chains. Re-declaring a contract replaces its edges.
    pub fn declare_contract(&mut self, id: &str, parents: &[&str]) -> &mut Self {
        self.parents.insert(
            id.to_owned(),
            parents.iter().map(|p| (*p).to_owned()).collect(),
        );
        self
    }

    /// Binds the concrete type that deserialises a contract.
    ///
    /// Received messages claiming this contract (anywhere in their chain)
    /// decode into `C`. Re-binding replaces the previous decoder.
    pub fn bind_decoder<C>(&mut self, contract: &str) -> &mut Self
    where
        C: DeserializeOwned + Any + Send + 'static,
    {
        self.decoders.insert(
            contract.to_owned(),
            Box::new(|data: &[u8]| {
                serde_json::from_slice::<C>(data)
                    .map(|value| Box::new(value) as Box<dyn Any + Send>)
                    .map_err(|err| MessagingError::SerialisationError(err.to_string()))
            }),
        );
        self
    }

    /// Constrains resolution to contract names under the given root.
    pub fn set_contract_root(&mut self, root: &str) -> &mut Self {
        self.contract_root = Some(root.to_owned());
        self
    }

    /// Direct parents of a contract; unknown contracts have none.
    pub fn direct_parents(&self, id: &str) -> &[String] {
        self.parents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The ancestor chain of a contract, most specific first.
    ///
    /// Sibling groups are taken in declaration order before recursing into
    /// each sibling's own parents, and every contract appears exactly once at
    /// its first-discovered position (diamonds collapse). Each contract's
    /// parent group is expanded at most once, so a cyclic declaration
    /// terminates with a finite chain rather than recursing forever.
    pub fn chain_of(&self, contract: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut expanded = HashSet::new();
        self.collect(&[contract.to_owned()], &mut chain, &mut expanded);
        chain
    }

    /// The ancestor chain rendered as a `;`-joined string.
    pub fn chain_string_of(&self, contract: &str) -> String {
        self.chain_of(contract)
            .join(&CHAIN_SEPARATOR.to_string())
    }

    /// The rendered chain for a message type's primary contract.
    pub fn chain_string_of_message<T: Contracted>(&self) -> Result<String, MessagingError> {
        Ok(self.chain_string_of(primary_contract::<T>()?))
    }

    fn collect(&self, group: &[String], chain: &mut Vec<String>, expanded: &mut HashSet<String>) {
        for id in group {
            if !chain.contains(id) {
                chain.push(id.clone());
            }
        }
        for id in group {
            if !expanded.insert(id.clone()) {
                continue;
            }
            let parents = self.direct_parents(id).to_vec();
            if !parents.is_empty() {
                self.collect(&parents, chain, expanded);
            }
        }
    }

    /// Finds the decoder for the first resolvable entry in a received chain.
    ///
    /// Entries are scanned left to right (most specific first) with assembly
    /// metadata stripped. With a contract root configured, only the first
    /// entry under the root is considered and there is no fallback scan past
    /// it; ties within the root resolve first-wins like the unconstrained
    /// path.
    pub(crate) fn resolve(&self, chain: &str) -> Result<&Decoder, MessagingError> {
        let entries = chain
            .split(CHAIN_SEPARATOR)
            .map(|entry| shorten(entry.trim()))
            .filter(|entry| !entry.is_empty());

        let unresolvable = || MessagingError::UnresolvableContract(chain.to_owned());

        match &self.contract_root {
            Some(root) => {
                let candidate = entries
                    .into_iter()
                    .find(|entry| entry.starts_with(root.as_str()))
                    .ok_or_else(unresolvable)?;
                self.decoders.get(candidate).ok_or_else(unresolvable)
            }
            None => entries
                .into_iter()
                .find_map(|entry| self.decoders.get(entry))
                .ok_or_else(unresolvable),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::examples::*;
    use super::*;

    #[test]
    fn chain_is_ordered_deduplicated_and_ends_at_the_most_general_ancestor() {
        let registry = registry();
        assert_eq!(
            registry.chain_string_of(IMETADATA_FILE),
            "example.types.IMetadataFile;example.types.IFile;\
             example.types.IHash;example.types.IPath;example.types.IMsg"
        );
    }

    #[test]
    fn diamond_ancestors_appear_once_at_first_discovered_position() {
        let registry = registry();
        let chain = registry.chain_of(IFILE);
        assert_eq!(chain, vec![IFILE, IHASH, IPATH, IMSG]);
        assert_eq!(chain.iter().filter(|c| c.as_str() == IMSG).count(), 1);
    }

    #[test]
    fn mutually_recursive_declarations_terminate_with_each_contract_once() {
        let mut registry = ContractRegistry::new();
        registry
            .declare_contract("a.IOne", &["a.ITwo"])
            .declare_contract("a.ITwo", &["a.IOne"]);

        assert_eq!(registry.chain_of("a.IOne"), vec!["a.IOne", "a.ITwo"]);
        assert_eq!(registry.chain_of("a.ITwo"), vec!["a.ITwo", "a.IOne"]);
    }

    #[test]
    fn self_referential_declarations_terminate() {
        let mut registry = ContractRegistry::new();
        registry.declare_contract("a.ISelf", &["a.ISelf"]);
        assert_eq!(registry.chain_of("a.ISelf"), vec!["a.ISelf"]);
    }

    #[test]
    fn unknown_contracts_chain_to_themselves() {
        let registry = ContractRegistry::new();
        assert_eq!(registry.chain_of("nowhere.IUnknown"), vec!["nowhere.IUnknown"]);
    }

    #[test]
    fn primary_contract_requires_exactly_one_direct_contract() {
        assert_eq!(primary_contract::<SuperMetadata>(), Ok(IMETADATA_FILE));
        assert!(matches!(
            primary_contract::<Unregistered>(),
            Err(MessagingError::ContractViolation(_))
        ));
        assert!(matches!(
            primary_contract::<DoubleContract>(),
            Err(MessagingError::ContractViolation(_))
        ));
    }

    #[test]
    fn shorten_strips_assembly_metadata_but_keeps_namespaces() {
        assert_eq!(
            shorten("example.types.IMsg, Example.Types, Version=1.0.0"),
            "example.types.IMsg"
        );
        assert_eq!(shorten("example.types.IMsg"), "example.types.IMsg");
        assert_eq!(shorten(",weird"), ",weird");
    }

    #[test]
    fn resolve_prefers_the_most_specific_bound_contract() {
        let mut registry = registry();
        registry.bind_decoder::<SuperMetadata>(IMETADATA_FILE);
        registry.bind_decoder::<SuperMetadata>(IMSG);

        let data = serde_json::to_vec(&SuperMetadata::default()).unwrap();
        let chain = registry.chain_string_of(IMETADATA_FILE);
        let decoder = registry.resolve(&chain).unwrap();
        assert!(decoder(&data).unwrap().downcast::<SuperMetadata>().is_ok());
    }

    #[test]
    fn resolve_skips_unknown_entries_to_the_first_bound_ancestor() {
        let mut registry = registry();
        registry.bind_decoder::<SuperMetadata>(IFILE);

        let chain = format!("nowhere.INewest;{}", registry.chain_string_of(IFILE));
        assert!(registry.resolve(&chain).is_ok());
    }

    #[test]
    fn resolve_fails_with_the_chain_in_the_error_when_nothing_is_bound() {
        let registry = registry();
        let chain = registry.chain_string_of(IMSG);
        match registry.resolve(&chain) {
            Err(MessagingError::UnresolvableContract(reported)) => assert_eq!(reported, chain),
            other => panic!("expected an unresolvable-contract error, got {:?}", other.err()),
        }
    }

    #[test]
    fn contract_root_disables_the_fallback_scan() {
        let mut registry = registry();
        registry
            .bind_decoder::<SuperMetadata>(IMSG)
            .set_contract_root("example.types");

        // First in-root entry is IMetadataFile, which has no decoder bound:
        // no fallback scan down to IMsg is permitted.
        let chain = registry.chain_string_of(IMETADATA_FILE);
        assert!(matches!(
            registry.resolve(&chain),
            Err(MessagingError::UnresolvableContract(_))
        ));

        // Out-of-root entries are never considered.
        assert!(matches!(
            registry.resolve("other.ns.IThing"),
            Err(MessagingError::UnresolvableContract(_))
        ));
    }

    #[test]
    fn assembly_qualified_entries_resolve_after_shortening() {
        let mut registry = registry();
        registry.bind_decoder::<SuperMetadata>(IMSG);

        let chain = "example.types.IMsg, Example.Types, Version=2.1.0";
        assert!(registry.resolve(chain).is_ok());
    }
}
