// Copyright (c) 2025, The Typebus Authors
// MIT License
// All rights reserved.

//! Cross-version message exchange through the public API only: a "producer"
//! process with a wide contract hierarchy and a "consumer" process that only
//! knows an older, narrower slice of it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use typebus::{
    serialise::MessageSerialiser, ContractRegistry, Contracted, MessagingError, PreparedMessage,
};

const IMSG: &str = "billing.contracts.IMsg";
const IINVOICE: &str = "billing.contracts.IInvoice";
const ICREDIT_NOTE: &str = "billing.contracts.ICreditNote";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CreditNote {
    invoice_number: u64,
    amount_cents: i64,
}

impl Contracted for CreditNote {
    fn direct_contracts() -> &'static [&'static str] {
        &[ICREDIT_NOTE]
    }
}

/// The consumer's view: it predates `ICreditNote` and only decodes invoices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Invoice {
    invoice_number: u64,
}

fn producer_registry() -> ContractRegistry {
    let mut registry = ContractRegistry::new();
    registry
        .declare_contract(IMSG, &[])
        .declare_contract(IINVOICE, &[IMSG])
        .declare_contract(ICREDIT_NOTE, &[IINVOICE]);
    registry
}

fn consumer_registry() -> ContractRegistry {
    let mut registry = ContractRegistry::new();
    registry
        .declare_contract(IMSG, &[])
        .declare_contract(IINVOICE, &[IMSG]);
    registry.bind_decoder::<Invoice>(IINVOICE);
    registry
}

#[test]
fn an_old_consumer_decodes_messages_from_a_newer_producer() {
    let producer = MessageSerialiser::new(Arc::new(producer_registry()));
    let consumer = MessageSerialiser::new(Arc::new(consumer_registry()));

    let note = CreditNote {
        invoice_number: 42,
        amount_cents: -1_500,
    };
    let (body, chain) = producer.serialise(&note).unwrap();
    assert_eq!(
        chain,
        "billing.contracts.ICreditNote;billing.contracts.IInvoice;billing.contracts.IMsg"
    );

    // The consumer has never heard of ICreditNote, but the chain carries the
    // ancestors it does understand.
    let decoded = consumer.deserialise_by_stack(&body, &chain).unwrap();
    let invoice = decoded.downcast::<Invoice>().unwrap();
    assert_eq!(invoice.invoice_number, 42);
}

#[test]
fn messages_survive_store_and_forward_between_processes() {
    let producer = MessageSerialiser::new(Arc::new(producer_registry()));
    let consumer = MessageSerialiser::new(Arc::new(consumer_registry()));

    let note = CreditNote {
        invoice_number: 7,
        amount_cents: 250,
    };
    let prepared = PreparedMessage::from_message(&producer, &note)
        .unwrap()
        .with_correlation_id("order-7781");

    // Persist and restore, as a store-and-forward client would.
    let stored = prepared.to_bytes();
    let restored = PreparedMessage::from_bytes(&stored).unwrap();
    assert_eq!(restored.type_name(), ICREDIT_NOTE);

    let decoded = consumer
        .deserialise_by_stack(restored.body(), restored.contract_type())
        .unwrap();
    assert_eq!(decoded.downcast::<Invoice>().unwrap().invoice_number, 7);
}

#[test]
fn a_fully_foreign_chain_is_reported_not_guessed() {
    let consumer = MessageSerialiser::new(Arc::new(consumer_registry()));
    let result = consumer.deserialise_by_stack(b"{}", "shipping.IParcel;shipping.IThing");
    assert!(matches!(
        result,
        Err(MessagingError::UnresolvableContract(_))
    ));
}
