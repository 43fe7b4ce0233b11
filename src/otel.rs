// Copyright (c) 2025, The Typebus Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! The current trace context rides in outgoing message headers so a receive
//! elsewhere can be correlated with the publish that caused it. The carrier
//! adapts the AMQP header table to the OpenTelemetry `Injector` trait.

use lapin::types::{AMQPValue, ShortString};
use opentelemetry::{global, propagation::Injector, Context};
use std::collections::BTreeMap;

/// Adapter between AMQP message headers and OpenTelemetry propagation.
pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Injects the current trace context into outgoing message headers.
pub(crate) fn inject_context(headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&Context::current(), &mut HeaderCarrier::new(headers))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    #[test]
    fn carrier_lowercases_keys_and_stores_long_strings() {
        let mut headers = BTreeMap::new();
        HeaderCarrier::new(&mut headers).set("TraceParent", "00-abc123".to_owned());

        assert_eq!(
            headers.get(&ShortString::from("traceparent")),
            Some(&AMQPValue::LongString(LongString::from("00-abc123")))
        );
    }

    #[test]
    fn injection_without_a_configured_propagator_leaves_headers_untouched() {
        let mut headers = BTreeMap::new();
        inject_context(&mut headers);
        assert!(headers.is_empty());
    }
}
