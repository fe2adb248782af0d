// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through AMQP message headers: the publisher injects
//! the current context and `Delivery::trace_context` extracts it on the consumer
//! side.

use lapin::types::{AMQPValue, ShortString};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};
use std::collections::BTreeMap;
use tracing::error;

/// An adapter for injecting and extracting OpenTelemetry context from AMQP headers.
pub(crate) struct AmqpTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> AmqpTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for AmqpTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for AmqpTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Headers carrying the current trace context.
pub(crate) fn current_context_headers() -> BTreeMap<ShortString, AMQPValue> {
    let mut headers = BTreeMap::default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(
            &Context::current(),
            &mut AmqpTracePropagator::new(&mut headers),
        )
    });

    headers
}
