// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Configuration
//!
//! This module provides the types used to describe the exchanges a queue handle
//! depends on. Each `ExchangeConfig` is declared on every (re)connect and, for each
//! of its binding routes, the owning queue is bound to it.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use serde::Deserialize;

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    #[serde(rename = "x-delayed-message")]
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Declaration of one exchange and the routes the owning queue binds to it.
///
/// An empty `bind_routes` list declares the exchange without binding the queue,
/// which is what publisher-only handles use.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_deleted: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub args: FieldTable,
    pub bind_routes: Vec<String>,
}

impl ExchangeConfig {
    /// Creates a new direct exchange configuration with the given name.
    pub fn new(name: &str) -> ExchangeConfig {
        ExchangeConfig {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The routing behavior of the exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Routes on an exact routing key match.
    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    /// Broadcasts to every bound queue.
    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Routes on routing key patterns.
    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Creates a delayed exchange routing like `inner` once the delay expires.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn delayed(mut self, inner: &str) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.args.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(inner)),
        );
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_deleted(mut self) -> Self {
        self.auto_deleted = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Declares the exchange without waiting for the broker's reply.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Adds a single argument to the exchange declaration.
    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.args.insert(ShortString::from(key), value);
        self
    }

    /// Appends a routing key the owning queue is bound with.
    pub fn bind(mut self, routing_key: &str) -> Self {
        self.bind_routes.push(routing_key.to_owned());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_exchange_carries_inner_type() {
        let exch = ExchangeConfig::new("later").delayed("fanout");

        assert_eq!(exch.kind, ExchangeKind::XMessageDelayed);
        assert_eq!(
            exch.args.inner().get(&ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE)),
            Some(&AMQPValue::LongString(LongString::from("fanout")))
        );
        assert!(matches!(
            lapin::ExchangeKind::from(&exch.kind),
            lapin::ExchangeKind::Custom(ref kind) if kind == "x-delayed-message"
        ));
    }

    #[test]
    fn builder_keeps_route_order() {
        let exch = ExchangeConfig::new("events").topic().durable().bind("a.*").bind("b.#");

        assert_eq!(exch.bind_routes, vec!["a.*".to_owned(), "b.#".to_owned()]);
        assert!(exch.durable);
        assert!(!exch.auto_deleted);
    }

    #[test]
    fn deserializes_with_defaults() {
        let exch: ExchangeConfig = serde_json::from_str(
            r#"{ "name": "logs", "kind": "fanout", "durable": true, "bind_routes": [""] }"#,
        )
        .unwrap();

        assert_eq!(exch, ExchangeConfig::new("logs").fanout().durable().bind(""));
    }
}
