// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Configuration
//!
//! This module provides the immutable declaration a queue handle is created from,
//! and the per-call options of a publish.

use crate::exchange::ExchangeConfig;
use lapin::types::{AMQPValue, FieldTable, LongInt, ShortString};
use serde::Deserialize;

/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Definition of the queue a handle is attached to, plus the exchanges it needs.
///
/// The configuration is set once at handle creation and never mutated. When
/// `nil_queue` is set the queue itself is not declared, only the exchanges; this
/// is meant for handles that only publish.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub addr: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub args: FieldTable,
    pub exchanges: Vec<ExchangeConfig>,
    pub nil_queue: bool,
}

impl QueueConfig {
    /// Creates a new queue configuration for `name` on the broker at `addr`.
    ///
    /// By default, the queue is created with standard settings (non-durable,
    /// non-exclusive, no exchanges).
    pub fn new(name: &str, addr: &str) -> QueueConfig {
        QueueConfig {
            name: name.to_owned(),
            addr: addr.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Declares the queue without waiting for the broker's reply.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Skips the queue declaration, only the exchanges are declared.
    pub fn nil_queue(mut self) -> Self {
        self.nil_queue = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(self, ttl: i32) -> Self {
        self.arg(
            AMQP_HEADERS_MESSAGE_TTL,
            AMQPValue::LongInt(LongInt::from(ttl)),
        )
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(self, max: i32) -> Self {
        self.arg(AMQP_HEADERS_MAX_LENGTH, AMQPValue::LongInt(LongInt::from(max)))
    }

    /// Adds a single argument to the queue declaration.
    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.args.insert(ShortString::from(key), value);
        self
    }

    /// Adds an exchange to declare, and bind to, on every connect.
    pub fn exchange(mut self, exchange: ExchangeConfig) -> Self {
        self.exchanges.push(exchange);
        self
    }

    /// Options used by a publish when the caller gives none: straight to this
    /// queue through the default exchange.
    pub fn default_push_opt(&self) -> PushOpt {
        PushOpt::new("").routing_key(&self.name)
    }
}

/// Options for a single publish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PushOpt {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
}

impl PushOpt {
    /// Publish to `exchange` with an empty routing key.
    ///
    /// # Parameters
    /// * `exchange` - The exchange name, empty for the default exchange
    ///
    /// # Returns
    /// New publish options with every flag unset
    pub fn new(exchange: &str) -> PushOpt {
        PushOpt {
            exchange: exchange.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the routing key the exchange routes the message with.
    ///
    /// # Parameters
    /// * `key` - The routing key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Asks the broker to return the message when no queue is bound to it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Sets the AMQP `immediate` flag. RabbitMQ rejects it since 3.0.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }
}
