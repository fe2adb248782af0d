// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient RabbitMQ Queue Handle
//!
//! A `Queue` keeps one connection and channel to RabbitMQ alive for as long as it
//! lives. A background supervisor reconnects after broker or network failures and
//! declares the queue, its exchanges and bindings again after every reconnect.
//! On top of it `push` publishes with publisher confirms and retries until the
//! broker acknowledges, and `stream` hands out deliveries to acknowledge manually.

mod otel;
mod supervisor;

pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod topology;
pub mod transport;

pub use client::{ConnectionState, Queue};
pub use config::{BrokerConfigs, RetryPolicy};
pub use consumer::{Delivery, DeliveryStream};
pub use errors::AmqpError;
pub use exchange::{ExchangeConfig, ExchangeKind};
pub use queue::{PushOpt, QueueConfig};
pub use tokio_util::sync::CancellationToken;
