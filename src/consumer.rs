// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Stream
//!
//! Inbound side of a queue handle. `Queue::stream` subscribes to the configured
//! queue with manual acknowledgement and hands every delivery to the caller, who
//! must `ack` or `nack` it. A delivery left alone stays unacknowledged on the
//! broker and is redelivered once the channel goes away.
//!
//! The stream is bound to the channel it was created on. After a reconnect it
//! simply ends; callers that want to keep consuming call `stream` again.

use crate::{client::Queue, errors::AmqpError, otel::AmqpTracePropagator};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::types::FieldTable;
#[cfg(test)]
use mockall::automock;
use opentelemetry::{global, Context};
use std::{fmt, sync::Arc};
use tracing::debug;

/// Stream of deliveries of one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Settles deliveries on the channel they came from.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// One message handed to the consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub headers: FieldTable,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    /// Creates a delivery settled through `acker`.
    ///
    /// # Parameters
    /// * `delivery_tag` - Tag the broker assigned to the delivery on its channel
    /// * `exchange` - Exchange the message was published to
    /// * `routing_key` - Routing key the message was published with
    /// * `data` - Message body
    /// * `acker` - Settles the delivery on the channel it came from
    ///
    /// # Returns
    /// A first-time delivery without headers
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            data,
            headers: FieldTable::default(),
            acker,
        }
    }

    /// Marks the delivery as a redelivery of an unsettled message.
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Sets the message headers, trace context included.
    pub fn headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    /// Removes the message from the broker.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack(self.delivery_tag).await
    }

    /// Rejects the message, putting it back on the queue when `requeue` is set.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(self.delivery_tag, requeue).await
    }

    /// Trace context the publisher injected into the message headers.
    pub fn trace_context(&self) -> Context {
        let mut headers = self.headers.inner().clone();
        global::get_text_map_propagator(|propagator| {
            propagator.extract(&AmqpTracePropagator::new(&mut headers))
        })
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("data", &self.data.len())
            .finish()
    }
}

impl Queue {
    /// Stream will continuously yield deliveries of the configured queue.
    ///
    /// It is required to call `Delivery::ack` once a message has been processed,
    /// or `Delivery::nack` when it fails. Ignoring this leaves the message
    /// unacknowledged on the broker. Fails with `NotConnected` instead of waiting
    /// for a connection.
    pub async fn stream(&self) -> Result<DeliveryStream, AmqpError> {
        if !self.connected() {
            return Err(AmqpError::NotConnected);
        }

        let Some(session) = self.shared.session().await else {
            return Err(AmqpError::NotConnected);
        };

        debug!(queue = self.shared.config.name, "starting consumer");
        session.channel.consume(&self.shared.config.name).await
    }
}
