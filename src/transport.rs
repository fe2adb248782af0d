// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Boundary
//!
//! The queue handle never talks to the wire protocol directly. It goes through the
//! three traits of this module: a `Connector` dials an address, a `BrokerConnection`
//! opens channels, and a `BrokerChannel` exposes the primitives the handle needs
//! together with its two asynchronous signals, channel-closed and publish-confirmed.
//!
//! The lapin backed implementation lives in [`crate::channel`].

use crate::{
    consumer::DeliveryStream, errors::AmqpError, exchange::ExchangeConfig, queue::PushOpt,
    queue::QueueConfig,
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Broker acknowledgement of one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub delivery_tag: u64,
    pub ack: bool,
}

/// Receives the reason a channel stopped working.
pub type CloseNotify = UnboundedReceiver<AmqpError>;
/// Receives one `Confirmation` per publish made on the channel.
pub type ConfirmNotify = UnboundedReceiver<Confirmation>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Channel level primitives.
///
/// `notify_close` and `notify_confirm` hand out a fresh receiver on each call and
/// replace the previous sink, so receivers of an earlier registration go quiet.
/// `publish` returns the delivery tag of the message. Only publishes made with
/// `confirm` set produce a `Confirmation` on the confirm signal; the others are
/// never reported.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn confirm_select(&self) -> Result<(), AmqpError>;
    async fn declare_queue(&self, cfg: &QueueConfig) -> Result<(), AmqpError>;
    async fn declare_exchange(&self, cfg: &ExchangeConfig) -> Result<(), AmqpError>;
    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), AmqpError>;
    async fn publish(&self, opt: &PushOpt, body: &[u8], confirm: bool) -> Result<u64, AmqpError>;
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError>;
    fn notify_close(&self) -> CloseNotify;
    fn notify_confirm(&self) -> ConfirmNotify;
    async fn close(&self) -> Result<(), AmqpError>;
}
