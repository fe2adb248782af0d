// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport traits, with knobs to make dials
//! fail, script publisher confirms and drop the current channel.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use rabbitmq_queue::{
    consumer::{Acknowledger, Delivery, DeliveryStream},
    errors::AmqpError,
    exchange::{ExchangeConfig, ExchangeKind},
    queue::{PushOpt, QueueConfig},
    transport::{
        BrokerChannel, BrokerConnection, CloseNotify, ConfirmNotify, Confirmation, Connector,
    },
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedSender};

/// What the broker answers to one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    Ack,
    Nack,
    Silent,
    /// Held back until `FakeBroker::release_deferred`, then acked.
    Deferred,
}

/// Broker visible topology: exchanges, queues and (exchange, routing key, queue)
/// bindings.
pub type Topology = (
    BTreeMap<String, ExchangeKind>,
    BTreeSet<String>,
    BTreeSet<(String, String, String)>,
);

#[derive(Default)]
pub struct BrokerState {
    pub dial_failures: usize,
    pub dials: usize,
    pub channels: usize,
    pub exchanges: BTreeMap<String, ExchangeKind>,
    pub exchange_declares: usize,
    pub queues: BTreeSet<String>,
    pub queue_declares: usize,
    pub bindings: BTreeSet<(String, String, String)>,
    pub confirm_mode: bool,
    pub confirms: VecDeque<Confirm>,
    pub publishes: Vec<(PushOpt, Vec<u8>)>,
    pub confirms_sent: usize,
    pub stall_channels: bool,
    pub ready: HashMap<String, VecDeque<(String, String, Vec<u8>, bool)>>,
    pub unacked: BTreeMap<u64, (String, String, String, Vec<u8>)>,
    pub channel_closes: usize,
    pub connection_closes: usize,
    pub fail_channel_close: bool,
    live_channel: Option<usize>,
    next_delivery: u64,
    publish_tag: u64,
    deferred: Vec<u64>,
    consumers: HashMap<String, UnboundedSender<Result<Delivery, AmqpError>>>,
    close_tx: Option<UnboundedSender<AmqpError>>,
    confirm_tx: Option<UnboundedSender<Confirmation>>,
}

impl BrokerState {
    fn send_confirm(&mut self, delivery_tag: u64, ack: bool) {
        if let Some(tx) = self.confirm_tx.as_ref() {
            if tx.send(Confirmation { delivery_tag, ack }).is_ok() {
                self.confirms_sent += 1;
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> FakeBroker {
        FakeBroker::default()
    }

    pub fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            broker: self.clone(),
        })
    }

    pub fn fail_dials(&self, count: usize) {
        self.state().dial_failures = count;
    }

    pub fn script_confirms(&self, confirms: &[Confirm]) {
        self.state().confirms = confirms.iter().copied().collect();
    }

    /// Acks every publish scripted as `Confirm::Deferred`, oldest first.
    pub fn release_deferred(&self) {
        let mut state = self.state();
        let deferred = std::mem::take(&mut state.deferred);
        for delivery_tag in deferred {
            state.send_confirm(delivery_tag, true);
        }
    }

    pub fn topology(&self) -> Topology {
        let state = self.state();
        (
            state.exchanges.clone(),
            state.queues.clone(),
            state.bindings.clone(),
        )
    }

    /// Drops the current channel: consumers end, unacked messages go back to
    /// their queue and the close signal fires.
    pub fn kill_channel(&self) {
        let mut state = self.state();
        state.live_channel = None;
        state.consumers.clear();

        let unacked = std::mem::take(&mut state.unacked);
        for (_, (queue, exchange, routing_key, body)) in unacked {
            state
                .ready
                .entry(queue)
                .or_default()
                .push_back((exchange, routing_key, body, true));
        }

        state.confirm_tx = None;
        state.deferred.clear();
        if let Some(tx) = state.close_tx.take() {
            let _ = tx.send(AmqpError::ChannelClosed("connection reset".to_owned()));
        }
    }

    /// Forgets the whole topology, as a broker restart without durable state
    /// would, and drops the channel.
    pub fn restart(&self) {
        {
            let mut state = self.state();
            state.exchanges.clear();
            state.queues.clear();
            state.bindings.clear();
            state.ready.clear();
        }
        self.kill_channel();
    }

    pub fn delivered(&self, queue: &str) -> usize {
        let state = self.state();
        state
            .unacked
            .values()
            .filter(|(q, _, _, _)| q == queue)
            .count()
    }

    pub async fn wait_until<F>(&self, cond: F)
    where
        F: Fn(&BrokerState) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if cond(&self.state()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("broker never reached the expected state");
    }

    fn route(&self, opt: &PushOpt, body: &[u8]) -> Result<(), AmqpError> {
        let targets: Vec<String> = {
            let state = self.state();
            if opt.exchange.is_empty() {
                state
                    .queues
                    .iter()
                    .filter(|q| **q == opt.routing_key)
                    .cloned()
                    .collect()
            } else {
                let kind = state
                    .exchanges
                    .get(&opt.exchange)
                    .ok_or_else(|| AmqpError::PublishingError(opt.exchange.clone()))?;
                state
                    .bindings
                    .iter()
                    .filter(|(exch, key, _)| {
                        *exch == opt.exchange
                            && (*kind == ExchangeKind::Fanout || *key == opt.routing_key)
                    })
                    .map(|(_, _, queue)| queue.clone())
                    .collect()
            }
        };

        for queue in targets {
            self.deliver(&queue, &opt.exchange, &opt.routing_key, body.to_vec(), false);
        }
        Ok(())
    }

    fn deliver(&self, queue: &str, exchange: &str, routing_key: &str, body: Vec<u8>, redelivered: bool) {
        let mut state = self.state();
        let Some(consumer) = state.consumers.get(queue).cloned() else {
            state.ready.entry(queue.to_owned()).or_default().push_back((
                exchange.to_owned(),
                routing_key.to_owned(),
                body,
                redelivered,
            ));
            return;
        };

        state.next_delivery += 1;
        let tag = state.next_delivery;
        state.unacked.insert(
            tag,
            (
                queue.to_owned(),
                exchange.to_owned(),
                routing_key.to_owned(),
                body.clone(),
            ),
        );

        let delivery = Delivery::new(
            tag,
            exchange,
            routing_key,
            body,
            Arc::new(FakeAcker {
                broker: self.clone(),
            }),
        )
        .redelivered(redelivered);
        let _ = consumer.send(Ok(delivery));
    }
}

struct FakeConnector {
    broker: FakeBroker,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.broker.state();
        state.dials += 1;
        if state.dial_failures > 0 {
            state.dial_failures -= 1;
            return Err(AmqpError::ConnectionError(format!("{} unreachable", addr)));
        }

        Ok(Arc::new(FakeConnection {
            broker: self.broker.clone(),
        }))
    }
}

pub struct FakeConnection {
    broker: FakeBroker,
}

impl FakeConnection {
    pub fn new(broker: &FakeBroker) -> FakeConnection {
        FakeConnection {
            broker: broker.clone(),
        }
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let stall = self.broker.state().stall_channels;
        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.broker.state();
        state.channels += 1;
        state.publish_tag = 0;
        state.live_channel = Some(state.channels);

        Ok(Arc::new(FakeChannel {
            broker: self.broker.clone(),
            id: state.channels,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.state().connection_closes += 1;
        Ok(())
    }
}

struct FakeChannel {
    broker: FakeBroker,
    id: usize,
}

impl FakeChannel {
    fn live(&self) -> Result<(), AmqpError> {
        match self.broker.state().live_channel {
            Some(id) if id == self.id => Ok(()),
            _ => Err(AmqpError::ChannelClosed(format!("channel {} is gone", self.id))),
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.broker.state().confirm_mode = true;
        Ok(())
    }

    async fn declare_queue(&self, cfg: &QueueConfig) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.queue_declares += 1;
        state.queues.insert(cfg.name.clone());
        Ok(())
    }

    async fn declare_exchange(&self, cfg: &ExchangeConfig) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.exchange_declares += 1;

        match state.exchanges.get(&cfg.name) {
            Some(kind) if *kind != cfg.kind => Err(AmqpError::DeclareExchangeError(cfg.name.clone())),
            _ => {
                state.exchanges.insert(cfg.name.clone(), cfg.kind.clone());
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        if !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        state.bindings.insert((
            exchange.to_owned(),
            routing_key.to_owned(),
            queue.to_owned(),
        ));
        Ok(())
    }

    async fn publish(&self, opt: &PushOpt, body: &[u8], confirm: bool) -> Result<u64, AmqpError> {
        self.live()?;
        self.broker.route(opt, body)?;

        let mut state = self.broker.state();
        state.publishes.push((opt.clone(), body.to_vec()));
        state.publish_tag += 1;
        let delivery_tag = state.publish_tag;

        let scripted = state.confirms.pop_front().unwrap_or(Confirm::Ack);
        if !confirm {
            return Ok(delivery_tag);
        }

        match scripted {
            Confirm::Ack => state.send_confirm(delivery_tag, true),
            Confirm::Nack => state.send_confirm(delivery_tag, false),
            Confirm::Silent => {}
            Confirm::Deferred => state.deferred.push(delivery_tag),
        }

        Ok(delivery_tag)
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        self.live()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let ready = {
            let mut state = self.broker.state();
            if !state.queues.contains(queue) {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }
            state.consumers.insert(queue.to_owned(), tx);
            state.ready.remove(queue).unwrap_or_default()
        };

        for (exchange, routing_key, body, redelivered) in ready {
            self.broker
                .deliver(queue, &exchange, &routing_key, body, redelivered);
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    fn notify_close(&self) -> CloseNotify {
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.state().close_tx = Some(tx);
        rx
    }

    fn notify_confirm(&self) -> ConfirmNotify {
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.state().confirm_tx = Some(tx);
        rx
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_closes += 1;
        state.consumers.clear();
        if state.fail_channel_close {
            return Err(AmqpError::ClosingError("channel".to_owned()));
        }
        Ok(())
    }
}

struct FakeAcker {
    broker: FakeBroker,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self.broker.state().unacked.remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(AmqpError::AckMessageError),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let removed = self.broker.state().unacked.remove(&delivery_tag);
        let Some((queue, exchange, routing_key, body)) = removed else {
            return Err(AmqpError::NackMessageError);
        };

        if requeue {
            self.broker.deliver(&queue, &exchange, &routing_key, body, true);
        }
        Ok(())
    }
}

/// Opens a bare channel on the fake broker, outside of any queue handle.
pub async fn open_channel(broker: &FakeBroker) -> Arc<dyn BrokerChannel> {
    FakeConnection::new(broker).open_channel().await.unwrap()
}
