// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel
//!
//! lapin backed implementation of the transport traits. This is what a queue handle
//! uses unless a different `Connector` is supplied.
//!
//! lapin reports broker and network failures through `on_error` callbacks and
//! publisher confirms through one future per publish. Errors and the confirms of
//! publishes that asked for one are forwarded into the unbounded receivers handed
//! out by `notify_close` and `notify_confirm`; other confirms are dropped.

use crate::{
    consumer::{Acknowledger, Delivery, DeliveryStream},
    errors::AmqpError,
    exchange::ExchangeConfig,
    otel,
    queue::{PushOpt, QueueConfig},
    transport::{BrokerChannel, BrokerConnection, CloseNotify, ConfirmNotify, Confirmation, Connector},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation as LapinConfirmation,
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Content type set on every published message
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

const REPLY_SUCCESS: u16 = 200;

/// Replaceable sink for one of the notification signals.
struct Sink<T>(Mutex<Option<UnboundedSender<T>>>);

impl<T> Sink<T> {
    fn empty() -> Sink<T> {
        Sink(Mutex::new(None))
    }

    fn replace(&self, tx: UnboundedSender<T>) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(tx);
        }
    }

    fn send(&self, value: T) {
        if let Ok(slot) = self.0.lock() {
            if let Some(tx) = slot.as_ref() {
                let _ = tx.send(value);
            }
        }
    }

    fn sender(&self) -> Option<UnboundedSender<T>> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Dials RabbitMQ with lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector {
    connection_name: Option<String>,
}

impl LapinConnector {
    /// Creates a connector with lapin's default connection properties.
    pub fn new() -> LapinConnector {
        LapinConnector::default()
    }

    /// Name shown for the connection in the broker management UI.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        let conn = match Connection::connect(addr, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let closed = Arc::new(Sink::empty());
        let sink = closed.clone();
        conn.on_error(move |err| {
            sink.send(AmqpError::ChannelClosed(err.to_string()));
        });

        Ok(Arc::new(LapinConnection { conn, closed }))
    }
}

/// A lapin connection.
///
/// Connection level errors are delivered to the close signal of the channels it
/// opened.
pub struct LapinConnection {
    conn: Connection,
    closed: Arc<Sink<AmqpError>>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel {
                    channel,
                    closed: self.closed.clone(),
                    confirms: Arc::new(Sink::empty()),
                    next_tag: AtomicU64::new(0),
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::ClosingError(err.to_string())
            })
    }
}

/// A lapin channel.
///
/// Delivery tags are counted locally, one per publish, starting at 1; each is
/// paired with the `PublisherConfirm` lapin returned for that publish.
pub struct LapinChannel {
    channel: Channel,
    closed: Arc<Sink<AmqpError>>,
    confirms: Arc<Sink<Confirmation>>,
    next_tag: AtomicU64,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ConfirmSelectError(err.to_string())
            })
    }

    async fn declare_queue(&self, cfg: &QueueConfig) -> Result<(), AmqpError> {
        debug!("creating queue: {}", cfg.name);

        match self
            .channel
            .queue_declare(
                &cfg.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: cfg.durable,
                    exclusive: cfg.exclusive,
                    auto_delete: cfg.auto_delete,
                    nowait: cfg.no_wait,
                },
                cfg.args.clone(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = cfg.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(cfg.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", cfg.name);
                Ok(())
            }
        }
    }

    async fn declare_exchange(&self, cfg: &ExchangeConfig) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &cfg.name,
                lapin::ExchangeKind::from(&cfg.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: cfg.durable,
                    auto_delete: cfg.auto_deleted,
                    internal: cfg.internal,
                    nowait: cfg.no_wait,
                },
                cfg.args.clone(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = cfg.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(cfg.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn publish(&self, opt: &PushOpt, body: &[u8], confirm: bool) -> Result<u64, AmqpError> {
        let pending = match self
            .channel
            .basic_publish(
                &opt.exchange,
                &opt.routing_key,
                BasicPublishOptions {
                    mandatory: opt.mandatory,
                    immediate: opt.immediate,
                },
                body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(TEXT_CONTENT_TYPE))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(FieldTable::from(otel::current_context_headers())),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(pending) => Ok(pending),
        }?;

        let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        if !confirm {
            return Ok(delivery_tag);
        }

        if let Some(tx) = self.confirms.sender() {
            tokio::spawn(async move {
                let ack = match pending.await {
                    Ok(LapinConfirmation::Ack(_)) => true,
                    Ok(LapinConfirmation::NotRequested) => true,
                    Ok(LapinConfirmation::Nack(_)) => false,
                    Err(err) => {
                        warn!(error = err.to_string(), delivery_tag, "confirmation lost");
                        false
                    }
                };
                let _ = tx.send(Confirmation { delivery_tag, ack });
            });
        }

        Ok(delivery_tag)
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => {
                    let headers = delivery.properties.headers().clone().unwrap_or_default();
                    Ok(Delivery::new(
                        delivery.delivery_tag,
                        delivery.exchange.as_str(),
                        delivery.routing_key.as_str(),
                        delivery.data,
                        Arc::new(LapinAcker(delivery.acker)),
                    )
                    .redelivered(delivery.redelivered)
                    .headers(headers))
                }
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .boxed())
    }

    fn notify_close(&self) -> CloseNotify {
        let (tx, rx) = mpsc::unbounded_channel();
        self.closed.replace(tx);

        let sink = self.closed.clone();
        self.channel.on_error(move |err| {
            sink.send(AmqpError::ChannelClosed(err.to_string()));
        });

        rx
    }

    fn notify_confirm(&self) -> ConfirmNotify {
        let (tx, rx) = mpsc::unbounded_channel();
        self.confirms.replace(tx);
        rx
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the channel");
                AmqpError::ClosingError(err.to_string())
            })
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, _delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}
