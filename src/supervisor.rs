// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! Background task owning the connection of a queue handle. It runs one connect
//! cycle (dial, open a channel, enable publisher confirms, declare the queue and
//! the topology, register the close and confirm signals), retries it every
//! `reconnect_delay` until it succeeds, then waits for either the channel-closed
//! signal, which starts the cycle again, or the shutdown token, which ends the task.
//!
//! Connect failures are logged and never surfaced; the handle simply stays
//! disconnected.

use crate::{
    client::{ConnectionState, Session, Shared},
    errors::AmqpError,
    topology::AmqpTopology,
    transport::{BrokerChannel, BrokerConnection, CloseNotify, ConfirmNotify, Connector},
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) struct Supervisor {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    shutdown: CancellationToken,
    epoch: u64,
}

impl Supervisor {
    pub(crate) fn new(
        shared: Arc<Shared>,
        connector: Arc<dyn Connector>,
        shutdown: CancellationToken,
    ) -> Supervisor {
        Supervisor {
            shared,
            connector,
            shutdown,
            epoch: 0,
        }
    }

    /// Keeps the handle connected until shutdown, then releases the session.
    ///
    /// The returned value is the outcome of closing the session that was live at
    /// shutdown, or `AlreadyClosed` when there was none.
    pub(crate) async fn run(mut self) -> Result<(), AmqpError> {
        loop {
            self.shared.set_state(ConnectionState::Connecting);
            debug!(addr = self.shared.config.addr, "attempting to connect");

            let Some(mut closed) = self.connect_until_ready().await else {
                debug!("supervisor stopped while connecting");
                return self.release().await;
            };

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    debug!("supervisor stopped");
                    return self.release().await;
                }

                reason = closed.recv() => {
                    let reason = reason
                        .map(|err| err.to_string())
                        .unwrap_or_else(|| "close signal dropped".to_owned());
                    warn!(reason, epoch = self.epoch, "connection lost, reconnecting");

                    self.shared.drop_session().await;
                    self.shared.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    /// Takes the live session, marks the handle closed and closes the session.
    async fn release(&self) -> Result<(), AmqpError> {
        let session = self.shared.drop_session().await;
        self.shared.set_state(ConnectionState::Closed);

        match session {
            Some(session) => session.close().await,
            None => Err(AmqpError::AlreadyClosed),
        }
    }

    /// Retries connect cycles until one succeeds, or `None` on shutdown.
    async fn connect_until_ready(&mut self) -> Option<CloseNotify> {
        let shutdown = self.shutdown.clone();
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;

            match self.connect(&shutdown).await {
                Ok(closed) => return Some(closed),
                Err(AmqpError::Cancelled) => return None,
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        topology = err.is_topology(),
                        transport = err.is_transport(),
                        attempt,
                        "failed to connect, retrying"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.shared.policy.reconnect_delay) => {}
            }
        }
    }

    /// Makes a single connect cycle and installs the resulting session.
    ///
    /// Fails with `Cancelled` on shutdown; a connection dialed by then is closed.
    async fn connect(&mut self, shutdown: &CancellationToken) -> Result<CloseNotify, AmqpError> {
        let connection = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(AmqpError::Cancelled),
            res = self.connector.dial(&self.shared.config.addr) => res?,
        };

        let prepared = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(AmqpError::Cancelled),
            res = self.prepare(connection.as_ref()) => res,
        };

        match prepared {
            Ok((channel, closed, confirms)) => {
                self.epoch += 1;
                self.shared
                    .change_session(Session {
                        connection,
                        channel,
                        confirms: Mutex::new(confirms),
                        epoch: self.epoch,
                        lost: CancellationToken::new(),
                    })
                    .await;

                info!(queue = self.shared.config.name, epoch = self.epoch, "connected");
                Ok(closed)
            }
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = close_err.to_string(), "failure to close half-open connection");
                }
                Err(err)
            }
        }
    }

    async fn prepare(
        &self,
        connection: &dyn BrokerConnection,
    ) -> Result<(Arc<dyn BrokerChannel>, CloseNotify, ConfirmNotify), AmqpError> {
        let cfg = &self.shared.config;

        let channel = connection.open_channel().await?;
        channel.confirm_select().await?;

        if !cfg.nil_queue {
            channel.declare_queue(cfg).await?;
        }

        AmqpTopology::new(channel.as_ref(), &cfg.name)
            .exchanges(&cfg.exchanges)
            .install()
            .await?;

        let closed = channel.notify_close();
        let confirms = channel.notify_confirm();

        Ok((channel, closed, confirms))
    }
}
