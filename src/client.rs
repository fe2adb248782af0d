// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Handle
//!
//! `Queue` is the long-lived object callers hold. Creating one spawns the
//! connection supervisor, which keeps the handle connected for as long as it
//! lives: it dials, declares the topology and swaps in a fresh session after
//! every broker or network failure. Publishing lives in [`crate::publisher`],
//! consuming in [`crate::consumer`].
//!
//! The supervisor is the only writer of the session and of the connection state.
//! Readers take a snapshot of the current session and work on it; a session
//! replaced under them keeps working until its channel is gone.

use crate::{
    channel::LapinConnector,
    config::RetryPolicy,
    errors::AmqpError,
    queue::QueueConfig,
    supervisor::Supervisor,
    transport::{BrokerChannel, BrokerConnection, ConfirmNotify, Connector},
};
use std::sync::Arc;
use tokio::{
    sync::{watch, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Lifecycle of a queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal, reached through `Queue::close`.
    Closed,
}

/// One connection epoch: the connection, its channel and the confirm signal
/// registered on that channel.
pub(crate) struct Session {
    pub(crate) connection: Arc<dyn BrokerConnection>,
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) confirms: Mutex<ConfirmNotify>,
    pub(crate) epoch: u64,
    /// Cancelled once the session is dropped by the supervisor or by close.
    pub(crate) lost: CancellationToken,
}

impl Session {
    /// Closes the channel and then the connection, attempting both even when the
    /// first one fails. Returns the first error.
    pub(crate) async fn close(&self) -> Result<(), AmqpError> {
        let channel_res = self.channel.close().await;
        if let Err(err) = &channel_res {
            error!(error = err.to_string(), epoch = self.epoch, "failure to close the channel");
        }

        let connection_res = self.connection.close().await;
        if let Err(err) = &connection_res {
            error!(error = err.to_string(), epoch = self.epoch, "failure to close the connection");
        }

        channel_res.and(connection_res)
    }
}

pub(crate) struct Shared {
    pub(crate) config: QueueConfig,
    pub(crate) policy: RetryPolicy,
    state: watch::Sender<ConnectionState>,
    session: RwLock<Option<Arc<Session>>>,
}

impl Shared {
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) async fn session(&self) -> Option<Arc<Session>> {
        self.session.read().await.clone()
    }

    /// Installs a new session and publishes the handle as connected.
    pub(crate) async fn change_session(&self, session: Session) {
        let previous = self.session.write().await.replace(Arc::new(session));
        if let Some(previous) = previous {
            previous.lost.cancel();
        }
        self.set_state(ConnectionState::Connected);
    }

    pub(crate) async fn drop_session(&self) -> Option<Arc<Session>> {
        let session = self.session.write().await.take();
        if let Some(session) = &session {
            session.lost.cancel();
        }
        session
    }
}

/// A resilient handle on one queue and its exchanges.
pub struct Queue {
    pub(crate) shared: Arc<Shared>,
    pub(crate) shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<Result<(), AmqpError>>>>,
}

impl Queue {
    /// Creates a handle on `config.addr` using lapin, and starts connecting.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: QueueConfig) -> Queue {
        Queue::with_connector(config, RetryPolicy::default(), Arc::new(LapinConnector::new()))
    }

    /// Creates a handle using lapin with custom retry timings.
    ///
    /// # Parameters
    /// * `config` - The queue and exchanges to declare on every connect
    /// * `policy` - Reconnect and resend delays
    ///
    /// # Returns
    /// A handle whose supervisor is already connecting
    pub fn with_policy(config: QueueConfig, policy: RetryPolicy) -> Queue {
        Queue::with_connector(config, policy, Arc::new(LapinConnector::new()))
    }

    /// Creates a handle dialing through `connector`.
    ///
    /// # Parameters
    /// * `config` - The queue and exchanges to declare on every connect
    /// * `policy` - Reconnect and resend delays
    /// * `connector` - Dials the broker at `config.addr`
    ///
    /// # Returns
    /// A handle whose supervisor is already connecting
    pub fn with_connector(
        config: QueueConfig,
        policy: RetryPolicy,
        connector: Arc<dyn Connector>,
    ) -> Queue {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            config,
            policy,
            state,
            session: RwLock::new(None),
        });
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor::new(shared.clone(), connector, shutdown.clone());
        let handle = tokio::spawn(supervisor.run());

        Queue {
            shared,
            shutdown,
            supervisor: Mutex::new(Some(handle)),
        }
    }

    /// The configuration the handle was created with.
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// The retry timings the handle was created with.
    pub fn policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }

    /// Connected will return true when the queue has a live channel.
    pub fn connected(&self) -> bool {
        self.shared.state() == ConnectionState::Connected
    }

    /// Current lifecycle state, as last reported by the supervisor.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Waits until the supervisor reports the handle connected.
    ///
    /// Fails with `AlreadyClosed` once the handle is closed.
    pub async fn wait_connected(&self) -> Result<(), AmqpError> {
        let mut state = self.shared.subscribe();
        let reached = state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
            .await
            .map(|s| *s)
            .map_err(|_| AmqpError::AlreadyClosed)?;

        match reached {
            ConnectionState::Connected => Ok(()),
            _ => Err(AmqpError::AlreadyClosed),
        }
    }

    /// Close will shutdown the supervisor, the channel and the connection.
    ///
    /// Fails with `AlreadyClosed` if the handle is not connected. Channel and
    /// connection are both closed even when the first one fails; the first error
    /// is returned and the handle is closed either way. In-flight confirmed
    /// pushes return `Cancelled`.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if !self.connected() {
            return Err(AmqpError::AlreadyClosed);
        }

        self.shutdown.cancel();
        let Some(handle) = self.supervisor.lock().await.take() else {
            return Err(AmqpError::AlreadyClosed);
        };

        match handle.await {
            Ok(res) => {
                debug!(queue = self.shared.config.name, "queue closed");
                res
            }
            Err(err) => {
                warn!(error = err.to_string(), "supervisor task ended abnormally");
                self.shared.set_state(ConnectionState::Closed);
                Err(AmqpError::ClosingError(err.to_string()))
            }
        }
    }
}

/// Dropping a handle without `close` stops the supervisor, which then closes the
/// live channel and connection in the background. Nothing is closed if the
/// runtime is already shutting down; call `close` to be sure.
impl Drop for Queue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
