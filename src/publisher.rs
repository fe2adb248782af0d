// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Confirmed Publisher
//!
//! `Queue::push` publishes a message and waits for the broker to confirm it. If no
//! confirmation arrives within `resend_delay`, or the broker nacks, the message is
//! published again; this repeats until an ack arrives, so a push may be delivered
//! more than once. `Queue::unsafe_push` publishes once and never waits.
//!
//! Confirmed pushes on one handle are serialized: an attempt holds the confirm
//! signal of its session from publish until its confirmation, and confirmations
//! are matched by delivery tag.

use crate::{
    client::{ConnectionState, Queue},
    errors::AmqpError,
    queue::PushOpt,
};
use std::borrow::Cow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of one publish-and-wait attempt.
enum Attempt {
    Confirmed,
    Nacked,
    TimedOut,
    Failed(AmqpError),
}

/// Delivery tags this push already published, in the current session.
#[derive(Default)]
struct Published {
    epoch: u64,
    tags: Vec<u64>,
}

impl Published {
    fn record(&mut self, epoch: u64, tag: u64) {
        if self.epoch != epoch {
            self.epoch = epoch;
            self.tags.clear();
        }
        self.tags.push(tag);
    }

    fn contains(&self, epoch: u64, tag: u64) -> bool {
        self.epoch == epoch && self.tags.contains(&tag)
    }
}

impl Queue {
    /// Push will publish `data` and wait for a confirm.
    ///
    /// If no confirm is received within the resend delay, or the broker nacks it,
    /// the message is published again until a confirm is received. Without `opt`
    /// the message goes straight to the configured queue. Errors are only
    /// returned when the handle is not connected at call time, or when the push is
    /// cancelled by `close`.
    pub async fn push(&self, data: &[u8], opt: Option<&PushOpt>) -> Result<(), AmqpError> {
        self.confirmed_push(data, opt, None).await
    }

    /// Same as `push`, returning `Cancelled` as soon as `cancel` fires.
    pub async fn push_until(
        &self,
        data: &[u8],
        opt: Option<&PushOpt>,
        cancel: &CancellationToken,
    ) -> Result<(), AmqpError> {
        self.confirmed_push(data, opt, Some(cancel)).await
    }

    /// UnsafePush will publish once without waiting for a confirm.
    ///
    /// It returns `NotConnected` without touching the broker when the handle has
    /// no live channel. No guarantees are provided for whether the server will
    /// receive the message, and the broker's confirm of it is discarded.
    pub async fn unsafe_push(&self, data: &[u8], opt: Option<&PushOpt>) -> Result<(), AmqpError> {
        let opt = self.push_opt(opt);
        self.publish_once(data, &opt).await.map(|_| ())
    }

    fn push_opt<'a>(&self, opt: Option<&'a PushOpt>) -> Cow<'a, PushOpt> {
        match opt {
            Some(opt) => Cow::Borrowed(opt),
            None => Cow::Owned(self.shared.config.default_push_opt()),
        }
    }

    async fn publish_once(&self, data: &[u8], opt: &PushOpt) -> Result<u64, AmqpError> {
        if !self.connected() {
            return Err(AmqpError::NotConnected);
        }

        let Some(session) = self.shared.session().await else {
            return Err(AmqpError::NotConnected);
        };

        session.channel.publish(opt, data, false).await
    }

    async fn confirmed_push(
        &self,
        data: &[u8],
        opt: Option<&PushOpt>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), AmqpError> {
        if !self.connected() {
            return Err(AmqpError::NotConnected);
        }

        let opt = self.push_opt(opt);
        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        let mut published = Published::default();
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;

            let res = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(AmqpError::Cancelled),
                _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
                res = self.push_attempt(data, &opt, &mut published) => res,
            };

            match res {
                Attempt::Confirmed => {
                    debug!(attempt, "push confirmed");
                    return Ok(());
                }
                Attempt::Nacked => warn!(attempt, "push was nacked, retrying"),
                Attempt::TimedOut => warn!(attempt, "push didn't confirm, retrying"),
                Attempt::Failed(err) => {
                    warn!(error = err.to_string(), attempt, "push failed, retrying");

                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Err(AmqpError::Cancelled),
                        _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
                        _ = self.republish_pause(&err) => {}
                    }
                }
            }
        }
    }

    /// Publishes once and waits for the matching confirmation.
    async fn push_attempt(&self, data: &[u8], opt: &PushOpt, published: &mut Published) -> Attempt {
        let Some(session) = self.shared.session().await else {
            return Attempt::Failed(AmqpError::NotConnected);
        };

        let mut confirms = session.confirms.lock().await;

        let tag = match session.channel.publish(opt, data, true).await {
            Ok(tag) => tag,
            Err(err) => return Attempt::Failed(err),
        };
        published.record(session.epoch, tag);

        let deadline = tokio::time::sleep(self.shared.policy.resend_delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Attempt::TimedOut,

                _ = session.lost.cancelled() => {
                    return Attempt::Failed(AmqpError::ChannelClosed(
                        "connection lost while waiting for confirm".to_owned(),
                    ));
                }

                confirmation = confirms.recv() => match confirmation {
                    Some(c) if c.delivery_tag == tag => {
                        return if c.ack { Attempt::Confirmed } else { Attempt::Nacked };
                    }
                    // an earlier publish of this same push made it after all
                    Some(c) if c.ack && published.contains(session.epoch, c.delivery_tag) => {
                        return Attempt::Confirmed;
                    }
                    Some(c) => {
                        debug!(delivery_tag = c.delivery_tag, "ignoring confirmation of another publish");
                    }
                    None => {
                        return Attempt::Failed(AmqpError::ChannelClosed(
                            "confirm signal dropped".to_owned(),
                        ));
                    }
                },
            }
        }
    }

    /// Waits before the next attempt after a failed publish.
    ///
    /// While disconnected this waits for the supervisor to reconnect.
    async fn republish_pause(&self, err: &AmqpError) {
        if *err == AmqpError::NotConnected || !self.connected() {
            let mut state = self.shared.subscribe();
            let _ = state.wait_for(|s| *s == ConnectionState::Connected).await;
            return;
        }

        let delay = self.shared.policy.republish_delay;
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}
