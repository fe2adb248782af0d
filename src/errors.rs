// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Queue Handle
//!
//! This module provides the error type shared by every layer of the crate. The
//! `AmqpError` enum covers connection and channel failures, topology declaration,
//! publishing and consuming, as well as the lifecycle errors a caller can observe
//! on a queue handle (`NotConnected`, `AlreadyClosed`, `Cancelled`).

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Transport and topology variants raised while (re)connecting are logged and
/// retried by the connection supervisor; they never reach the caller. Lifecycle
/// and publishing variants are returned synchronously from the handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Operation attempted while the handle has no live channel
    #[error("not connected to the queue")]
    NotConnected,

    /// Close called on a handle that is not connected
    #[error("already closed: not connected to the queue")]
    AlreadyClosed,

    /// A confirmed push was aborted by close or by the caller's token
    #[error("push cancelled before the broker confirmed it")]
    Cancelled,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error putting the channel into publisher-confirm mode
    #[error("failure to enable publisher confirms `{0}`")]
    ConfirmSelectError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error declaring a consumer on the given queue
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// The channel was closed by the broker or the network
    #[error("channel closed `{0}`")]
    ChannelClosed(String),

    /// Error closing the channel or the connection
    #[error("failure to close `{0}`")]
    ClosingError(String),
}

impl AmqpError {
    /// Whether the error belongs to the topology declaration step.
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
        )
    }

    /// Whether the error comes from dialing or opening a channel.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelError(_)
                | AmqpError::ConfirmSelectError(_)
        )
    }
}
