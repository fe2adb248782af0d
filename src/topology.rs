// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Declaration
//!
//! Declares the exchanges a queue depends on and binds the queue to each of them.
//! The declaration is stateless and idempotent on the broker side: declaring an
//! identical exchange or binding again is a no-op, declaring an exchange with
//! conflicting properties fails. The connection supervisor runs it in full on
//! every (re)connect since nothing guarantees the topology survived a broker
//! restart.

use crate::{errors::AmqpError, exchange::ExchangeConfig, transport::BrokerChannel};
use tracing::debug;

/// Exchanges and bindings of one queue, installed through a channel.
pub struct AmqpTopology<'tp> {
    channel: &'tp dyn BrokerChannel,
    queue_name: &'tp str,
    exchanges: &'tp [ExchangeConfig],
}

impl<'tp> AmqpTopology<'tp> {
    /// Creates an empty topology for `queue_name`.
    ///
    /// # Parameters
    /// * `channel` - Channel the declarations are made on
    /// * `queue_name` - Queue bound to every route of every exchange
    ///
    /// # Returns
    /// A topology with no exchanges
    pub fn new(channel: &'tp dyn BrokerChannel, queue_name: &'tp str) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queue_name,
            exchanges: &[],
        }
    }

    /// Sets the exchanges to declare, in declaration order.
    pub fn exchanges(mut self, exchanges: &'tp [ExchangeConfig]) -> Self {
        self.exchanges = exchanges;
        self
    }

    /// Declares every exchange in order, binding the queue to each right after it.
    ///
    /// Stops at the first failure; whatever was declared before stays on the broker.
    pub async fn install(&self) -> Result<(), AmqpError> {
        for exch in self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel.declare_exchange(exch).await?;
            debug!("exchange: {} was created", exch.name);

            self.binding_queue(exch).await?;
        }

        Ok(())
    }

    async fn binding_queue(&self, exch: &ExchangeConfig) -> Result<(), AmqpError> {
        for key in &exch.bind_routes {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                self.queue_name, exch.name, key
            );

            self.channel
                .bind_queue(self.queue_name, key, &exch.name)
                .await?;
        }

        Ok(())
    }
}
