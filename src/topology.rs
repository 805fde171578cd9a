// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Provisioning
//!
//! This module asserts that the exchange, the queue and the binding a channel depends on
//! exist at the broker before the channel is used. Declarations are idempotent: repeating
//! them with identical parameters is a no-op at the broker, while a parameter mismatch
//! with an existing declaration is reported as `HutchError::TopologyError` and never
//! swallowed.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation that installs the topology over a broker channel

use crate::{
    broker::BrokerChannel,
    errors::HutchError,
    exchange::ExchangeDefinition,
    options::ChannelOptions,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares every exchange, then every queue, then every binding.
    async fn install(&self) -> Result<(), HutchError>;
}

/// Topology installed over a single broker channel.
pub struct AmqpTopology {
    channel: Arc<dyn BrokerChannel>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Topology a named channel needs: its exchange, its queue and the binding between them.
    pub fn from_options(channel: Arc<dyn BrokerChannel>, opts: &ChannelOptions) -> AmqpTopology {
        AmqpTopology::new(channel)
            .exchange(ExchangeDefinition::from(&opts.exchange))
            .queue(QueueDefinition::from(opts))
            .queue_binding(QueueBinding::from(opts))
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), HutchError> {
        for exch in &self.exchanges {
            self.channel.declare_exchange(exch).await?;
        }

        for queue in &self.queues {
            self.channel.declare_queue(queue).await?;
        }

        for binding in &self.queues_binding {
            self.channel.bind_queue(binding).await?;
        }

        debug!("topology asserted");

        Ok(())
    }
}
