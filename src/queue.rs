// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Broker-side description of the queue a channel consumes from and of the binding that
//! routes messages from the channel's exchange into it.

use crate::options::ChannelOptions;

/// Definition of a queue with its declaration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl QueueDefinition {
    /// Creates a new, non-durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

/// Binding of a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for the given queue. The exchange and routing key start empty.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange the queue is bound to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the binding pattern, e.g. `orders.#` on a topic exchange.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

impl From<&ChannelOptions> for QueueDefinition {
    fn from(opts: &ChannelOptions) -> QueueDefinition {
        let def = QueueDefinition::new(&opts.queue.name);
        if opts.queue.durable {
            def.durable()
        } else {
            def
        }
    }
}

impl From<&ChannelOptions> for QueueBinding {
    fn from(opts: &ChannelOptions) -> QueueBinding {
        QueueBinding::new(&opts.queue.name)
            .exchange(&opts.exchange.name)
            .routing_key(opts.binding_pattern())
    }
}
