// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Options
//!
//! Declarative, per-call description of the exchange, queue and publish defaults a
//! named channel works with. The registry derives a channel entry from it and the
//! topology provisioner derives the broker declarations from it.

use crate::exchange::ExchangeKind;
use serde::Deserialize;

/// Binding pattern used when the queue options carry no routing key
pub const DEFAULT_BINDING_PATTERN: &str = "#";

/// Exchange the channel publishes to and binds its queue on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExchangeOptions {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ExchangeKind,
    #[serde(default = "enabled")]
    pub durable: bool,
}

/// Queue the channel consumes from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    pub name: String,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default = "enabled")]
    pub durable: bool,
    #[serde(default)]
    pub routing_key: Option<String>,
}

/// Defaults applied to every message published through the channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublishOptions {
    #[serde(default = "enabled")]
    pub persistent: bool,
    /// Message ttl in milliseconds
    #[serde(default)]
    pub expiration: Option<u64>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            persistent: true,
            expiration: None,
        }
    }
}

/// Options accepted by `consume` and `publish`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelOptions {
    pub exchange: ExchangeOptions,
    pub queue: QueueOptions,
    #[serde(default)]
    pub publish: PublishOptions,
    #[serde(default)]
    pub exclusive: bool,
}

fn enabled() -> bool {
    true
}

fn default_prefetch() -> u16 {
    1
}

impl ChannelOptions {
    /// Creates options for a durable topic exchange and a durable queue with prefetch 1.
    pub fn new(exchange: &str, queue: &str) -> ChannelOptions {
        ChannelOptions {
            exchange: ExchangeOptions {
                name: exchange.to_owned(),
                kind: ExchangeKind::Topic,
                durable: true,
            },
            queue: QueueOptions {
                name: queue.to_owned(),
                prefetch: default_prefetch(),
                durable: true,
                routing_key: None,
            },
            publish: PublishOptions::default(),
            exclusive: false,
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange.kind = kind;
        self
    }

    /// Sets how many unsettled deliveries the consumer may hold at once.
    ///
    /// # Parameters
    /// * `prefetch` - Per-consumer QoS limit; `0` means unlimited
    ///
    /// # Returns
    /// The updated options
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.queue.prefetch = prefetch;
        self
    }

    /// Whether the queue survives a broker restart.
    pub fn durable(mut self, durable: bool) -> Self {
        self.queue.durable = durable;
        self
    }

    /// Sets the key used both to bind the queue and to publish.
    ///
    /// Without one the queue binds with `#` and publishes use the queue name.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.queue.routing_key = Some(key.to_owned());
        self
    }

    /// Whether published messages are marked persistent (delivery mode 2).
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.publish.persistent = persistent;
        self
    }

    /// Sets the per-message ttl.
    ///
    /// # Parameters
    /// * `ttl_ms` - Time to live in milliseconds
    ///
    /// # Returns
    /// The updated options
    pub fn expiration(mut self, ttl_ms: u64) -> Self {
        self.publish.expiration = Some(ttl_ms);
        self
    }

    /// Requests an exclusive consumer; competing instances wait for the holder to close.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Pattern the queue is bound to the exchange with.
    pub fn binding_pattern(&self) -> &str {
        self.queue
            .routing_key
            .as_deref()
            .unwrap_or(DEFAULT_BINDING_PATTERN)
    }

    /// Routing key used when publishing through these options.
    pub fn publish_routing_key(&self) -> &str {
        self.queue
            .routing_key
            .as_deref()
            .unwrap_or(&self.queue.name)
    }
}
