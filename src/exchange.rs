// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Broker-side description of an exchange, derived from the caller's channel options and
//! consumed by the topology provisioner.

use crate::options::ExchangeOptions;
use serde::Deserialize;

/// Represents the types of exchanges a channel can declare.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of an exchange with its declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable direct exchange definition.
    ///
    /// # Parameters
    /// * `name` - Name of the exchange at the broker
    ///
    /// # Returns
    /// A definition that can be refined with `kind` and `durable`
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
        }
    }

    /// Sets the routing behaviour of the exchange.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

impl From<&ExchangeOptions> for ExchangeDefinition {
    fn from(opts: &ExchangeOptions) -> ExchangeDefinition {
        let def = ExchangeDefinition::new(&opts.name).kind(opts.kind.clone());
        if opts.durable {
            def.durable()
        } else {
            def
        }
    }
}
