// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Events
//!
//! Connection and channel lifecycle signals are published on a broadcast channel. Every
//! event is sent after the state transition it reports, so a subscriber observing
//! `ChannelClosed(q)` will no longer find a channel registered for `q`.

use crate::errors::HutchError;
use tokio::sync::broadcast;
use tracing::debug;

/// Number of events buffered for slow subscribers before they start lagging
pub const EVENTS_CAPACITY: usize = 128;

/// Lifecycle signal emitted by a Hutch instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HutchEvent {
    /// The connection is established; emitted once per successful connection
    Ready,
    /// A connection attempt failed definitively or an established connection was lost
    Error(HutchError),
    /// The channel for the carried queue name was closed and released
    ChannelClosed(String),
}

#[derive(Debug, Clone)]
pub(crate) struct EventEmitter {
    tx: broadcast::Sender<HutchEvent>,
}

impl EventEmitter {
    pub(crate) fn new() -> EventEmitter {
        let (tx, _) = broadcast::channel(EVENTS_CAPACITY);
        EventEmitter { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<HutchEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: HutchEvent) {
        debug!(event = ?event, "emitting lifecycle event");
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}
