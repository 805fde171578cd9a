// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Registry
//!
//! Maps queue names to channel entries and drives every entry through its lifecycle:
//!
//! ```text
//! Provisioning -> Acquiring -> Consuming -> Closing -> Closed
//!       \______________\____________\__________\____-> Destroyed
//! ```
//!
//! At most one entry exists per queue name. State changes go through guarded transitions
//! on the entry's watch channel, so a close racing with acquisition or with a lost
//! connection is resolved by whoever moves the entry to `Closing` first. That party tears
//! the entry down, releases the name and emits `ChannelClosed` exactly once.

use crate::{
    broker::{BrokerChannel, BrokerSession},
    errors::HutchError,
    events::{EventEmitter, HutchEvent},
    message::ConsumerHandler,
    options::ChannelOptions,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle state of a named channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Exchange, queue and binding are being asserted
    Provisioning,
    /// Waiting for the broker to grant the consumer subscription
    Acquiring,
    /// Subscription granted, deliveries flow to the handler
    Consuming,
    /// Teardown in progress
    Closing,
    Closed,
    Destroyed,
}

impl ChannelState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ChannelState::Provisioning | ChannelState::Acquiring | ChannelState::Consuming
        )
    }
}

/// State owned by one named channel.
pub(crate) struct ChannelEntry {
    pub(crate) options: ChannelOptions,
    pub(crate) consumer_tag: String,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    state: watch::Sender<ChannelState>,
    cancel: CancellationToken,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
}

impl ChannelEntry {
    fn new(options: ChannelOptions, handler: Arc<dyn ConsumerHandler>) -> ChannelEntry {
        let (state, _) = watch::channel(ChannelState::Provisioning);
        let consumer_tag = format!("hutch-{}-{}", options.queue.name, Uuid::new_v4());

        ChannelEntry {
            options,
            consumer_tag,
            handler,
            state,
            cancel: CancellationToken::new(),
            channel: Mutex::new(None),
        }
    }

    pub(crate) fn queue(&self) -> &str {
        &self.options.queue.name
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Moves `from -> to`; false when another party changed the state first.
    pub(crate) fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Moves an active entry to `Closing` and returns the state it left.
    fn begin_closing(&self) -> Option<ChannelState> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if state.is_active() {
                previous = Some(*state);
                *state = ChannelState::Closing;
                true
            } else {
                false
            }
        });
        previous
    }

    /// Fires when the entry starts tearing down. Retry timers and the delivery loop select on it.
    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Makes `channel` the broker channel of this entry, closing the one it replaces.
    ///
    /// Fails with `ChannelClosed` once the entry is tearing down; the rejected channel is closed.
    pub(crate) async fn attach(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), HutchError> {
        let mut current = self.channel.lock().await;

        if self.cancel.is_cancelled() {
            drop(current);
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "error to close a rejected channel");
            }
            return Err(HutchError::ChannelClosed(self.queue().to_owned()));
        }

        if let Some(previous) = current.replace(channel) {
            if previous.is_open() {
                if let Err(err) = previous.close().await {
                    warn!(error = err.to_string(), "error to close the replaced channel");
                }
            }
        }

        Ok(())
    }

    async fn detach(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.lock().await.take()
    }

    /// Stops retries and deliveries, cancels the subscription and closes the broker channel.
    async fn teardown(&self, previous: ChannelState) {
        self.cancel.cancel();

        let Some(channel) = self.detach().await else {
            return;
        };

        if previous == ChannelState::Consuming && channel.is_open() {
            if let Err(err) = channel.cancel(&self.consumer_tag).await {
                warn!(
                    error = err.to_string(),
                    queue = self.queue(),
                    "error to cancel the consumer"
                );
            }
        }

        if let Err(err) = channel.close().await {
            warn!(
                error = err.to_string(),
                queue = self.queue(),
                "error to close the channel"
            );
        }
    }
}

/// Named channels of one Hutch instance.
pub(crate) struct ChannelRegistry {
    entries: Mutex<HashMap<String, Arc<ChannelEntry>>>,
    events: EventEmitter,
}

impl ChannelRegistry {
    pub(crate) fn new(events: EventEmitter) -> ChannelRegistry {
        ChannelRegistry {
            entries: Mutex::new(HashMap::default()),
            events,
        }
    }

    /// Registers a new entry for `options.queue.name`, failing if one already exists.
    pub(crate) async fn reserve(
        &self,
        options: ChannelOptions,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Arc<ChannelEntry>, HutchError> {
        let mut entries = self.entries.lock().await;
        let queue = options.queue.name.clone();

        if entries.contains_key(&queue) {
            debug!(queue = queue.as_str(), "channel already exists");
            return Err(HutchError::ChannelAlreadyExists(queue));
        }

        let entry = Arc::new(ChannelEntry::new(options, handler));
        entries.insert(queue, entry.clone());

        Ok(entry)
    }

    pub(crate) async fn state(&self, queue: &str) -> Option<ChannelState> {
        self.entries.lock().await.get(queue).map(|entry| entry.state())
    }

    /// Closes the channel of `queue` and releases the name.
    pub(crate) async fn close(&self, queue: &str) -> Result<(), HutchError> {
        let (entry, previous) = self.begin_teardown(queue).await?;

        debug!(queue, "closing channel");
        entry.teardown(previous).await;
        self.release(&entry, ChannelState::Closed).await;

        Ok(())
    }

    /// Closes the channel of `queue` after deleting the queue and `exchange` at the broker.
    ///
    /// The entry is released even when a deletion fails; the failure is returned.
    pub(crate) async fn destroy(
        &self,
        queue: &str,
        exchange: &str,
        session: Result<Arc<dyn BrokerSession>, HutchError>,
    ) -> Result<(), HutchError> {
        let (entry, previous) = self.begin_teardown(queue).await?;

        debug!(queue, exchange, "destroying channel");
        let result = Self::delete_topology(&entry, previous, exchange, session).await;
        self.release(&entry, ChannelState::Destroyed).await;

        result
    }

    async fn delete_topology(
        entry: &ChannelEntry,
        previous: ChannelState,
        exchange: &str,
        session: Result<Arc<dyn BrokerSession>, HutchError>,
    ) -> Result<(), HutchError> {
        entry.cancel.cancel();

        let channel = match entry.detach().await {
            Some(channel) if channel.is_open() => {
                if previous == ChannelState::Consuming {
                    if let Err(err) = channel.cancel(&entry.consumer_tag).await {
                        warn!(
                            error = err.to_string(),
                            queue = entry.queue(),
                            "error to cancel the consumer"
                        );
                    }
                }
                channel
            }
            _ => session?.open_channel().await?,
        };

        let result = match channel.delete_queue(entry.queue()).await {
            Ok(()) => channel.delete_exchange(exchange).await,
            Err(err) => Err(err),
        };

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "error to close the channel");
        }

        result
    }

    /// Tears down an entry whose subscription ended without a close request.
    pub(crate) async fn lost(&self, entry: &Arc<ChannelEntry>) {
        if let Some(previous) = entry.begin_closing() {
            entry.teardown(previous).await;
            self.release(entry, ChannelState::Closed).await;
        }
    }

    /// Drops an entry whose setup failed definitively. No event: it never became usable.
    pub(crate) async fn discard(&self, entry: &Arc<ChannelEntry>) {
        if let Some(previous) = entry.begin_closing() {
            entry.teardown(previous).await;
            self.remove(entry).await;
            entry.state.send_replace(ChannelState::Closed);
        }
    }

    /// Closes every entry, e.g. when the connection is disposed or lost.
    pub(crate) async fn close_all(&self) {
        let entries: Vec<Arc<ChannelEntry>> =
            self.entries.lock().await.values().cloned().collect();

        for entry in entries {
            self.lost(&entry).await;
        }
    }

    async fn begin_teardown(
        &self,
        queue: &str,
    ) -> Result<(Arc<ChannelEntry>, ChannelState), HutchError> {
        let entries = self.entries.lock().await;

        entries
            .get(queue)
            .and_then(|entry| entry.begin_closing().map(|previous| (entry.clone(), previous)))
            .ok_or_else(|| HutchError::NoChannelError(queue.to_owned()))
    }

    async fn remove(&self, entry: &Arc<ChannelEntry>) -> bool {
        let mut entries = self.entries.lock().await;

        match entries.get(entry.queue()) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(entry.queue());
                true
            }
            _ => false,
        }
    }

    async fn release(&self, entry: &Arc<ChannelEntry>, terminal: ChannelState) {
        if self.remove(entry).await {
            entry.state.send_replace(terminal);
            self.events
                .emit(HutchEvent::ChannelClosed(entry.queue().to_owned()));
        }
    }
}
