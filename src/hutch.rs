// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Hutch
//!
//! Entry point of the crate: one broker connection plus a registry of named channels,
//! one per queue.
//!
//! ```no_run
//! use hutch::{ChannelOptions, Hutch, HutchConfig, Message};
//!
//! # async fn run() -> Result<(), hutch::HutchError> {
//! let hutch = Hutch::new();
//! hutch.initialise(HutchConfig::new("amqp://localhost", 100))?;
//! hutch.ready().await?;
//!
//! let options = ChannelOptions::new("ex1", "q1").exclusive();
//! hutch
//!     .consume(options.clone(), |msg: Message| async move {
//!         let _ = msg.done().await;
//!     })
//!     .await?;
//! hutch.publish(&options, "hello").await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    broker::BrokerTransport,
    channel::LapinTransport,
    config::HutchConfig,
    connection::{ConnectionManager, ConnectionStatus},
    consumer::{self, AcquirePolicy},
    errors::HutchError,
    events::{EventEmitter, HutchEvent},
    message::ConsumerHandler,
    options::ChannelOptions,
    publisher::Publisher,
    registry::{ChannelRegistry, ChannelState},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

struct HutchInner {
    connection: Arc<ConnectionManager>,
    registry: Arc<ChannelRegistry>,
    publisher: Publisher,
    events: EventEmitter,
}

/// Handle to a Hutch instance. Clones share the connection and the channel registry.
#[derive(Clone)]
pub struct Hutch {
    inner: Arc<HutchInner>,
}

impl Default for Hutch {
    fn default() -> Self {
        Hutch::new()
    }
}

impl Hutch {
    /// Creates an instance that talks to RabbitMQ through lapin.
    pub fn new() -> Hutch {
        Hutch::with_transport(Arc::new(LapinTransport::default()))
    }

    /// Creates an instance on top of any broker client.
    ///
    /// # Parameters
    /// * `transport` - Opens the broker connections used by this instance
    ///
    /// # Returns
    /// An instance that is not connected until `initialise` is called
    pub fn with_transport(transport: Arc<dyn BrokerTransport>) -> Hutch {
        let events = EventEmitter::new();

        Hutch {
            inner: Arc::new(HutchInner {
                connection: Arc::new(ConnectionManager::new(transport, events.clone())),
                registry: Arc::new(ChannelRegistry::new(events.clone())),
                publisher: Publisher::new(),
                events,
            }),
        }
    }

    /// Subscribes to lifecycle events emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<HutchEvent> {
        self.inner.events.subscribe()
    }

    /// Stores `config` and starts connecting in the background.
    ///
    /// Must be called within a Tokio runtime. Fails with `AlreadyInitialised` while the
    /// instance is connecting or connected. After a definitive connection failure, or
    /// after `shutdown`, it can be called again to reconnect with `config`.
    pub fn initialise(&self, config: HutchConfig) -> Result<(), HutchError> {
        self.inner.connection.configure(config)?;

        let registry = self.inner.registry.clone();
        tokio::spawn(self.inner.connection.clone().supervise(move || {
            let registry = registry.clone();
            async move { registry.close_all().await }
        }));

        Ok(())
    }

    /// True while the broker connection is established.
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Current connection status. Never blocks.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    /// Waits until the connection is ready.
    ///
    /// Fails with `NotConnected` once connecting failed definitively, and right away
    /// when the instance is not initialised or was shut down.
    pub async fn ready(&self) -> Result<(), HutchError> {
        self.inner.connection.ready().await
    }

    /// Provisions the topology of `options` and subscribes `handler` to its queue.
    ///
    /// For an exclusive channel the call keeps waiting while another instance holds the
    /// queue and resolves when this instance takes over.
    pub async fn consume<H>(&self, options: ChannelOptions, handler: H) -> Result<(), HutchError>
    where
        H: ConsumerHandler + 'static,
    {
        let session = self.inner.connection.session().await?;
        let policy = self
            .inner
            .connection
            .config()
            .map(|cfg| AcquirePolicy::from(&cfg))
            .ok_or(HutchError::NotConnected)?;

        let entry = self
            .inner
            .registry
            .reserve(options, Arc::new(handler))
            .await?;

        debug!(queue = entry.queue(), "acquiring channel");
        consumer::acquire(self.inner.registry.clone(), entry, session, policy).await
    }

    /// Serializes `body` as JSON and publishes it, resolving once the broker confirmed it.
    pub async fn publish<T>(&self, options: &ChannelOptions, body: &T) -> Result<(), HutchError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body)
            .map_err(|err| HutchError::ParsePayloadError(err.to_string()))?;
        let session = self.inner.connection.session().await?;

        self.inner
            .publisher
            .publish(session, options, &payload)
            .await
    }

    /// Closes the channel of `queue`. Fails with `NoChannelError` if there is none.
    pub async fn close(&self, queue: &str) -> Result<(), HutchError> {
        self.inner.registry.close(queue).await
    }

    /// Closes the channel of `queue` and deletes the queue and `exchange` at the broker.
    pub async fn destroy(&self, queue: &str, exchange: &str) -> Result<(), HutchError> {
        let session = self.inner.connection.session().await;
        let result = self.inner.registry.destroy(queue, exchange, session).await;

        if !matches!(result, Err(HutchError::NoChannelError(_))) {
            self.inner.publisher.forget(queue, exchange).await;
        }

        result
    }

    /// State of the channel registered for `queue`, `None` when there is none.
    pub async fn channel_state(&self, queue: &str) -> Option<ChannelState> {
        self.inner.registry.state(queue).await
    }

    /// Closes every channel and the connection, and cancels pending reconnects.
    pub async fn shutdown(&self) {
        self.inner.registry.close_all().await;
        self.inner.connection.dispose().await;
    }
}
