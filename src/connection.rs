// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the single broker connection of a Hutch instance. A supervisor task connects,
//! publishes the connection status, waits for the connection to drop and reconnects
//! after the configured wait. Attempts that time out are retried at the same interval;
//! any other connect failure is definitive and stops the supervisor in `Errored`.
//!
//! Once the supervisor stopped, either in `Errored` or through `dispose`, the manager
//! accepts a new configuration and a new supervisor can be started.

use crate::{
    broker::{BrokerSession, BrokerTransport},
    config::HutchConfig,
    errors::HutchError,
    events::{EventEmitter, HutchEvent},
};
use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{
    sync::{watch, RwLock},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Status of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection: not initialised yet, lost, or shut down
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Connected; channels can be opened
    Ready,
    /// Connecting failed definitively; the instance must be initialised again
    Errored,
}

/// Configuration and shutdown handle of the current supervisor run.
struct Supervision {
    config: Option<HutchConfig>,
    shutdown: CancellationToken,
    running: bool,
    generation: u64,
}

pub(crate) struct ConnectionManager {
    transport: Arc<dyn BrokerTransport>,
    status: watch::Sender<ConnectionStatus>,
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
    supervision: Mutex<Supervision>,
    events: EventEmitter,
}

impl ConnectionManager {
    pub(crate) fn new(transport: Arc<dyn BrokerTransport>, events: EventEmitter) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        ConnectionManager {
            transport,
            status,
            session: RwLock::new(None),
            supervision: Mutex::new(Supervision {
                config: None,
                shutdown: CancellationToken::new(),
                running: false,
                generation: 0,
            }),
            events,
        }
    }

    fn supervision(&self) -> MutexGuard<'_, Supervision> {
        self.supervision
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the configuration for the next supervisor run.
    ///
    /// Fails with `AlreadyInitialised` while a supervisor is running; after a definitive
    /// failure or a `dispose` the new configuration replaces the previous one.
    pub(crate) fn configure(&self, config: HutchConfig) -> Result<(), HutchError> {
        let mut supervision = self.supervision();

        if supervision.running {
            return Err(HutchError::AlreadyInitialised);
        }

        supervision.config = Some(config);
        supervision.shutdown = CancellationToken::new();
        supervision.running = true;
        supervision.generation += 1;

        Ok(())
    }

    pub(crate) fn config(&self) -> Option<HutchConfig> {
        self.supervision().config.clone()
    }

    fn is_running(&self) -> bool {
        self.supervision().running
    }

    /// Marks the run `generation` as stopped, unless a newer run replaced it.
    fn stopped(&self, generation: u64) {
        let mut supervision = self.supervision();
        if supervision.generation == generation {
            supervision.running = false;
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Ready
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// The live session, or `NotConnected` while the connection is not ready.
    pub(crate) async fn session(&self) -> Result<Arc<dyn BrokerSession>, HutchError> {
        if !self.is_connected() {
            return Err(HutchError::NotConnected);
        }

        self.session
            .read()
            .await
            .clone()
            .filter(|session| session.is_connected())
            .ok_or(HutchError::NotConnected)
    }

    /// Waits for `Ready`. Fails with `NotConnected` once connecting failed definitively or
    /// when no supervisor is running, e.g. before `configure` or after `dispose`.
    pub(crate) async fn ready(&self) -> Result<(), HutchError> {
        let mut status = self.watch_status();

        loop {
            let current = *status.borrow_and_update();
            match current {
                ConnectionStatus::Ready => return Ok(()),
                ConnectionStatus::Errored => return Err(HutchError::NotConnected),
                _ if !self.is_running() => return Err(HutchError::NotConnected),
                _ => {}
            }

            status
                .changed()
                .await
                .map_err(|_| HutchError::NotConnected)?;
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        debug!(status = ?status, "connection status");
        self.status.send_replace(status);
    }

    /// Connects and keeps the connection alive until disposed or a definitive failure.
    ///
    /// `on_lost` runs after an established connection dropped and before the `Error`
    /// event for it is emitted.
    pub(crate) async fn supervise<F, Fut>(self: Arc<Self>, on_lost: F)
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send,
    {
        let (config, shutdown, generation) = {
            let supervision = self.supervision();
            match &supervision.config {
                Some(config) => (
                    config.clone(),
                    supervision.shutdown.clone(),
                    supervision.generation,
                ),
                None => {
                    error!("connection supervisor started without configuration");
                    return;
                }
            }
        };
        let retry_wait = config.retry_wait_duration();

        loop {
            self.set_status(ConnectionStatus::Connecting);

            let connect = self
                .transport
                .connect(&config.connection_string, &config.connection_name);
            let attempt = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                attempt = connect => attempt,
            };

            match attempt {
                Ok(session) => {
                    if shutdown.is_cancelled() {
                        if let Err(err) = session.close().await {
                            warn!(error = err.to_string(), "error to close the connection");
                        }
                        return;
                    }

                    *self.session.write().await = Some(session.clone());
                    self.set_status(ConnectionStatus::Ready);
                    info!("amqp connection ready");
                    self.events.emit(HutchEvent::Ready);

                    let cause = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return,
                        cause = session.closed() => cause,
                    };

                    warn!(error = cause.to_string(), "amqp connection lost");
                    self.session.write().await.take();
                    self.set_status(ConnectionStatus::Disconnected);
                    on_lost().await;
                    self.events.emit(HutchEvent::Error(cause));
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        error = err.to_string(),
                        retry_wait_ms = config.retry_wait,
                        "broker unreachable, retrying"
                    );
                }
                Err(err) => {
                    error!(error = err.to_string(), "failure to connect");
                    self.stopped(generation);
                    self.set_status(ConnectionStatus::Errored);
                    self.events.emit(HutchEvent::Error(err));
                    return;
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = sleep(retry_wait) => {}
            }
        }
    }

    /// Stops the supervisor, cancelling any pending retry, and closes the connection.
    pub(crate) async fn dispose(&self) {
        let shutdown = {
            let mut supervision = self.supervision();
            supervision.running = false;
            supervision.shutdown.clone()
        };
        shutdown.cancel();

        if let Some(session) = self.session.write().await.take() {
            if let Err(err) = session.close().await {
                warn!(error = err.to_string(), "error to close the connection");
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
    }
}
