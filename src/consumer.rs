// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Acquisition
//!
//! Brings a reserved channel entry from `Provisioning` to `Consuming`:
//! 1. Opens a broker channel and asserts the topology
//! 2. Applies the prefetch count and requests the consumer subscription
//! 3. When the broker denies an exclusive subscription because another holder is
//!    active, waits `retry_wait` and asks again on a fresh channel, until granted, the
//!    entry is closed, or the optional attempt limit is reached
//! 4. Spawns the delivery loop that hands every message to the consumer handler
//!
//! Contention is never reported to the caller. There is no ordering among waiting
//! instances: whichever retry reaches the broker first after a release wins.

use crate::{
    broker::{BrokerChannel, BrokerSession, DeliveryStream},
    config::HutchConfig,
    errors::HutchError,
    message::Message,
    otel,
    registry::{ChannelEntry, ChannelRegistry, ChannelState},
    topology::{AmqpTopology, Topology},
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Retry policy for exclusive acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AcquirePolicy {
    pub(crate) retry_wait: Duration,
    pub(crate) max_attempts: Option<u32>,
}

impl From<&HutchConfig> for AcquirePolicy {
    fn from(cfg: &HutchConfig) -> AcquirePolicy {
        AcquirePolicy {
            retry_wait: cfg.retry_wait_duration(),
            max_attempts: cfg.max_acquire_attempts,
        }
    }
}

/// Runs acquisition for a freshly reserved entry.
///
/// Resolves once: `Ok` when the entry is consuming, `Err` when acquisition definitively
/// failed or the entry was closed meanwhile. A failed entry is no longer registered.
pub(crate) async fn acquire(
    registry: Arc<ChannelRegistry>,
    entry: Arc<ChannelEntry>,
    session: Arc<dyn BrokerSession>,
    policy: AcquirePolicy,
) -> Result<(), HutchError> {
    match run(&registry, &entry, session, policy).await {
        Ok(()) => Ok(()),
        Err(_) if entry.is_cancelled() => {
            debug!(queue = entry.queue(), "channel closed during acquisition");
            Err(HutchError::ChannelClosed(entry.queue().to_owned()))
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = entry.queue(),
                "failure to acquire the channel"
            );
            registry.discard(&entry).await;
            Err(err)
        }
    }
}

async fn run(
    registry: &Arc<ChannelRegistry>,
    entry: &Arc<ChannelEntry>,
    session: Arc<dyn BrokerSession>,
    policy: AcquirePolicy,
) -> Result<(), HutchError> {
    let queue = entry.queue().to_owned();
    let closed = || HutchError::ChannelClosed(queue.clone());

    let mut channel = session.open_channel().await?;
    entry.attach(channel.clone()).await?;

    AmqpTopology::from_options(channel.clone(), &entry.options)
        .install()
        .await?;

    if !entry.transition(ChannelState::Provisioning, ChannelState::Acquiring) {
        return Err(closed());
    }

    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        channel.qos(entry.options.queue.prefetch).await?;

        match channel
            .consume(&queue, &entry.consumer_tag, entry.options.exclusive)
            .await
        {
            Ok(stream) => {
                if !entry.transition(ChannelState::Acquiring, ChannelState::Consuming) {
                    return Err(closed());
                }

                info!(queue = queue.as_str(), attempts, "channel consuming");
                tokio::spawn(deliver(registry.clone(), entry.clone(), channel, stream));
                return Ok(());
            }
            Err(HutchError::AcquisitionContention(_)) => {
                if let Some(max) = policy.max_attempts {
                    if attempts >= max {
                        return Err(HutchError::AcquisitionExhausted(queue.clone(), attempts));
                    }
                }

                debug!(
                    queue = queue.as_str(),
                    attempts, "queue locked by another consumer, retrying"
                );

                tokio::select! {
                    biased;
                    _ = entry.cancellation().cancelled() => return Err(closed()),
                    _ = sleep(policy.retry_wait) => {}
                }

                // the broker closes a channel whose consume was denied
                channel = session.open_channel().await?;
                entry.attach(channel.clone()).await?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Hands deliveries to the handler until the entry is closed or the subscription ends.
///
/// Each delivery runs on its own task; the broker bounds how many are in flight by the
/// prefetch count.
async fn deliver(
    registry: Arc<ChannelRegistry>,
    entry: Arc<ChannelEntry>,
    channel: Arc<dyn BrokerChannel>,
    mut stream: DeliveryStream,
) {
    let queue = entry.queue().to_owned();
    let tracer = global::tracer(otel::CONSUMER_TRACER);

    loop {
        let next = tokio::select! {
            biased;
            _ = entry.cancellation().cancelled() => return,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                debug!(
                    queue = queue.as_str(),
                    delivery_tag = delivery.delivery_tag,
                    "received message"
                );

                let ctx = otel::consumer_context(&delivery.properties, &tracer, &queue);
                let message =
                    Message::new(&queue, delivery, channel.clone(), entry.watch_state(), ctx);
                let handler = entry.handler.clone();

                tokio::spawn(async move { handler.handle(message).await });
            }
            Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
            None => break,
        }
    }

    if !entry.is_cancelled() {
        warn!(queue = queue.as_str(), "consumer stream ended, releasing channel");
        registry.lost(&entry).await;
    }
}
