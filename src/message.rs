// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumed Messages
//!
//! A `Message` is handed to the consumer handler once per broker delivery. Settling it
//! with `done`, `fail` or `reject` consumes the value, so each delivery is settled at most
//! once, and always on the channel that delivered it.

use crate::{
    broker::{BrokerChannel, BrokerDelivery},
    errors::HutchError,
    registry::ChannelState,
};
use async_trait::async_trait;
use lapin::BasicProperties;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{future::Future, sync::Arc};
use tokio::sync::watch;
use tracing::warn;

/// Callback invoked for every message delivered to a consuming channel.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, message: Message);
}

#[async_trait]
impl<F, Fut> ConsumerHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, message: Message) {
        (self)(message).await
    }
}

/// A message in flight on a consuming channel.
pub struct Message {
    queue: String,
    delivery: BrokerDelivery,
    channel: Arc<dyn BrokerChannel>,
    state: watch::Receiver<ChannelState>,
    context: Context,
}

impl Message {
    pub(crate) fn new(
        queue: &str,
        delivery: BrokerDelivery,
        channel: Arc<dyn BrokerChannel>,
        state: watch::Receiver<ChannelState>,
        context: Context,
    ) -> Message {
        Message {
            queue: queue.to_owned(),
            delivery,
            channel,
            state,
            context,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Raw message body.
    pub fn content(&self) -> &[u8] {
        &self.delivery.data
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub fn routing_key(&self) -> &str {
        &self.delivery.routing_key
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.delivery.properties
    }

    /// Trace context propagated by the publisher, with the consumer span attached.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Decodes the JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HutchError> {
        serde_json::from_slice(&self.delivery.data)
            .map_err(|err| HutchError::ParsePayloadError(err.to_string()))
    }

    /// Acknowledges the message.
    pub async fn done(self) -> Result<(), HutchError> {
        self.ensure_consuming()?;
        self.channel.ack(self.delivery.delivery_tag).await
    }

    /// Rejects the message and puts it back on the queue.
    pub async fn fail(self) -> Result<(), HutchError> {
        self.ensure_consuming()?;
        self.channel.nack(self.delivery.delivery_tag, true).await
    }

    /// Rejects the message without requeueing it.
    pub async fn reject(self) -> Result<(), HutchError> {
        self.ensure_consuming()?;
        self.channel.nack(self.delivery.delivery_tag, false).await
    }

    fn ensure_consuming(&self) -> Result<(), HutchError> {
        if *self.state.borrow() == ChannelState::Consuming {
            return Ok(());
        }

        warn!(
            queue = self.queue.as_str(),
            delivery_tag = self.delivery.delivery_tag,
            "ignoring settlement of a message whose channel is no longer consuming"
        );
        Err(HutchError::ChannelClosed(self.queue.clone()))
    }
}
