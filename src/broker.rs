// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Primitives
//!
//! The wire-protocol client is consumed through the traits in this module. Every
//! primitive is asynchronous and reports success or failure on its own, so the channel
//! engine can run against lapin in production and against any other implementation in
//! tests.
//!
//! Implementations are expected to classify broker replies into the crate taxonomy:
//! - a consume denied with RESOURCE_LOCKED becomes `HutchError::AcquisitionContention`
//! - a rejected declaration or binding becomes `HutchError::TopologyError`
//! - a connection attempt that timed out becomes `HutchError::ConnectionTimeout`

use crate::{
    errors::HutchError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::sync::Arc;

/// One message pushed by the broker to a consumer subscription.
#[derive(Debug, Clone)]
pub struct BrokerDelivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
}

/// Deliveries of a single consumer subscription. The stream ends when the subscription
/// or its channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<BrokerDelivery, HutchError>>;

/// Opens connections to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerSession>, HutchError>;
}

/// An established broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, HutchError>;

    /// Resolves once the connection is lost, carrying the cause.
    async fn closed(&self) -> HutchError;

    async fn close(&self) -> Result<(), HutchError>;
}

/// A broker channel multiplexed over a session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), HutchError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), HutchError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), HutchError>;

    async fn qos(&self, prefetch: u16) -> Result<(), HutchError>;

    /// Enables publisher confirms on the channel.
    async fn confirm_select(&self) -> Result<(), HutchError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        exclusive: bool,
    ) -> Result<DeliveryStream, HutchError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), HutchError>;

    /// Publishes and waits for the broker confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), HutchError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), HutchError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), HutchError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), HutchError>;

    async fn delete_exchange(&self, exchange: &str) -> Result<(), HutchError>;

    async fn close(&self) -> Result<(), HutchError>;
}
