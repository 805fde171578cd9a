// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! RabbitMQ client that manages one broker connection and a registry of named
//! channels, with exclusive-consumer failover between competing instances.

mod consumer;
mod hutch;
mod otel;
mod publisher;

#[cfg(test)]
mod testing;

pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod message;
pub mod options;
pub mod queue;
pub mod registry;
pub mod topology;

pub use broker::{BrokerChannel, BrokerDelivery, BrokerSession, BrokerTransport};
pub use channel::LapinTransport;
pub use config::HutchConfig;
pub use connection::ConnectionStatus;
pub use errors::HutchError;
pub use events::HutchEvent;
pub use exchange::ExchangeKind;
pub use hutch::Hutch;
pub use message::{ConsumerHandler, Message};
pub use options::{ChannelOptions, ExchangeOptions, PublishOptions, QueueOptions};
pub use publisher::JSON_CONTENT_TYPE;
pub use registry::ChannelState;
