// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for Hutch
//!
//! This module provides the error taxonomy shared by the connection manager, the channel
//! registry, the topology provisioner and the publisher. Errors are cloneable so they can
//! travel through the lifecycle event stream as well as through operation results.

use thiserror::Error;

/// Represents errors that can occur while driving broker connections and named channels.
///
/// Recoverable conditions (`ConnectionTimeout`, `AcquisitionContention`) are retried
/// internally and never reach callers. Everything else is reported once through the
/// result of the failing operation or through a `HutchEvent::Error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HutchError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// `initialise` was called on an instance that already owns a connection supervisor
    #[error("hutch was already initialised")]
    AlreadyInitialised,

    /// Definitive failure to connect: bad uri, authentication, refused, lost connection
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The broker could not be reached in time; retried at the configured interval
    #[error("connection attempt timed out `{0}`")]
    ConnectionTimeout(String),

    /// An operation that needs the broker was issued before the connection was ready
    #[error("not connected")]
    NotConnected,

    /// Error creating or using a channel on an established connection
    #[error("channel failure `{0}`")]
    ChannelError(String),

    /// `consume` was called twice for the same queue on one instance
    #[error("a channel already exists for queue `{0}`")]
    ChannelAlreadyExists(String),

    /// `close`/`destroy` targeted a queue without an active channel
    #[error("no channel exists for queue `{0}`")]
    NoChannelError(String),

    /// The channel was closed while the operation was pending
    #[error("channel for queue `{0}` was closed")]
    ChannelClosed(String),

    /// The broker rejected an exchange, queue or binding declaration
    #[error("failure to assert topology `{0}`")]
    TopologyError(String),

    /// Exclusive consumer denied because another holder is active
    #[error("queue `{0}` is locked by another exclusive consumer")]
    AcquisitionContention(String),

    /// The configured acquisition attempt limit was reached
    #[error("gave up acquiring queue `{0}` after {1} attempts")]
    AcquisitionExhausted(String, u32),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error serializing or parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error deleting a queue or an exchange
    #[error("failure to delete `{0}`")]
    DeleteError(String),
}

impl HutchError {
    /// Stable name of the error kind, independent of the carried detail.
    pub fn name(&self) -> &'static str {
        match self {
            HutchError::InternalError => "InternalError",
            HutchError::AlreadyInitialised => "AlreadyInitialised",
            HutchError::ConnectionError(_) => "ConnectionError",
            HutchError::ConnectionTimeout(_) => "ConnectionTimeout",
            HutchError::NotConnected => "NotConnected",
            HutchError::ChannelError(_) => "ChannelError",
            HutchError::ChannelAlreadyExists(_) => "ChannelAlreadyExists",
            HutchError::NoChannelError(_) => "NoChannelError",
            HutchError::ChannelClosed(_) => "ChannelClosed",
            HutchError::TopologyError(_) => "TopologyError",
            HutchError::AcquisitionContention(_) => "AcquisitionContention",
            HutchError::AcquisitionExhausted(_, _) => "AcquisitionExhausted",
            HutchError::ConsumerError(_) => "ConsumerError",
            HutchError::QoSDeclarationError(_) => "QoSDeclarationError",
            HutchError::PublishingError(_) => "PublishingError",
            HutchError::ParsePayloadError(_) => "ParsePayloadError",
            HutchError::AckMessageError => "AckMessageError",
            HutchError::NackMessageError => "NackMessageError",
            HutchError::DeleteError(_) => "DeleteError",
        }
    }

    /// Whether the condition is retried internally instead of being reported.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HutchError::ConnectionTimeout(_) | HutchError::AcquisitionContention(_)
        )
    }
}
