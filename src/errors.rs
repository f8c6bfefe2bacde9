// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Router
//!
//! This module provides the error types for routing, dispatching and request/reply
//! correlation on top of RabbitMQ. The `AmqpError` enum covers both the transport
//! failures reported by the broker connection and the routing failures detected while
//! registering handlers or dispatching messages.
//!
//! Startup errors (`InvalidPatternError`, `DuplicateRegistrationError`,
//! `AmbiguousReplyHandlerError`) are returned while the handler registry is being built.
//! Per-message errors never escape the dispatch loop: they are logged, recorded on the
//! consumer span and turned into an acknowledgment outcome.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// A binding pattern is empty or contains a malformed segment
    #[error("invalid pattern `{0}`")]
    InvalidPatternError(String),

    /// The same exchange, pattern and kind was registered with a different handler
    #[error("handler already registered for exchange `{exchange}` pattern `{pattern}` kind `{kind}`")]
    DuplicateRegistrationError {
        exchange: String,
        pattern: String,
        kind: String,
    },

    /// More than one reply-capable handler registered for the same exchange and pattern
    #[error("more than one reply handler for exchange `{0}` pattern `{1}`")]
    AmbiguousReplyHandlerError(String, String),

    /// No registered binding matches the message routing key
    #[error("no handler for exchange `{0}` routing key `{1}`")]
    NoMatchingHandlerError(String, String),

    /// A handler returned an error or panicked
    #[error("handler `{0}` failed: {1}")]
    HandlerInvocationError(String, String),

    /// No reply arrived before the request deadline
    #[error("no reply received for correlation id `{0}`")]
    ReplyTimeoutError(String),

    /// The reply carried the error indicator header
    #[error("reply failed: {0}")]
    ReplyErrorPayload(String),

    /// The correlation id is already owned by an in-flight request
    #[error("correlation id `{0}` is already pending")]
    DuplicateCorrelationIdError(String),
}

/// Errors returned by handler bodies.
///
/// The dispatch engine converts these into [`AmqpError::HandlerInvocationError`] for
/// observability and, for request/reply handlers, into an error reply.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler rejected the message
    #[error("{0}")]
    Failed(String),

    /// The message content could not be decoded
    #[error("failure to decode content: {0}")]
    Content(#[from] serde_json::Error),

    /// A selected content property was not present
    #[error("missing content property `{0}`")]
    MissingProperty(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}
