// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Abstraction
//!
//! The routing core talks to the broker only through the [`Transport`] trait: it
//! publishes messages and settles deliveries. [`crate::publisher::RabbitMQPublisher`]
//! implements it over a lapin channel.

use crate::{errors::AmqpError, message::Headers};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use opentelemetry::Context;

/// An outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishMessage {
    /// Destination exchange; empty for the default exchange.
    pub to: String,
    pub key: String,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    pub headers: Headers,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl PublishMessage {
    pub fn new(to: &str, key: &str, data: Vec<u8>) -> Self {
        PublishMessage {
            to: to.to_owned(),
            key: key.to_owned(),
            data,
            ..Default::default()
        }
    }
}

/// Broker operations used by the dispatcher and the request client.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes a message, propagating the trace context in `ctx`.
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError>;

    /// Acknowledges a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects a delivery.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}
