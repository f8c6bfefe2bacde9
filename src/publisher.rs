// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module implements the [`Transport`] trait over a lapin channel. Published
//! messages carry the OpenTelemetry trace context in their headers, so consumers can
//! continue the trace.

use crate::{
    errors::AmqpError,
    message::{to_field_table, Headers},
    otel::RabbitMQTracePropagator,
    transport::{PublishMessage, Transport},
};
use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions},
    types::ShortString,
    BasicProperties, Channel,
};
use opentelemetry::{global, Context};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// RabbitMQ implementation of the Transport trait.
pub struct RabbitMQPublisher {
    channel: Arc<Channel>,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher.
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQPublisher instance for thread-safe sharing
    pub fn new(channel: Arc<Channel>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { channel })
    }
}

#[async_trait]
impl Transport for RabbitMQPublisher {
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(to_field_table(&headers_with_context(ctx, &infos.headers)));

        if let Some(msg_type) = &infos.msg_type {
            props = props.with_type(ShortString::from(msg_type.clone()));
        }
        if let Some(id) = &infos.correlation_id {
            props = props.with_correlation_id(ShortString::from(id.clone()));
        }
        if let Some(reply_to) = &infos.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to.clone()));
        }

        match self
            .channel
            .basic_publish(
                &infos.to,
                &infos.key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &infos.data,
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}

/// Injects the trace context from `ctx` and applies the caller headers on top.
fn headers_with_context(ctx: &Context, headers: &Headers) -> Headers {
    let mut merged = Headers::new();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut merged))
    });

    for (key, value) in headers {
        merged.insert(key.clone(), value.clone());
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HeaderValues;

    #[test]
    fn caller_headers_are_kept() {
        let mut headers = Headers::new();
        headers.insert("x-tenant".to_owned(), HeaderValues::ShortString("t1".to_owned()));

        let merged = headers_with_context(&Context::new(), &headers);

        assert_eq!(
            merged.get("x-tenant"),
            Some(&HeaderValues::ShortString("t1".to_owned()))
        );
    }
}
