// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context is propagated through message headers. Outbound messages get the
//! current context injected, inbound messages get a consumer span whose parent is the
//! context extracted from their headers.

use crate::message::{HeaderValues, Headers};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, Tracer},
    Context,
};
use std::borrow::Cow;

/// An adapter for injecting and extracting OpenTelemetry context from message headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValues::LongString(value));
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValues::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Creates a consumer span for an inbound message.
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub(crate) fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

/// Records `err` on the span and marks it failed.
pub(crate) fn record_failure(span: &mut BoxedSpan, err: &dyn std::error::Error, description: &str) {
    span.record_error(err);
    span.set_status(Status::Error {
        description: Cow::from(description.to_owned()),
    });
}
