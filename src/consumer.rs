// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatch
//!
//! This module implements the per-message dispatch: it resolves the bindings matching
//! the routing key, invokes every matched handler, publishes the reply for
//! request/reply handlers and finally settles the delivery.
//!
//! A message goes through `received -> handlers resolved -> invoked -> (replied) ->
//! acked | nacked`, or stays unsettled when a handler deferred the acknowledgment.

use crate::{
    errors::AmqpError,
    handler::{AckDecision, Acknowledger, Controls},
    message::{HeaderValues, InboundMessage},
    otel,
    registry::{Binding, HandlerRegistry},
    transport::{PublishMessage, Transport},
};
use futures_util::{future::join_all, FutureExt};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use serde_json::{json, Value};
use std::{panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

/// Header marking a reply produced by a failed handler
pub const AMQP_HEADERS_REPLY_ERROR: &str = "x-reply-error";

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acked,
    Nacked { requeue: bool },
    /// Left unsettled for the handler to acknowledge later.
    Deferred,
}

type InvocationResult = Result<Option<Value>, String>;

/// Dispatches one inbound message.
///
/// Handler failures never escape this function: they are logged, recorded on the
/// consumer span and turned into the dispatch outcome. Only transport failures while
/// settling the delivery are returned as errors.
///
/// # Parameters
/// * `tracer` - OpenTelemetry tracer for creating spans
/// * `msg` - The inbound message
/// * `registry` - Frozen handler registry
/// * `transport` - Transport used for replies and acknowledgments
/// * `auto_ack` - Settle the delivery from the handler outcome when no handler decided
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    msg: &InboundMessage,
    registry: &HandlerRegistry,
    transport: Arc<dyn Transport>,
    auto_ack: bool,
) -> Result<DispatchOutcome, AmqpError> {
    let (ctx, mut span) = otel::new_span(&msg.headers, tracer, &msg.routing_key);

    debug!(
        exchange = msg.exchange,
        routing_key = msg.routing_key,
        "received message"
    );

    let acknowledger = Arc::new(Acknowledger::new(msg.delivery_tag, transport.clone()));

    let bindings = registry.lookup(&msg.exchange, &msg.routing_key);
    if bindings.is_empty() {
        let err = AmqpError::NoMatchingHandlerError(msg.exchange.clone(), msg.routing_key.clone());
        warn!(
            exchange = msg.exchange,
            routing_key = msg.routing_key,
            "removing message from queue - reason: no handler"
        );
        otel::record_failure(&mut span, &err, "no handler");

        return settle(&acknowledger, DispatchOutcome::Nacked { requeue: false }, &mut span).await;
    }

    let controls = Controls::new(acknowledger.clone());
    let results = join_all(
        bindings
            .iter()
            .map(|binding| invoke(&ctx, binding, msg, &controls)),
    )
    .await;

    let mut failed = false;
    for (binding, result) in bindings.iter().zip(&results) {
        if let Err(reason) = result {
            failed = true;
            let err = AmqpError::HandlerInvocationError(binding.pattern.to_string(), reason.clone());
            error!(
                exchange = msg.exchange,
                routing_key = msg.routing_key,
                pattern = binding.pattern.as_str(),
                error = reason,
                "error whiling handling msg"
            );
            otel::record_failure(&mut span, &err, "handler failure");
        }
    }

    if let Err(err) = reply(&ctx, msg, &bindings, &results, &controls, transport.as_ref()).await {
        otel::record_failure(&mut span, &err, "error to reply");
    }

    let outcome = match controls.decision() {
        Some(AckDecision::Nack { requeue }) => DispatchOutcome::Nacked { requeue },
        Some(AckDecision::Ack) => DispatchOutcome::Acked,
        Some(AckDecision::Defer) => DispatchOutcome::Deferred,
        None if !auto_ack => DispatchOutcome::Deferred,
        None if failed => DispatchOutcome::Nacked { requeue: false },
        None => DispatchOutcome::Acked,
    };

    let outcome = settle(&acknowledger, outcome, &mut span).await?;

    if !failed {
        span.set_status(Status::Ok);
    }

    Ok(outcome)
}

/// Runs one handler, turning errors and panics into a failure reason.
async fn invoke(
    ctx: &Context,
    binding: &Binding,
    msg: &InboundMessage,
    controls: &Controls,
) -> InvocationResult {
    match AssertUnwindSafe(binding.handler.exec(ctx, msg, controls))
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("handler panicked".to_owned()),
    }
}

/// Publishes the reply of the first request/reply handler, when the message asks for one.
async fn reply(
    ctx: &Context,
    msg: &InboundMessage,
    bindings: &[&Binding],
    results: &[InvocationResult],
    controls: &Controls,
    transport: &dyn Transport,
) -> Result<(), AmqpError> {
    let (Some(reply_to), Some(correlation_id)) = (&msg.reply_to, &msg.correlation_id) else {
        return Ok(());
    };

    let mut replying = bindings
        .iter()
        .zip(results)
        .filter(|(binding, _)| binding.kind.replies());

    let Some((binding, result)) = replying.next() else {
        return Ok(());
    };

    if replying.next().is_some() {
        warn!(
            routing_key = msg.routing_key,
            pattern = binding.pattern.as_str(),
            "more than one reply handler matched, replying with the first one"
        );
    }

    let mut headers = controls.reply_headers();
    let data = match result {
        Ok(value) => value.clone().unwrap_or(Value::Null).to_string().into_bytes(),
        Err(reason) => {
            headers.insert(
                AMQP_HEADERS_REPLY_ERROR.to_owned(),
                HeaderValues::Bool(true),
            );
            json!({ "message": reason }).to_string().into_bytes()
        }
    };

    let reply = PublishMessage {
        headers,
        correlation_id: Some(correlation_id.clone()),
        ..PublishMessage::new("", reply_to, data)
    };

    debug!(correlation_id, reply_to, "sending reply");
    transport.publish(ctx, &reply).await
}

/// Settles the delivery and returns how it ended up settled, which differs from the
/// requested outcome when a handler already settled it through its acknowledger.
async fn settle(
    acknowledger: &Acknowledger,
    outcome: DispatchOutcome,
    span: &mut BoxedSpan,
) -> Result<DispatchOutcome, AmqpError> {
    let result = match outcome {
        DispatchOutcome::Acked => acknowledger.ack().await,
        DispatchOutcome::Nacked { requeue } => acknowledger.nack(requeue).await,
        DispatchOutcome::Deferred => {
            debug!(
                delivery_tag = acknowledger.delivery_tag(),
                "acknowledgment deferred to handler"
            );
            return Ok(outcome);
        }
    };

    match result {
        Ok(true) => Ok(outcome),
        Ok(false) => Ok(match acknowledger.settlement() {
            Some(AckDecision::Ack) => DispatchOutcome::Acked,
            Some(AckDecision::Nack { requeue }) => DispatchOutcome::Nacked { requeue },
            Some(AckDecision::Defer) | None => outcome,
        }),
        Err(err) => {
            error!(error = err.to_string(), "error whiling settling msg");
            otel::record_failure(span, &err, "error to settle msg");
            Err(err)
        }
    }
}
