// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers and Reply Controls
//!
//! Handlers receive the decoded message together with a [`Controls`] handle. Controls
//! lets handler code override the automatic acknowledgment, defer it, or add headers to
//! the reply. Decisions are only recorded here; the dispatcher reads them after every
//! handler for the message has finished.

use crate::{
    errors::{AmqpError, HandlerError},
    message::{HeaderValues, Headers, InboundMessage},
    transport::Transport,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tracing::debug;

/// Result of a handler invocation. `Some(value)` is sent back as the reply body for
/// request/reply handlers; event handlers' values are ignored.
pub type HandlerResult = Result<Option<Value>, HandlerError>;

/// Processes messages routed to a binding.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &InboundMessage, controls: &Controls) -> HandlerResult;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(InboundMessage, Controls) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn exec(&self, _ctx: &Context, msg: &InboundMessage, controls: &Controls) -> HandlerResult {
        (self.f)(msg.clone(), controls.clone()).await
    }
}

/// Wraps an async closure into a handler.
///
/// ```
/// use rabbitmq_router::handler::{handler_fn, HandlerResult};
/// use serde_json::json;
///
/// let handler = handler_fn(|msg, _controls| async move {
///     let id: u64 = msg.property("id")?;
///     let reply: HandlerResult = Ok(Some(json!({ "id": id, "status": "ok" })));
///     reply
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(InboundMessage, Controls) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// An explicit acknowledgment decision taken by handler code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Nack { requeue: bool },
    /// The handler settles the delivery itself through an [`Acknowledger`].
    Defer,
}

impl AckDecision {
    fn rank(&self) -> u8 {
        match self {
            AckDecision::Defer => 0,
            AckDecision::Ack => 1,
            AckDecision::Nack { .. } => 2,
        }
    }
}

const UNSETTLED: u8 = 0;
const ACKED: u8 = 1;
const NACKED: u8 = 2;
const REQUEUED: u8 = 3;

/// Settles a single delivery at most once.
///
/// A settlement the broker rejected leaves the delivery unsettled, so it can be
/// attempted again.
pub struct Acknowledger {
    delivery_tag: u64,
    transport: Arc<dyn Transport>,
    state: AtomicU8,
}

impl Acknowledger {
    pub fn new(delivery_tag: u64, transport: Arc<dyn Transport>) -> Self {
        Acknowledger {
            delivery_tag,
            transport,
            state: AtomicU8::new(UNSETTLED),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn is_settled(&self) -> bool {
        self.settlement().is_some()
    }

    /// How the delivery was settled, if it was.
    pub fn settlement(&self) -> Option<AckDecision> {
        match self.state.load(Ordering::Acquire) {
            ACKED => Some(AckDecision::Ack),
            NACKED => Some(AckDecision::Nack { requeue: false }),
            REQUEUED => Some(AckDecision::Nack { requeue: true }),
            _ => None,
        }
    }

    /// Acknowledges the delivery. Returns `Ok(false)` if it was already settled.
    pub async fn ack(&self) -> Result<bool, AmqpError> {
        self.settle(ACKED).await
    }

    /// Rejects the delivery. Returns `Ok(false)` if it was already settled.
    pub async fn nack(&self, requeue: bool) -> Result<bool, AmqpError> {
        self.settle(if requeue { REQUEUED } else { NACKED }).await
    }

    async fn settle(&self, settlement: u8) -> Result<bool, AmqpError> {
        if self
            .state
            .compare_exchange(UNSETTLED, settlement, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(delivery_tag = self.delivery_tag, "delivery already settled");
            return Ok(false);
        }

        let result = match settlement {
            ACKED => self.transport.ack(self.delivery_tag).await,
            _ => {
                self.transport
                    .nack(self.delivery_tag, settlement == REQUEUED)
                    .await
            }
        };

        match result {
            Ok(()) => Ok(true),
            Err(err) => {
                self.state.store(UNSETTLED, Ordering::Release);
                Err(err)
            }
        }
    }
}

#[derive(Default)]
struct ControlState {
    decision: Option<AckDecision>,
    headers: Headers,
}

/// Per-message controls shared by every handler the message fans out to.
///
/// When handlers disagree, a nack beats an ack and an ack beats a deferral. The last
/// nack decides `requeue`.
#[derive(Clone)]
pub struct Controls {
    state: Arc<Mutex<ControlState>>,
    acknowledger: Arc<Acknowledger>,
}

impl Controls {
    pub fn new(acknowledger: Arc<Acknowledger>) -> Self {
        Controls {
            state: Arc::new(Mutex::new(ControlState::default())),
            acknowledger,
        }
    }

    pub fn ack(&self) {
        self.decide(AckDecision::Ack);
    }

    pub fn nack(&self, requeue: bool) {
        self.decide(AckDecision::Nack { requeue });
    }

    /// Leaves the delivery unsettled; settle it later through [`Controls::acknowledger`].
    pub fn defer(&self) {
        self.decide(AckDecision::Defer);
    }

    /// Adds a header to the reply sent for this message.
    pub fn set_header(&self, key: &str, value: HeaderValues) {
        self.lock().headers.insert(key.to_owned(), value);
    }

    pub fn acknowledger(&self) -> Arc<Acknowledger> {
        self.acknowledger.clone()
    }

    pub fn decision(&self) -> Option<AckDecision> {
        self.lock().decision
    }

    pub fn reply_headers(&self) -> Headers {
        self.lock().headers.clone()
    }

    fn decide(&self, decision: AckDecision) {
        let mut state = self.lock();
        match state.decision {
            Some(current) if current.rank() > decision.rank() => {}
            _ => state.decision = Some(decision),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use mockall::predicate::eq;

    fn controls(transport: MockTransport) -> Controls {
        Controls::new(Arc::new(Acknowledger::new(9, Arc::new(transport))))
    }

    #[tokio::test]
    async fn acknowledging_twice_is_a_noop() {
        let mut transport = MockTransport::new();
        transport.expect_ack().with(eq(9)).times(1).returning(|_| Ok(()));
        transport.expect_nack().never();

        let acker = Acknowledger::new(9, Arc::new(transport));

        assert_eq!(acker.ack().await, Ok(true));
        assert_eq!(acker.ack().await, Ok(false));
        assert_eq!(acker.nack(false).await, Ok(false));
        assert_eq!(acker.settlement(), Some(AckDecision::Ack));
    }

    #[tokio::test]
    async fn rejected_settlement_can_be_retried() {
        let mut transport = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_nack()
            .with(eq(9), eq(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(AmqpError::NackMessageError));
        transport
            .expect_nack()
            .with(eq(9), eq(true))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let acker = Acknowledger::new(9, Arc::new(transport));

        assert_eq!(acker.nack(true).await, Err(AmqpError::NackMessageError));
        assert!(!acker.is_settled());

        assert_eq!(acker.nack(true).await, Ok(true));
        assert_eq!(acker.settlement(), Some(AckDecision::Nack { requeue: true }));
    }

    #[test]
    fn nack_has_priority_over_ack_and_defer() {
        let controls = controls(MockTransport::new());
        assert_eq!(controls.decision(), None);

        controls.defer();
        assert_eq!(controls.decision(), Some(AckDecision::Defer));

        controls.ack();
        controls.nack(true);
        controls.ack();
        controls.defer();
        assert_eq!(controls.decision(), Some(AckDecision::Nack { requeue: true }));

        controls.nack(false);
        assert_eq!(controls.decision(), Some(AckDecision::Nack { requeue: false }));
    }

    #[test]
    fn clones_share_reply_headers() {
        let controls = controls(MockTransport::new());
        let other = controls.clone();

        other.set_header("x-version", HeaderValues::LongInt(2));

        assert_eq!(
            controls.reply_headers().get("x-version"),
            Some(&HeaderValues::LongInt(2))
        );
    }

    #[tokio::test]
    async fn closures_become_handlers() {
        let handler = handler_fn(|msg, controls| async move {
            controls.ack();
            Ok(Some(Value::String(msg.routing_key)))
        });
        let controls = controls(MockTransport::new());

        let result = handler
            .exec(&Context::new(), &InboundMessage::new("ex", "a.b", b"{}"), &controls)
            .await;

        assert_eq!(result.unwrap(), Some(Value::String("a.b".to_owned())));
        assert_eq!(controls.decision(), Some(AckDecision::Ack));
    }
}
