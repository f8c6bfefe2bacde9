// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request/Reply Correlation
//!
//! [`RpcClient`] publishes requests with a fresh correlation id and the shared reply-to
//! address, then waits for the reply carrying the same correlation id. Every reply for
//! every in-flight request arrives on one shared consumer and is demultiplexed through
//! the pending-request map.
//!
//! A pending request is resolved exactly once: either by its reply or by its timeout.
//! Both paths remove the entry from the map under the same lock, so whichever removes
//! it first wins. Replies for requests that already timed out are logged and dropped.

use crate::{
    configs::MessagingConfigs,
    consumer::AMQP_HEADERS_REPLY_ERROR,
    errors::AmqpError,
    message::{Headers, InboundMessage},
    transport::{PublishMessage, Transport},
};
use futures_util::StreamExt;
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A reply to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub correlation_id: String,
    pub data: Vec<u8>,
    pub headers: Headers,
}

impl Reply {
    /// Decodes the JSON reply body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data).map_err(|err| {
            error!(error = err.to_string(), "failure to parse reply");
            AmqpError::ParsePayloadError
        })
    }
}

type ReplyResult = Result<Reply, AmqpError>;

struct PendingRequest {
    /// Distinguishes reuses of the same correlation id.
    seq: u64,
    tx: oneshot::Sender<ReplyResult>,
    created_at: Instant,
    deadline: Instant,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the entry only if it still belongs to request `seq`.
fn take_pending(pending: &PendingMap, id: &str, seq: u64) -> Option<PendingRequest> {
    let mut map = lock(pending);
    match map.get(id) {
        Some(req) if req.seq == seq => map.remove(id),
        _ => None,
    }
}

/// Frees the correlation id if the request future is dropped before resolution.
struct PendingGuard {
    pending: PendingMap,
    id: String,
    seq: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if take_pending(&self.pending, &self.id, self.seq).is_some() {
            debug!(correlation_id = self.id, "request abandoned");
        }
    }
}

/// Publishes events and requests, and correlates replies.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    next_seq: Arc<AtomicU64>,
    reply_to: String,
    consumer_tag: String,
    default_timeout: Duration,
}

impl RpcClient {
    /// Creates a new client.
    ///
    /// # Parameters
    /// * `transport` - Used to publish requests and events
    /// * `cfg` - Messaging options (reply address, default request timeout)
    pub fn new(transport: Arc<dyn Transport>, cfg: &MessagingConfigs) -> Self {
        RpcClient {
            transport,
            pending: Arc::new(Mutex::new(HashMap::default())),
            next_seq: Arc::new(AtomicU64::new(0)),
            reply_to: cfg.reply_to.clone(),
            consumer_tag: format!("{}-replies", cfg.consumer_tag),
            default_timeout: cfg.request_timeout(),
        }
    }

    /// Number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Publishes an event. No reply is expected.
    pub async fn publish_event<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        topic: &str,
        payload: &T,
    ) -> Result<(), AmqpError> {
        let msg = PublishMessage::new(exchange, topic, encode(payload)?);
        self.transport.publish(&Context::current(), &msg).await
    }

    /// Publishes a request and waits for its reply.
    ///
    /// # Parameters
    /// * `timeout` - Reply deadline; the configured default when `None`
    ///
    /// # Returns
    /// The reply, [`AmqpError::ReplyErrorPayload`] when the responder failed, or
    /// [`AmqpError::ReplyTimeoutError`] when no reply arrived in time
    pub async fn send_request<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        topic: &str,
        payload: &T,
        timeout: Option<Duration>,
    ) -> Result<Reply, AmqpError> {
        let id = Uuid::new_v4().to_string();
        self.send_request_with_id(exchange, topic, payload, &id, timeout)
            .await
    }

    /// Like [`RpcClient::send_request`] with a caller supplied correlation id.
    ///
    /// Fails with [`AmqpError::DuplicateCorrelationIdError`] while another request with
    /// the same id is in flight.
    pub async fn send_request_with_id<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        topic: &str,
        payload: &T,
        correlation_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Reply, AmqpError> {
        let data = encode(payload)?;
        let timeout = timeout.unwrap_or(self.default_timeout);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();

        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(correlation_id) {
                return Err(AmqpError::DuplicateCorrelationIdError(
                    correlation_id.to_owned(),
                ));
            }

            let now = Instant::now();
            pending.insert(
                correlation_id.to_owned(),
                PendingRequest {
                    seq,
                    tx,
                    created_at: now,
                    deadline: now + timeout,
                },
            );
        }

        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id: correlation_id.to_owned(),
            seq,
        };

        let msg = PublishMessage {
            correlation_id: Some(correlation_id.to_owned()),
            reply_to: Some(self.reply_to.clone()),
            ..PublishMessage::new(exchange, topic, data)
        };
        self.transport.publish(&Context::current(), &msg).await?;
        debug!(correlation_id, exchange, topic, "request sent");

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AmqpError::InternalError),
            Err(_) => {
                if take_pending(&self.pending, correlation_id, seq).is_some() {
                    warn!(correlation_id, "timeout waiting for reply");
                    return Err(AmqpError::ReplyTimeoutError(correlation_id.to_owned()));
                }

                // the reply won the race and is already in the channel
                rx.try_recv()
                    .unwrap_or_else(|_| Err(AmqpError::ReplyTimeoutError(correlation_id.to_owned())))
            }
        }
    }

    /// Resolves the pending request matching the reply's correlation id.
    ///
    /// # Returns
    /// `true` when a waiting request was resolved, `false` when the reply was late,
    /// unknown or had no correlation id and was discarded
    pub fn handle_reply(&self, msg: &InboundMessage) -> bool {
        let Some(correlation_id) = &msg.correlation_id else {
            warn!(routing_key = msg.routing_key, "discarding reply without correlation id");
            return false;
        };

        let mut pending = lock(&self.pending);
        let Some(req) = pending.remove(correlation_id) else {
            warn!(correlation_id, "discarding late or unknown reply");
            return false;
        };

        let now = Instant::now();
        debug!(
            correlation_id,
            elapsed_ms = now.duration_since(req.created_at).as_millis() as u64,
            remaining_ms = req.deadline.saturating_duration_since(now).as_millis() as u64,
            "reply received"
        );

        // sent while holding the lock so a racing timeout finds the reply in the channel
        if req.tx.send(reply_result(correlation_id, msg)).is_err() {
            debug!(correlation_id, "requester is gone");
        }

        true
    }

    /// Starts the shared reply consumer.
    ///
    /// Must be called before the first request when using the broker's direct reply-to,
    /// which also requires the consumer to run without acknowledgments.
    pub async fn consume_replies(&self, channel: Arc<Channel>) -> Result<JoinHandle<()>, AmqpError> {
        let mut consumer = match channel
            .basic_consume(
                &self.reply_to,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: true,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to create the reply consumer");
                Err(AmqpError::ConsumerDeclarationError(self.reply_to.clone()))
            }
            Ok(c) => Ok(c),
        }?;

        let client = self.clone();

        Ok(tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        client.handle_reply(&InboundMessage::from(&delivery));
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume reply"),
                }
            }
        }))
    }
}

fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(payload).map_err(|err| {
        error!(error = err.to_string(), "failure to encode payload");
        AmqpError::ParsePayloadError
    })
}

fn reply_result(correlation_id: &str, msg: &InboundMessage) -> ReplyResult {
    let failed = msg
        .header(AMQP_HEADERS_REPLY_ERROR)
        .is_some_and(|v| v.is_truthy());

    if failed {
        let message = serde_json::from_slice::<serde_json::Value>(&msg.data)
            .ok()
            .and_then(|body| body.get("message").and_then(|m| m.as_str()).map(str::to_owned))
            .unwrap_or_else(|| String::from_utf8_lossy(&msg.data).into_owned());
        return Err(AmqpError::ReplyErrorPayload(message));
    }

    Ok(Reply {
        correlation_id: correlation_id.to_owned(),
        data: msg.data.clone(),
        headers: msg.headers.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatcher::RabbitMQDispatcher,
        handler::{handler_fn, HandlerResult},
        message::HeaderValues,
        registry::{HandlerKind, RegistryBuilder},
        transport::MockTransport,
    };
    use serde_json::{json, Value};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn capturing_transport() -> (MockTransport, UnboundedReceiver<PublishMessage>) {
        let (tx, rx) = unbounded_channel();
        let mut transport = MockTransport::new();
        transport.expect_publish().returning(move |_, msg| {
            let _ = tx.send(msg.clone());
            Ok(())
        });
        (transport, rx)
    }

    fn client() -> (RpcClient, UnboundedReceiver<PublishMessage>) {
        let (transport, rx) = capturing_transport();
        (
            RpcClient::new(Arc::new(transport), &MessagingConfigs::default()),
            rx,
        )
    }

    fn reply_to(request: &PublishMessage, body: Value) -> InboundMessage {
        InboundMessage::new("", request.reply_to.as_deref().unwrap(), body.to_string().as_bytes())
            .with_correlation_id(request.correlation_id.as_deref().unwrap())
    }

    #[tokio::test]
    async fn replies_resolve_their_own_request_in_any_order() {
        let (client, mut published) = client();

        let mut calls = vec![];
        for i in 0..5 {
            let client = client.clone();
            calls.push(tokio::spawn(async move {
                client
                    .send_request("orders", "order.get", &json!({ "i": i }), Some(Duration::from_secs(5)))
                    .await
            }));
        }

        let mut requests = vec![];
        for _ in 0..5 {
            requests.push(published.recv().await.unwrap());
        }
        assert_eq!(client.pending_count(), 5);

        for request in requests.iter().rev() {
            let body: Value = serde_json::from_slice(&request.data).unwrap();
            assert_eq!(request.reply_to.as_deref(), Some(crate::configs::DIRECT_REPLY_TO));
            assert!(client.handle_reply(&reply_to(request, json!({ "echo": body["i"] }))));
        }

        for (i, call) in calls.into_iter().enumerate() {
            let reply = call.await.unwrap().unwrap();
            assert_eq!(reply.json::<Value>().unwrap(), json!({ "echo": i }));
        }
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn request_without_reply_times_out_and_frees_its_id() {
        let (client, mut published) = client();

        let result = client
            .send_request_with_id("orders", "order.get", &json!({}), "c1", Some(Duration::from_millis(50)))
            .await;

        assert_eq!(result, Err(AmqpError::ReplyTimeoutError("c1".to_owned())));
        assert_eq!(client.pending_count(), 0);

        // a late reply is discarded
        let request = published.recv().await.unwrap();
        assert!(!client.handle_reply(&reply_to(&request, json!("late"))));

        // the id can be reused
        let second = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_request_with_id("orders", "order.get", &json!({}), "c1", None)
                    .await
            })
        };
        let request = published.recv().await.unwrap();
        assert!(client.handle_reply(&reply_to(&request, json!("fresh"))));

        let reply = second.await.unwrap().unwrap();
        assert_eq!(reply.correlation_id, "c1");
        assert_eq!(reply.json::<String>().unwrap(), "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn reply_arriving_with_the_deadline_resolves_once() {
        let (client, mut published) = client();

        // reply delivered after the deadline passed but before the caller woke up
        let body = json!({});
        let call = client.send_request_with_id(
            "orders",
            "order.get",
            &body,
            "r1",
            Some(Duration::from_millis(50)),
        );
        tokio::pin!(call);
        assert!(futures_util::poll!(&mut call).is_pending());
        let request = published.try_recv().unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;
        let delivered = client.handle_reply(&reply_to(&request, json!("on time")));
        let result = call.await;

        assert_eq!(delivered, result.is_ok());
        assert_eq!(client.pending_count(), 0);

        // caller woke up first: the timeout wins and the reply is discarded
        let body = json!({});
        let call = client.send_request_with_id(
            "orders",
            "order.get",
            &body,
            "r2",
            Some(Duration::from_millis(50)),
        );
        tokio::pin!(call);
        assert!(futures_util::poll!(&mut call).is_pending());
        let request = published.try_recv().unwrap();

        tokio::time::advance(Duration::from_millis(60)).await;
        let result = call.await;
        let delivered = client.handle_reply(&reply_to(&request, json!("late")));

        assert_eq!(result, Err(AmqpError::ReplyTimeoutError("r2".to_owned())));
        assert!(!delivered);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_reply_fails_the_request() {
        let (client, mut published) = client();

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.send_request("orders", "order.cancel", "42", None).await })
        };

        let request = published.recv().await.unwrap();
        let reply = reply_to(&request, json!({ "message": "order not found" }))
            .with_header(AMQP_HEADERS_REPLY_ERROR, HeaderValues::Bool(true));
        assert!(client.handle_reply(&reply));

        assert_eq!(
            call.await.unwrap(),
            Err(AmqpError::ReplyErrorPayload("order not found".to_owned()))
        );
    }

    #[tokio::test]
    async fn in_flight_correlation_id_cannot_be_reused() {
        let (client, mut published) = client();

        let first = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_request_with_id("orders", "order.get", &json!({}), "dup", None)
                    .await
            })
        };
        let request = published.recv().await.unwrap();

        assert_eq!(
            client
                .send_request_with_id("orders", "order.get", &json!({}), "dup", None)
                .await,
            Err(AmqpError::DuplicateCorrelationIdError("dup".to_owned()))
        );

        assert!(client.handle_reply(&reply_to(&request, json!(1))));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn abandoned_request_is_removed() {
        let (client, mut published) = client();

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.send_request("orders", "order.get", &json!({}), None).await })
        };
        let request = published.recv().await.unwrap();
        assert_eq!(client.pending_count(), 1);

        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());

        assert_eq!(client.pending_count(), 0);
        assert!(!client.handle_reply(&reply_to(&request, json!(1))));
    }

    #[tokio::test]
    async fn failed_publish_does_not_leave_a_pending_request() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(AmqpError::PublishingError));
        let client = RpcClient::new(Arc::new(transport), &MessagingConfigs::default());

        assert_eq!(
            client.send_request("orders", "order.get", &json!({}), None).await,
            Err(AmqpError::PublishingError)
        );
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_without_correlation_id_is_discarded() {
        let (client, _published) = client();

        assert!(!client.handle_reply(&InboundMessage::new("", DIRECT_REPLY, b"{}")));
    }

    const DIRECT_REPLY: &str = crate::configs::DIRECT_REPLY_TO;

    #[tokio::test]
    async fn events_are_published_without_reply_address() {
        let (client, mut published) = client();

        client
            .publish_event("users", "user.created", &json!({ "id": 1 }))
            .await
            .unwrap();

        let event = published.recv().await.unwrap();
        assert_eq!(event.to, "users");
        assert_eq!(event.key, "user.created");
        assert_eq!(event.reply_to, None);
        assert_eq!(event.correlation_id, None);
    }

    #[tokio::test]
    async fn request_round_trip_through_the_dispatcher() {
        let (mut transport, mut published) = capturing_transport();
        transport.expect_ack().times(1).returning(|_| Ok(()));
        let transport: Arc<dyn Transport> = Arc::new(transport);

        let registry = RegistryBuilder::default()
            .register_handler(
                "orders",
                "order.*",
                HandlerKind::Query,
                handler_fn(|msg, _| async move {
                    let id: u64 = msg.property("id")?;
                    let reply: HandlerResult = Ok(Some(json!({ "id": id, "status": "ok" })));
                    reply
                }),
            )
            .unwrap()
            .build();
        let dispatcher =
            RabbitMQDispatcher::new(transport.clone(), registry, &MessagingConfigs::default());
        let client = RpcClient::new(transport, &MessagingConfigs::default());

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_request("orders", "order.get", &json!({ "id": 7 }), None)
                    .await
            })
        };

        // broker delivers the request to the responder
        let request = published.recv().await.unwrap();
        let delivered = InboundMessage {
            routing_key: request.key.clone(),
            exchange: request.to.clone(),
            data: request.data.clone(),
            headers: request.headers.clone(),
            correlation_id: request.correlation_id.clone(),
            reply_to: request.reply_to.clone(),
            delivery_tag: 1,
        };
        dispatcher.dispatch(&delivered).await.unwrap();

        // and the reply back to the requester
        let reply = published.recv().await.unwrap();
        assert_eq!(reply.key, DIRECT_REPLY);
        let delivered = InboundMessage {
            data: reply.data.clone(),
            headers: reply.headers.clone(),
            correlation_id: reply.correlation_id.clone(),
            ..Default::default()
        };
        assert!(client.handle_reply(&delivered));

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.json::<Value>().unwrap(), json!({ "id": 7, "status": "ok" }));
    }
}
