// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Router
//!
//! Client-side routing on top of a RabbitMQ connection: inbound messages are routed to
//! handlers by topic pattern, request/reply calls are correlated over a shared reply
//! queue, and handlers control how their messages are acknowledged.
//!
//! ```no_run
//! # async fn run() -> Result<(), rabbitmq_router::errors::AmqpError> {
//! use rabbitmq_router::{
//!     channel::new_amqp_channel,
//!     configs::Configs,
//!     dispatcher::RabbitMQDispatcher,
//!     handler::handler_fn,
//!     publisher::RabbitMQPublisher,
//!     registry::{HandlerKind, HandlerRegistry},
//!     rpc::RpcClient,
//! };
//! use serde_json::json;
//!
//! let cfg = Configs::from_env();
//! let (_conn, channel) = new_amqp_channel(&cfg).await?;
//! let publisher = RabbitMQPublisher::new(channel.clone());
//!
//! let registry = HandlerRegistry::builder(cfg.messaging.resolve_topics)
//!     .register_handler(
//!         "orders",
//!         "order.*",
//!         HandlerKind::Query,
//!         handler_fn(|_, _| async { Ok(Some(json!({ "status": "ok" }))) }),
//!     )?
//!     .build();
//!
//! let client = RpcClient::new(publisher.clone(), &cfg.messaging);
//! client.consume_replies(channel.clone()).await?;
//!
//! let dispatcher = RabbitMQDispatcher::new(publisher, registry, &cfg.messaging);
//! dispatcher.consume_blocking(channel, &["orders"]).await
//! # }
//! ```

mod consumer;
mod otel;

pub mod channel;
pub mod configs;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod message;
pub mod pattern;
pub mod publisher;
pub mod registry;
pub mod rpc;
pub mod transport;

pub use consumer::{DispatchOutcome, AMQP_HEADERS_REPLY_ERROR};
