// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! The dispatcher consumes queues and routes every delivery to the handlers whose
//! binding patterns match its routing key. The handler registry is frozen before the
//! dispatcher is created, so concurrent deliveries share it without locking.
//!
//! Each delivery is dispatched on its own task: handler bodies for different messages
//! run concurrently and a failing or panicking handler never stops the consumer loop.

use crate::{
    configs::MessagingConfigs,
    consumer::{consume, DispatchOutcome},
    errors::AmqpError,
    message::InboundMessage,
    registry::HandlerRegistry,
    transport::Transport,
};
use futures_util::{future::join_all, StreamExt};
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel};
use opentelemetry::global;
use std::sync::Arc;
use tracing::{debug, error};

/// Routes inbound messages to registered handlers.
#[derive(Clone)]
pub struct RabbitMQDispatcher {
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    auto_ack: bool,
    consumer_tag: String,
}

impl RabbitMQDispatcher {
    /// Creates a new dispatcher.
    ///
    /// # Parameters
    /// * `transport` - Used to publish replies and settle deliveries
    /// * `registry` - The frozen handler registry
    /// * `cfg` - Messaging options (`auto_ack`, consumer tag)
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<HandlerRegistry>,
        cfg: &MessagingConfigs,
    ) -> Self {
        RabbitMQDispatcher {
            transport,
            registry,
            auto_ack: cfg.auto_ack,
            consumer_tag: cfg.consumer_tag.clone(),
        }
    }

    /// Dispatches a single inbound message and settles it.
    ///
    /// # Returns
    /// How the delivery was settled, or the transport error raised while settling it
    pub async fn dispatch(&self, msg: &InboundMessage) -> Result<DispatchOutcome, AmqpError> {
        consume(
            &global::tracer("amqp consumer"),
            msg,
            &self.registry,
            self.transport.clone(),
            self.auto_ack,
        )
        .await
    }

    /// Consumes the given queues until their consumers are cancelled.
    ///
    /// One consumer is created per queue, with manual acknowledgment.
    pub async fn consume_blocking(
        &self,
        channel: Arc<Channel>,
        queues: &[&str],
    ) -> Result<(), AmqpError> {
        let mut spawns = vec![];

        for queue in queues {
            let tag = format!("{}-{}", self.consumer_tag, queue);
            let mut consumer = match channel
                .basic_consume(
                    queue,
                    &tag,
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: false,
                        exclusive: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), queue, "failure to create the consumer");
                    Err(AmqpError::ConsumerDeclarationError(queue.to_string()))
                }
                Ok(c) => Ok(c),
            }?;
            debug!(queue, tag, "consumer created");

            let dispatcher = self.clone();

            spawns.push(tokio::spawn(async move {
                while let Some(result) = consumer.next().await {
                    match result {
                        Ok(delivery) => {
                            let msg = InboundMessage::from(&delivery);
                            let dispatcher = dispatcher.clone();

                            tokio::spawn(async move {
                                if let Err(err) = dispatcher.dispatch(&msg).await {
                                    error!(error = err.to_string(), "error consume msg");
                                }
                            });
                        }

                        Err(err) => error!(error = err.to_string(), "errors consume msg"),
                    }
                }
            }));
        }

        let spawned = join_all(spawns).await;
        for res in spawned {
            if res.is_err() {
                error!("tokio process error");
                return Err(AmqpError::InternalError);
            }
        }

        Ok(())
    }
}
