// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Router Configuration
//!
//! Connection settings for the broker and the options consumed by the routing core.
//! Configuration can be read from environment variables with [`Configs::from_env`] or
//! from a JSON document with [`Configs::from_json`]. Missing or unparsable values fall
//! back to the defaults.
//!
//! | Variable                       | Default                 |
//! |--------------------------------|-------------------------|
//! | `RABBITMQ_HOST`                | `localhost`             |
//! | `RABBITMQ_PORT`                | `5672`                  |
//! | `RABBITMQ_USER`                | `guest`                 |
//! | `RABBITMQ_PASSWORD`            | `guest`                 |
//! | `RABBITMQ_VHOST`               | empty                   |
//! | `APP_NAME`                     | `rabbitmq-router`       |
//! | `MESSAGING_RESOLVE_TOPICS`     | `true`                  |
//! | `MESSAGING_AUTO_ACK`           | `true`                  |
//! | `MESSAGING_REQUEST_TIMEOUT_MS` | `10000`                 |
//! | `MESSAGING_REPLY_TO`           | `amq.rabbitmq.reply-to` |
//! | `MESSAGING_CONSUMER_TAG`       | `rabbitmq-router`       |

use crate::errors::AmqpError;
use serde::Deserialize;
use std::{env, str::FromStr, time::Duration};
use tracing::error;

/// Broker direct reply-to pseudo queue
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

const DEFAULT_APP_NAME: &str = "rabbitmq-router";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
        }
    }
}

/// Options consumed by the routing and correlation core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfigs {
    /// Interpret `*` and `#` in binding patterns. When disabled, patterns match by
    /// exact string equality.
    pub resolve_topics: bool,
    /// Acknowledge or reject messages automatically from the handler outcome.
    pub auto_ack: bool,
    /// Default deadline for `send_request` when the caller does not supply one.
    pub request_timeout_ms: u64,
    /// Shared address replies are sent to.
    pub reply_to: String,
    /// Prefix for consumer tags.
    pub consumer_tag: String,
}

impl Default for MessagingConfigs {
    fn default() -> Self {
        MessagingConfigs {
            resolve_topics: true,
            auto_ack: true,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            reply_to: DIRECT_REPLY_TO.to_owned(),
            consumer_tag: DEFAULT_APP_NAME.to_owned(),
        }
    }
}

impl MessagingConfigs {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Complete configuration for the router.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub app_name: String,
    pub rabbitmq: RabbitMQConfigs,
    pub messaging: MessagingConfigs,
}

impl Default for Configs {
    fn default() -> Self {
        Configs {
            app_name: DEFAULT_APP_NAME.to_owned(),
            rabbitmq: RabbitMQConfigs::default(),
            messaging: MessagingConfigs::default(),
        }
    }
}

impl Configs {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Configs::default();

        Configs {
            app_name: env_or("APP_NAME", defaults.app_name),
            rabbitmq: RabbitMQConfigs {
                host: env_or("RABBITMQ_HOST", defaults.rabbitmq.host),
                port: env_or("RABBITMQ_PORT", defaults.rabbitmq.port),
                user: env_or("RABBITMQ_USER", defaults.rabbitmq.user),
                password: env_or("RABBITMQ_PASSWORD", defaults.rabbitmq.password),
                vhost: env_or("RABBITMQ_VHOST", defaults.rabbitmq.vhost),
            },
            messaging: MessagingConfigs {
                resolve_topics: env_or(
                    "MESSAGING_RESOLVE_TOPICS",
                    defaults.messaging.resolve_topics,
                ),
                auto_ack: env_or("MESSAGING_AUTO_ACK", defaults.messaging.auto_ack),
                request_timeout_ms: env_or(
                    "MESSAGING_REQUEST_TIMEOUT_MS",
                    defaults.messaging.request_timeout_ms,
                ),
                reply_to: env_or("MESSAGING_REPLY_TO", defaults.messaging.reply_to),
                consumer_tag: env_or("MESSAGING_CONSUMER_TAG", defaults.messaging.consumer_tag),
            },
        }
    }

    /// Parses configuration from a JSON document. Absent fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, AmqpError> {
        serde_json::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), "failure to parse configs");
            AmqpError::ParsePayloadError
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(val) => val.parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_topic_resolution_and_auto_ack() {
        let cfg = Configs::default();

        assert!(cfg.messaging.resolve_topics);
        assert!(cfg.messaging.auto_ack);
        assert_eq!(cfg.messaging.request_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.messaging.reply_to, DIRECT_REPLY_TO);
    }

    #[test]
    fn from_json_keeps_defaults_for_missing_fields() {
        let cfg = Configs::from_json(
            r#"{"messaging": {"resolve_topics": false, "request_timeout_ms": 250}}"#,
        )
        .unwrap();

        assert!(!cfg.messaging.resolve_topics);
        assert!(cfg.messaging.auto_ack);
        assert_eq!(cfg.messaging.request_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.rabbitmq.port, 5672);
    }

    #[test]
    fn from_json_rejects_malformed_documents() {
        assert_eq!(
            Configs::from_json("{not json").unwrap_err(),
            AmqpError::ParsePayloadError
        );
    }
}
