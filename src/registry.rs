// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registry
//!
//! Bindings are registered through a [`RegistryBuilder`] during startup. Building the
//! registry freezes it: a [`HandlerRegistry`] has no mutating methods, so message
//! consumption can share it across tasks without locking.
//!
//! Registration fails fast on malformed patterns, on a second handler for the same
//! exchange, pattern and kind, and on a second reply-capable handler (command or query)
//! for the same exchange and pattern.

use crate::{errors::AmqpError, handler::ConsumerHandler, pattern::Pattern};
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::debug;

/// What a handler does with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Event,
    Command,
    Query,
}

impl HandlerKind {
    /// Commands and queries answer to the message's reply-to address.
    pub fn replies(&self) -> bool {
        matches!(self, HandlerKind::Command | HandlerKind::Query)
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Event => f.write_str("event"),
            HandlerKind::Command => f.write_str("command"),
            HandlerKind::Query => f.write_str("query"),
        }
    }
}

/// A pattern on an exchange bound to a handler.
#[derive(Clone)]
pub struct Binding {
    pub(crate) exchange: String,
    pub(crate) pattern: Pattern,
    pub(crate) kind: HandlerKind,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

impl Binding {
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn handler(&self) -> &Arc<dyn ConsumerHandler> {
        &self.handler
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("exchange", &self.exchange)
            .field("pattern", &self.pattern.as_str())
            .field("kind", &self.kind)
            .finish()
    }
}

/// Collects bindings during startup.
#[derive(Debug)]
pub struct RegistryBuilder {
    resolve_topics: bool,
    bindings: HashMap<String, Vec<Binding>>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        RegistryBuilder::new(true)
    }
}

impl RegistryBuilder {
    /// # Parameters
    /// * `resolve_topics` - Interpret `*` and `#` in patterns; when false patterns
    ///   match by exact string equality
    pub fn new(resolve_topics: bool) -> Self {
        RegistryBuilder {
            resolve_topics,
            bindings: HashMap::default(),
        }
    }

    /// Registers `handler` for routing keys on `exchange` matching `pattern`.
    ///
    /// Registering the same handler twice for the same exchange, pattern and kind is a
    /// no-op.
    pub fn register_handler(
        mut self,
        exchange: &str,
        pattern: &str,
        kind: HandlerKind,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Self, AmqpError> {
        let pattern = Pattern::new(pattern, self.resolve_topics)?;
        let bindings = self.bindings.entry(exchange.to_owned()).or_default();

        if already_registered(bindings, exchange, &pattern, kind, &handler)? {
            debug!(exchange, pattern = pattern.as_str(), %kind, "handler already registered");
        } else {
            debug!(exchange, pattern = pattern.as_str(), %kind, "handler registered");
            bindings.push(Binding {
                exchange: exchange.to_owned(),
                pattern,
                kind,
                handler,
            });
        }

        Ok(self)
    }

    /// Freezes the registry.
    pub fn build(self) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry {
            bindings: self.bindings,
        })
    }
}

/// Returns true when the identical binding exists, errors when the new one conflicts.
fn already_registered(
    bindings: &[Binding],
    exchange: &str,
    pattern: &Pattern,
    kind: HandlerKind,
    handler: &Arc<dyn ConsumerHandler>,
) -> Result<bool, AmqpError> {
    for existing in bindings.iter().filter(|b| b.pattern.same_matches(pattern)) {
        if existing.kind == kind {
            if same_handler(&existing.handler, handler) {
                return Ok(true);
            }
            return Err(AmqpError::DuplicateRegistrationError {
                exchange: exchange.to_owned(),
                pattern: pattern.to_string(),
                kind: kind.to_string(),
            });
        }

        if existing.kind.replies() && kind.replies() {
            return Err(AmqpError::AmbiguousReplyHandlerError(
                exchange.to_owned(),
                pattern.to_string(),
            ));
        }
    }

    Ok(false)
}

fn same_handler(a: &Arc<dyn ConsumerHandler>, b: &Arc<dyn ConsumerHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Read-only set of bindings.
#[derive(Debug)]
pub struct HandlerRegistry {
    bindings: HashMap<String, Vec<Binding>>,
}

impl HandlerRegistry {
    pub fn builder(resolve_topics: bool) -> RegistryBuilder {
        RegistryBuilder::new(resolve_topics)
    }

    /// Returns every binding on `exchange` whose pattern matches `routing_key`, in
    /// registration order.
    pub fn lookup(&self, exchange: &str, routing_key: &str) -> Vec<&Binding> {
        match self.bindings.get(exchange) {
            Some(bindings) => bindings
                .iter()
                .filter(|b| b.pattern.matches(routing_key))
                .collect(),
            None => vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
