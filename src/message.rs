// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelopes
//!
//! Transport-independent representation of inbound deliveries and message headers,
//! plus the conversions to and from lapin's AMQP field tables.

use crate::errors::HandlerError;
use lapin::{
    message::Delivery,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// Header values supported by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValues {
    Bool(bool),
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
}

impl HeaderValues {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValues::ShortString(v) | HeaderValues::LongString(v) => Some(v),
            _ => None,
        }
    }

    /// Truthiness used for flag headers: `true`, non-zero numbers and the string `"true"`.
    pub fn is_truthy(&self) -> bool {
        match self {
            HeaderValues::Bool(v) => *v,
            HeaderValues::ShortString(v) | HeaderValues::LongString(v) => v == "true",
            HeaderValues::Int(v) => *v != 0,
            HeaderValues::LongInt(v) => *v != 0,
            HeaderValues::LongLongInt(v) => *v != 0,
            HeaderValues::Uint(v) => *v != 0,
            HeaderValues::LongUint(v) => *v != 0,
        }
    }
}

impl From<HeaderValues> for AMQPValue {
    fn from(value: HeaderValues) -> Self {
        match value {
            HeaderValues::Bool(v) => AMQPValue::Boolean(v),
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Int(v) => AMQPValue::ShortInt(v),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(v),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(v),
            HeaderValues::Uint(v) => AMQPValue::ShortUInt(v),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(v),
        }
    }
}

impl HeaderValues {
    /// Converts an AMQP value, skipping the kinds the router does not carry
    /// (tables, arrays, floats, timestamps...).
    pub fn from_amqp(value: &AMQPValue) -> Option<HeaderValues> {
        match value {
            AMQPValue::Boolean(v) => Some(HeaderValues::Bool(*v)),
            AMQPValue::ShortString(v) => Some(HeaderValues::ShortString(v.to_string())),
            AMQPValue::LongString(v) => Some(HeaderValues::LongString(
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )),
            AMQPValue::ShortShortInt(v) => Some(HeaderValues::Int(i16::from(*v))),
            AMQPValue::ShortShortUInt(v) => Some(HeaderValues::Uint(u16::from(*v))),
            AMQPValue::ShortInt(v) => Some(HeaderValues::Int(*v)),
            AMQPValue::ShortUInt(v) => Some(HeaderValues::Uint(*v)),
            AMQPValue::LongInt(v) => Some(HeaderValues::LongInt(*v)),
            AMQPValue::LongUInt(v) => Some(HeaderValues::LongUint(*v)),
            AMQPValue::LongLongInt(v) => Some(HeaderValues::LongLongInt(*v)),
            _ => None,
        }
    }
}

/// Message headers keyed by header name.
pub type Headers = BTreeMap<String, HeaderValues>;

/// Converts router headers into an AMQP field table.
pub fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in headers {
        btree.insert(ShortString::from(key.clone()), value.clone().into());
    }
    FieldTable::from(btree)
}

/// Converts an AMQP field table into router headers.
pub fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            HeaderValues::from_amqp(value).map(|v| (key.to_string(), v))
        })
        .collect()
}

/// A message delivered by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub routing_key: String,
    pub exchange: String,
    pub data: Vec<u8>,
    pub headers: Headers,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Opaque handle used to ack or nack the delivery.
    pub delivery_tag: u64,
}

impl InboundMessage {
    pub fn new(exchange: &str, routing_key: &str, data: &[u8]) -> Self {
        InboundMessage {
            routing_key: routing_key.to_owned(),
            exchange: exchange.to_owned(),
            data: data.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn with_header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    pub fn with_delivery_tag(mut self, tag: u64) -> Self {
        self.delivery_tag = tag;
        self
    }

    /// Decodes the whole JSON body.
    pub fn content<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Decodes a single top-level property of the JSON body.
    pub fn property<T: DeserializeOwned>(&self, name: &str) -> Result<T, HandlerError> {
        let mut content: serde_json::Map<String, serde_json::Value> = self.content()?;
        let value = content
            .remove(name)
            .ok_or_else(|| HandlerError::MissingProperty(name.to_owned()))?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValues> {
        self.headers.get(key)
    }
}

impl From<&Delivery> for InboundMessage {
    fn from(delivery: &Delivery) -> Self {
        let props = &delivery.properties;

        InboundMessage {
            routing_key: delivery.routing_key.to_string(),
            exchange: delivery.exchange.to_string(),
            data: delivery.data.clone(),
            headers: props
                .headers()
                .as_ref()
                .map(from_field_table)
                .unwrap_or_default(),
            correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
            reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
            delivery_tag: delivery.delivery_tag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        id: u32,
    }

    #[test]
    fn decodes_content_and_selected_property() {
        let msg = InboundMessage::new("orders", "order.get", br#"{"id": 7, "order": {"id": 9}}"#);

        assert_eq!(msg.content::<Order>().unwrap(), Order { id: 7 });
        assert_eq!(msg.property::<Order>("order").unwrap(), Order { id: 9 });
        assert!(matches!(
            msg.property::<Order>("missing"),
            Err(HandlerError::MissingProperty(_))
        ));
    }

    #[test]
    fn invalid_content_is_a_handler_error() {
        let msg = InboundMessage::new("orders", "order.get", b"not json");

        assert!(matches!(msg.content::<Order>(), Err(HandlerError::Content(_))));
    }

    #[test]
    fn header_tables_convert_supported_values() {
        let mut headers = Headers::new();
        headers.insert("x-flag".to_owned(), HeaderValues::Bool(true));
        headers.insert("x-name".to_owned(), HeaderValues::LongString("abc".to_owned()));
        headers.insert("x-count".to_owned(), HeaderValues::LongLongInt(3));

        let mut table = to_field_table(&headers);
        table.insert(ShortString::from("x-nested"), AMQPValue::FieldTable(FieldTable::default()));

        assert_eq!(from_field_table(&table), headers);
    }

    #[test]
    fn truthy_headers() {
        assert!(HeaderValues::Bool(true).is_truthy());
        assert!(HeaderValues::ShortString("true".to_owned()).is_truthy());
        assert!(HeaderValues::LongInt(1).is_truthy());
        assert!(!HeaderValues::Uint(0).is_truthy());
        assert!(!HeaderValues::LongString("no".to_owned()).is_truthy());
    }
}
