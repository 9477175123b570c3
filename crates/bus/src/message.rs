use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User properties attached to a message.
pub type Properties = HashMap<String, PropertyValue>;

/// A single user property value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Boolean.
    Bool(bool),

    /// Signed integer.
    Int(i64),

    /// Floating point.
    Double(f64),

    /// UTF-8 string.
    String(String),

    /// Raw bytes.
    Bytes(Bytes),

    /// Point in time.
    Timestamp(DateTime<Utc>),

    /// UUID.
    Uuid(Uuid),
}

impl PropertyValue {
    /// Number of bytes the value contributes to the property block.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Double(_) | Self::Timestamp(_) => 8,
            Self::String(s) => s.len(),
            Self::Bytes(b) => b.len(),
            Self::Uuid(_) => 16,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Bytes> for PropertyValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Uuid> for PropertyValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

/// Total encoded size of a property block.
#[must_use]
pub fn property_block_len(properties: &Properties) -> usize {
    properties
        .iter()
        .map(|(key, value)| key.len() + value.encoded_len())
        .sum()
}

/// Properties stamped by the broker. Only transports set these.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemProperties {
    /// Lock token of the current delivery (peek-lock receives only).
    pub lock_token: Option<Uuid>,

    /// Broker-assigned sequence number.
    pub sequence_number: Option<i64>,

    /// Number of times the message has been delivered.
    pub delivery_count: u32,

    /// When the broker accepted the message.
    pub enqueued_time_utc: Option<DateTime<Utc>>,

    /// When the lock of the current delivery expires.
    pub locked_until_utc: Option<DateTime<Utc>>,

    /// Entity the message was dead-lettered from.
    pub dead_letter_source: Option<String>,
}

/// A message, either about to be sent or received from the broker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque payload.
    pub body: Bytes,

    /// Application-defined identifier.
    pub message_id: Option<String>,

    /// Application-defined correlation identifier.
    pub correlation_id: Option<String>,

    /// Session the message belongs to.
    pub session_id: Option<String>,

    /// Application-specific label.
    pub label: Option<String>,

    /// Content type of the body.
    pub content_type: Option<String>,

    /// Address to reply to.
    pub reply_to: Option<String>,

    /// Address of the intended recipient.
    pub to: Option<String>,

    /// Time after which the message expires.
    pub time_to_live: Option<Duration>,

    /// Time at which the message becomes visible to receivers.
    pub scheduled_enqueue_time_utc: Option<DateTime<Utc>>,

    /// User properties.
    pub properties: Properties,

    /// Broker-stamped properties.
    pub system_properties: SystemProperties,
}

impl Message {
    /// Creates a message with the given body.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Sets the message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the session id.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the time to live.
    #[must_use]
    pub const fn with_time_to_live(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = Some(time_to_live);
        self
    }

    /// Adds a user property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Lock token of the current delivery.
    #[must_use]
    pub const fn lock_token(&self) -> Option<Uuid> {
        self.system_properties.lock_token
    }

    /// Broker-assigned sequence number.
    #[must_use]
    pub const fn sequence_number(&self) -> Option<i64> {
        self.system_properties.sequence_number
    }

    /// Whether the message came from the broker and still carries its lock.
    #[must_use]
    pub const fn is_received(&self) -> bool {
        self.system_properties.lock_token.is_some()
    }
}

impl From<Bytes> for Message {
    fn from(body: Bytes) -> Self {
        Self::new(body)
    }
}

impl From<&'static str> for Message {
    fn from(body: &'static str) -> Self {
        Self::new(Bytes::from_static(body.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_fields() {
        let message = Message::new("hello")
            .with_message_id("id-1")
            .with_session_id("session-1")
            .with_property("count", 3_i64);

        assert_eq!(message.body, Bytes::from("hello"));
        assert_eq!(message.message_id.as_deref(), Some("id-1"));
        assert_eq!(message.session_id.as_deref(), Some("session-1"));
        assert_eq!(message.properties.get("count"), Some(&PropertyValue::Int(3)));
        assert!(!message.is_received());
    }

    #[test]
    fn test_property_block_len() {
        let message = Message::new("x")
            .with_property("a", true)
            .with_property("bb", "four")
            .with_property("ccc", Uuid::nil());

        assert_eq!(property_block_len(&message.properties), (1 + 1) + (2 + 4) + (3 + 16));
    }
}
