// src/domain/envelope.rs

//! Messages and the envelopes that carry them through a provider.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::resource::{ConsumerId, Destination, ProducerId};

/// A message body plus application properties.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    pub message_id: Option<String>,
    pub content_type: Option<Arc<str>>,
    pub properties: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Message {
    /// Build a message around a UTF-8 text body.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            content_type: Some("text/plain".into()),
            body: Bytes::from(body.into()),
            ..Self::default()
        }
    }

    /// Body as text, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Outbound message addressed by a producer.
#[derive(Clone, Debug)]
pub struct OutboundEnvelope {
    pub producer_id: ProducerId,
    pub destination: Destination,
    pub message: Message,
    /// Complete the send once it is locally enqueued instead of waiting for
    /// the broker's acknowledgement.
    pub send_async: bool,
}

/// Inbound message dispatched to a consumer.
#[derive(Clone, Debug)]
pub struct InboundEnvelope {
    pub consumer_id: ConsumerId,
    pub delivery_id: u64,
    pub redelivery_count: u32,
    pub message: Message,
}

/// Disposition applied when acknowledging a single delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckType {
    Accepted,
    Rejected,
    Released,
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
    },
}

impl fmt::Display for AckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckType::Accepted => f.write_str("accepted"),
            AckType::Rejected => f.write_str("rejected"),
            AckType::Released => f.write_str("released"),
            AckType::Modified { .. } => f.write_str("modified"),
        }
    }
}

/// Builds messages in the representation a provider's wire codec prefers.
pub trait MessageFactory: Send + Sync {
    /// Name of the codec behind this factory.
    fn protocol(&self) -> &str;

    fn create_text_message(&self, text: &str) -> Message;

    fn create_bytes_message(&self, body: Bytes) -> Message;
}

/// Shared message factory pointer.
pub type MessageFactoryPtr = Arc<dyn MessageFactory>;
