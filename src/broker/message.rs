//! Message definitions shared by the client and the broker.
//!
//! `OutboundMessage` is what a producer hands to a `Sender`; its serialized
//! JSON form is the unit the batch packer measures against the byte ceiling.
//! `ReceivedMessage` is what a `Receiver` hands back: the payload plus the
//! broker-assigned metadata.
//!
//! Notes on fields:
//! - `sequence_number`: assigned by the broker at enqueue time, unique and
//!   increasing per queue
//! - `lock_token`: present only on lock-mode deliveries; settlement and
//!   renewal are addressed by it
//! - `delivery_count`: incremented by the broker on every lock-mode delivery

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub body: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl OutboundMessage {
    /// Creates a message with a fresh random `message_id`.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            message_id: Uuid::new_v4().to_string(),
            subject: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// The bytes that travel to the broker.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn serialized_size(&self) -> Result<usize> {
        Ok(self.to_bytes()?.len())
    }
}

/// Delivery state of a message as observed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Active,
    Deferred,
    Scheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub body: String,
    pub message_id: String,
    pub subject: Option<String>,
    pub sequence_number: i64,
    pub enqueued_at: DateTime<Utc>,
    pub delivery_count: u32,
    pub state: MessageState,
    pub lock_token: Option<Uuid>,
    pub locked_until: Option<DateTime<Utc>>,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
}
