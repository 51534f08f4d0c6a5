//! The narrow interface between the client and a broker.
//!
//! Everything the lease, batch and scheduling logic needs from a broker goes
//! through [`BrokerTransport`]. The broker is the sole arbiter of lock
//! exclusivity; the client only observes and extends locks. Implementations
//! must never retry settlement or sends on their own.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::address::QueueAddress;
use crate::broker::message::ReceivedMessage;
use crate::utils::Result;

/// Delivery semantics of a receiving handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    /// Locked until settled or expired. At-least-once.
    PeekLock,
    /// Removed at the instant of delivery. At-most-once.
    ReceiveAndDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Receiver(ReceiveMode),
    Sender,
}

/// An open link to one queue address. Each `Receiver` and `Sender` owns its
/// own handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub id: u64,
    pub address: QueueAddress,
    pub kind: HandleKind,
}

/// Terminal disposition of a locked delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SettleAction {
    Complete,
    Abandon,
    Defer,
    DeadLetter {
        reason: Option<String>,
        description: Option<String>,
    },
}

impl SettleAction {
    pub fn name(&self) -> &'static str {
        match self {
            SettleAction::Complete => "complete",
            SettleAction::Abandon => "abandon",
            SettleAction::Defer => "defer",
            SettleAction::DeadLetter { .. } => "dead_letter",
        }
    }
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn open(&self, address: &QueueAddress, kind: HandleKind) -> Result<Handle>;

    /// Waits at most `max_wait` for at least one message.
    async fn fetch(
        &self,
        handle: &Handle,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>>;

    async fn peek(
        &self,
        handle: &Handle,
        count: usize,
        from_sequence_number: i64,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Delivers the deferred messages with exactly these sequence numbers.
    /// Unknown or non-deferred numbers are skipped.
    async fn fetch_deferred(
        &self,
        handle: &Handle,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>>;

    async fn settle(&self, handle: &Handle, lock_token: Uuid, action: SettleAction) -> Result<()>;

    async fn renew_lock(&self, handle: &Handle, lock_token: Uuid) -> Result<DateTime<Utc>>;

    async fn send_batch(&self, handle: &Handle, messages: Vec<Vec<u8>>) -> Result<Vec<i64>>;

    async fn schedule_batch(
        &self,
        handle: &Handle,
        messages: Vec<Vec<u8>>,
        release_at: DateTime<Utc>,
    ) -> Result<Vec<i64>>;

    /// Cancels whatever is still scheduled and reports the rest through
    /// `BusError::AlreadyReleased`.
    async fn cancel_scheduled(&self, handle: &Handle, sequence_numbers: &[i64]) -> Result<()>;

    async fn close(&self, handle: &Handle) -> Result<()>;
}
