use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::ReceivedMessage;
use crate::utils::BusError;

/// Which shared peek-lock receiver a `receive` goes through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverName {
    /// Auto-renews locks up to the configured ceiling.
    #[default]
    Primary,
    Secondary,
}

impl ReceiverName {
    pub fn as_str(self) -> &'static str {
        match self {
            ReceiverName::Primary => "primary",
            ReceiverName::Secondary => "secondary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseAction {
    Complete,
    Abandon,
    Defer,
    DeadLetter,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Produce {
        body: String,
    },
    ProduceBatch {
        bodies: Vec<String>,
    },
    Schedule {
        bodies: Vec<String>,
        delay_secs: Option<u64>,
    },
    CancelScheduled {
        sequence_numbers: Vec<i64>,
    },
    Receive {
        #[serde(default)]
        receiver: ReceiverName,
        max_count: Option<usize>,
        max_wait_ms: Option<u64>,
    },
    Peek {
        from_sequence_number: Option<i64>,
        count: Option<usize>,
    },
    /// Without sequence numbers, every number in the deferred ledger is used.
    ReceiveDeferred {
        sequence_numbers: Option<Vec<i64>>,
    },
    Release {
        lock_token: Uuid,
        action: ReleaseAction,
        reason: Option<String>,
        description: Option<String>,
    },
    RenewLock {
        lock_token: Uuid,
    },
    ReceiveDeadLetter {
        max_count: Option<usize>,
        max_wait_ms: Option<u64>,
    },
    PeekDeadLetter {
        from_sequence_number: Option<i64>,
        count: Option<usize>,
    },
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Produced {
        sequence_numbers: Vec<i64>,
    },
    Scheduled {
        sequence_numbers: Vec<i64>,
        release_at: DateTime<Utc>,
    },
    Cancelled {
        sequence_numbers: Vec<i64>,
        already_released: Vec<i64>,
    },
    Messages {
        source: String,
        messages: Vec<ReceivedMessage>,
    },
    Released {
        lock_token: Uuid,
        action: ReleaseAction,
    },
    LockRenewed {
        lock_token: Uuid,
        locked_until: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn bad_request(message: impl ToString) -> Self {
        ServerMessage::Error {
            code: "BAD_REQUEST".to_string(),
            message: message.to_string(),
        }
    }
}

impl From<BusError> for ServerMessage {
    fn from(err: BusError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
