//! The `error` module defines the error taxonomy shared by the client, the
//! embedded broker and the WebSocket front-end.
//!
//! Every fallible operation in `peeklock` returns [`Result`]. Variants are
//! grouped by how a caller is expected to react:
//!
//! - `LockLost`: the lease is gone (expired or already settled). Re-receive the
//!   message and retry the intended action on the fresh delivery.
//! - `RenewalCeilingExceeded`: a configured boundary was hit. Surface it.
//! - `MessageTooLarge`: fatal for a whole batch operation. Never skip silently.
//! - `UnsupportedOperation`: programmer error, wrong receiver mode or address.
//! - `AlreadyReleased`: a scheduled-message cancel arrived too late. Log it.
//! - `Transport`: transient. The caller decides whether a retry is safe;
//!   settlement is not idempotent at the broker.

use std::time::Duration;

use thiserror::Error;

/// Shared result type.
pub type Result<T> = std::result::Result<T, BusError>;

/// Why a lease could no longer be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockLostReason {
    /// The lock expiry passed before the operation reached it.
    Expired,
    /// No lease is held for this token: already settled, owned by another
    /// receiver, or never issued.
    NotHeld,
}

impl std::fmt::Display for LockLostReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockLostReason::Expired => f.write_str("lock expired"),
            LockLostReason::NotHeld => f.write_str("lock not held"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message {sequence_number}: {reason}")]
    LockLost {
        sequence_number: i64,
        reason: LockLostReason,
    },

    #[error(
        "message {sequence_number}: renewal would exceed the auto-renewal ceiling of {}s",
        ceiling.as_secs()
    )]
    RenewalCeilingExceeded {
        sequence_number: i64,
        ceiling: Duration,
    },

    #[error("message at index {index} is {size} bytes, batch ceiling is {max_size} bytes")]
    MessageTooLarge {
        index: usize,
        size: usize,
        max_size: usize,
    },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("scheduled messages already released: {sequence_numbers:?}")]
    AlreadyReleased { sequence_numbers: Vec<i64> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("invalid queue address: {0}")]
    InvalidAddress(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("persistence error: {0}")]
    Persistence(#[from] sled::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl BusError {
    pub fn lock_lost(sequence_number: i64, reason: LockLostReason) -> Self {
        BusError::LockLost {
            sequence_number,
            reason,
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        BusError::UnsupportedOperation(what.into())
    }

    /// Stable, machine-readable code used in front-end error responses.
    pub fn code(&self) -> &'static str {
        match self {
            BusError::LockLost { .. } => "LOCK_LOST",
            BusError::RenewalCeilingExceeded { .. } => "RENEWAL_CEILING_EXCEEDED",
            BusError::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            BusError::UnsupportedOperation(_) => "UNSUPPORTED_OPERATION",
            BusError::AlreadyReleased { .. } => "ALREADY_RELEASED",
            BusError::Transport(_) => "TRANSPORT",
            BusError::Closed(_) => "CLOSED",
            BusError::InvalidAddress(_) => "INVALID_ADDRESS",
            BusError::Serialization(_) => "SERIALIZATION",
            BusError::Persistence(_) => "PERSISTENCE",
            BusError::Config(_) => "CONFIG",
        }
    }

    /// Network-level failures the caller may retry, keeping in mind that
    /// `complete`, `abandon` and `dead_letter` can double-settle.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Transport(_))
    }
}
