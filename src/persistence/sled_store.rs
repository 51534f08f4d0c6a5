//! Deferred-message ledger backed by `sled`
//!
//! A deferred message can only be received again by its exact sequence
//! number, so losing the number loses the message. The ledger keeps the
//! numbers per queue in a `sled` tree named `deferred/<queue>`. Keys are the
//! big-endian sequence number, so iteration yields them in enqueue order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::utils::Result;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeferredRecord {
    pub sequence_number: i64,
    pub message_id: String,
    pub deferred_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DeferredLedger {
    db: Db,
}

impl DeferredLedger {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// A ledger that lives only as long as the process.
    pub fn temporary() -> Result<Self> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    fn tree(&self, queue: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("deferred/{queue}"))?)
    }

    pub fn record(&self, queue: &str, sequence_number: i64, message_id: &str) -> Result<()> {
        let record = DeferredRecord {
            sequence_number,
            message_id: message_id.to_string(),
            deferred_at: Utc::now(),
        };
        let serialized = serde_json::to_vec(&record)?;
        self.tree(queue)?
            .insert(sequence_number.to_be_bytes(), serialized)?;
        Ok(())
    }

    /// Forgets a sequence number. Returns whether it was recorded.
    pub fn remove(&self, queue: &str, sequence_number: i64) -> Result<bool> {
        Ok(self
            .tree(queue)?
            .remove(sequence_number.to_be_bytes())?
            .is_some())
    }

    pub fn list(&self, queue: &str) -> Result<Vec<DeferredRecord>> {
        let tree = self.tree(queue)?;
        let mut records = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    pub fn sequence_numbers(&self, queue: &str) -> Result<Vec<i64>> {
        Ok(self
            .list(queue)?
            .into_iter()
            .map(|record| record.sequence_number)
            .collect())
    }

    /// Forgets every queue's deferred numbers. Returns how many were dropped.
    pub fn clear(&self) -> Result<usize> {
        let mut dropped = 0;
        for name in self.db.tree_names() {
            if !name.starts_with(b"deferred/") {
                continue;
            }
            let tree = self.db.open_tree(&name)?;
            dropped += tree.len();
            tree.clear()?;
        }
        Ok(dropped)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for DeferredLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredLedger")
            .field("db", &"sled::Db")
            .finish()
    }
}
