//! The `persistence` module keeps client-side state that must survive a
//! restart.
//!
//! Currently that is the ledger of deferred sequence numbers, stored in
//! `sled` as an embedded key-value store.

pub mod sled_store;

pub use sled_store::{DeferredLedger, DeferredRecord};

#[cfg(test)]
mod tests;
