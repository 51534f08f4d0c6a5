//! # PeekLock
//!
//! `peeklock` is a message lease, batching and scheduling client for a
//! Service Bus style queue broker, together with an embedded in-memory broker
//! and a small WebSocket front-end to drive it.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: The transport seam to the broker, the message model, queue addresses, and the in-memory broker.
//! - `client`: Receivers with lock leases and auto-renewal, senders with batch packing and scheduling, and `BusClient`.
//! - `config`: Handles loading and managing configuration.
//! - `persistence`: A `sled` ledger of deferred sequence numbers.
//! - `transport`: The WebSocket front-end and its JSON protocol.
//! - `utils`: Shared utilities, such as error handling and logging.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
