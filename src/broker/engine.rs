//! Broker engine
//!
//! This module contains the in-memory broker used by the binary and by the
//! test-suite. It stands in for the external broker service and implements
//! [`BrokerTransport`]:
//! - keeping per-queue main and dead-letter streams ordered by sequence number
//! - locking messages for peek-lock receivers and expiring those locks
//! - releasing scheduled messages once their release time passes
//! - dead-lettering messages that exceed the maximum delivery count
//!
//! Concurrency and usage notes:
//! - State lives behind one `std::sync::Mutex`; it is never held across an
//!   `.await`. Waiting receivers park on a per-queue `Notify` and also poll,
//!   because lock expiry and scheduled release are time driven.
//! - Expired locks and due scheduled messages are handled lazily whenever a
//!   queue is touched, there is no background sweeper task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::broker::address::{QueueAddress, SubQueue};
use crate::broker::message::{OutboundMessage, ReceivedMessage};
use crate::broker::queue::{QueueStore, Stream};
use crate::broker::transport::{BrokerTransport, Handle, HandleKind, ReceiveMode, SettleAction};
use crate::config::Settings;
use crate::utils::{BusError, Result};

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Lock granted on delivery and on every renewal.
    pub lock_duration: Duration,
    /// Deliveries after which an abandoned or expired message is
    /// dead-lettered. Zero disables the limit.
    pub max_delivery_count: u32,
    /// Upper bound on how long a waiting fetch sleeps between checks.
    pub poll_interval: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(60),
            max_delivery_count: 10,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl From<&Settings> for BrokerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            lock_duration: settings.bus.lock_duration(),
            max_delivery_count: settings.broker.max_delivery_count,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct InMemoryBroker {
    options: BrokerOptions,
    lock_duration: TimeDelta,
    queues: Mutex<HashMap<String, QueueStore>>,
    handles: Mutex<HashMap<u64, Handle>>,
    next_handle: AtomicU64,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerOptions::default())
    }
}

impl InMemoryBroker {
    pub fn new(options: BrokerOptions) -> Self {
        // Durations beyond chrono's range are clamped to a year.
        let lock_duration =
            TimeDelta::from_std(options.lock_duration).unwrap_or_else(|_| TimeDelta::days(365));
        Self {
            options,
            lock_duration,
            queues: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// Number of messages currently held for `address`, in any state.
    pub fn depth(&self, address: &QueueAddress) -> usize {
        self.queues()
            .get(&address.name)
            .map(|store| store.len(address.sub_queue.into()))
            .unwrap_or(0)
    }

    pub fn open_handles(&self) -> usize {
        self.handles().len()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueStore>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<u64, Handle>> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self, handle: &Handle) -> Result<()> {
        if self.handles().contains_key(&handle.id) {
            Ok(())
        } else {
            Err(BusError::Closed("handle"))
        }
    }

    fn receive_mode(&self, handle: &Handle) -> Result<ReceiveMode> {
        self.ensure_open(handle)?;
        match handle.kind {
            HandleKind::Receiver(mode) => Ok(mode),
            HandleKind::Sender => Err(BusError::unsupported("receiving on a sender handle")),
        }
    }

    fn ensure_sender(&self, handle: &Handle) -> Result<()> {
        self.ensure_open(handle)?;
        match handle.kind {
            HandleKind::Sender => Ok(()),
            HandleKind::Receiver(_) => Err(BusError::unsupported("sending on a receiver handle")),
        }
    }

    fn decode(messages: &[Vec<u8>]) -> Result<Vec<OutboundMessage>> {
        messages
            .iter()
            .map(|bytes| OutboundMessage::from_bytes(bytes))
            .collect()
    }

    fn enqueue(
        &self,
        queue: &str,
        messages: Vec<OutboundMessage>,
        release_at: Option<DateTime<Utc>>,
    ) -> Vec<i64> {
        let now = Utc::now();
        let mut queues = self.queues();
        let store = queues.entry(queue.to_string()).or_default();
        let sequence_numbers = messages
            .into_iter()
            .map(|message| store.enqueue(message, release_at, now))
            .collect();
        store.wake_receivers();
        sequence_numbers
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn open(&self, address: &QueueAddress, kind: HandleKind) -> Result<Handle> {
        if kind == HandleKind::Sender && address.sub_queue != SubQueue::Main {
            return Err(BusError::unsupported(format!("sending to {address}")));
        }

        let handle = Handle {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            address: address.clone(),
            kind,
        };
        self.queues().entry(address.name.clone()).or_default();
        self.handles().insert(handle.id, handle.clone());
        debug!("Opened handle {} on {}", handle.id, address);
        Ok(handle)
    }

    async fn fetch(
        &self,
        handle: &Handle,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let mode = self.receive_mode(handle)?;
        if handle.address.sub_queue == SubQueue::Deferred {
            return Err(BusError::unsupported(
                "deferred messages can only be received by sequence number",
            ));
        }

        let deadline = Instant::now() + max_wait;
        loop {
            let notify = {
                let now = Utc::now();
                let mut queues = self.queues();
                let store = queues.entry(handle.address.name.clone()).or_default();
                store.sweep(now, self.options.max_delivery_count);
                let delivered = store.take_visible(
                    handle.address.sub_queue.into(),
                    handle.id,
                    mode,
                    max_count,
                    now,
                    self.lock_duration,
                );
                if !delivered.is_empty() {
                    return Ok(delivered);
                }
                store.notifier()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wait = (deadline - now).min(self.options.poll_interval);
            let _ = tokio::time::timeout(wait, notify.notified()).await;
            self.ensure_open(handle)?;
        }
    }

    async fn peek(
        &self,
        handle: &Handle,
        count: usize,
        from_sequence_number: i64,
    ) -> Result<Vec<ReceivedMessage>> {
        self.receive_mode(handle)?;
        let mut queues = self.queues();
        let store = queues.entry(handle.address.name.clone()).or_default();
        store.sweep(Utc::now(), self.options.max_delivery_count);
        Ok(store.peek(handle.address.sub_queue, count, from_sequence_number))
    }

    async fn fetch_deferred(
        &self,
        handle: &Handle,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>> {
        let mode = self.receive_mode(handle)?;
        let now = Utc::now();
        let mut queues = self.queues();
        let store = queues.entry(handle.address.name.clone()).or_default();
        store.sweep(now, self.options.max_delivery_count);
        Ok(store.take_deferred(
            handle.address.sub_queue.into(),
            sequence_numbers,
            handle.id,
            mode,
            now,
            self.lock_duration,
        ))
    }

    async fn settle(&self, handle: &Handle, lock_token: Uuid, action: SettleAction) -> Result<()> {
        if self.receive_mode(handle)? != ReceiveMode::PeekLock {
            return Err(BusError::unsupported(format!(
                "{} in receive-and-delete mode",
                action.name()
            )));
        }

        let mut queues = self.queues();
        let store = queues.entry(handle.address.name.clone()).or_default();
        let action_name = action.name();
        let seq = store.settle(
            Stream::from(handle.address.sub_queue),
            lock_token,
            handle.id,
            action,
            Utc::now(),
            self.options.max_delivery_count,
        )?;
        store.wake_receivers();
        debug!("Settled message {} on {} ({})", seq, handle.address, action_name);
        Ok(())
    }

    async fn renew_lock(&self, handle: &Handle, lock_token: Uuid) -> Result<DateTime<Utc>> {
        if self.receive_mode(handle)? != ReceiveMode::PeekLock {
            return Err(BusError::unsupported("renewing a lock in receive-and-delete mode"));
        }

        let mut queues = self.queues();
        let store = queues.entry(handle.address.name.clone()).or_default();
        store.renew(
            Stream::from(handle.address.sub_queue),
            lock_token,
            handle.id,
            Utc::now(),
            self.lock_duration,
        )
    }

    async fn send_batch(&self, handle: &Handle, messages: Vec<Vec<u8>>) -> Result<Vec<i64>> {
        self.ensure_sender(handle)?;
        let decoded = Self::decode(&messages)?;
        Ok(self.enqueue(&handle.address.name, decoded, None))
    }

    async fn schedule_batch(
        &self,
        handle: &Handle,
        messages: Vec<Vec<u8>>,
        release_at: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        self.ensure_sender(handle)?;
        let decoded = Self::decode(&messages)?;
        Ok(self.enqueue(&handle.address.name, decoded, Some(release_at)))
    }

    async fn cancel_scheduled(&self, handle: &Handle, sequence_numbers: &[i64]) -> Result<()> {
        self.ensure_sender(handle)?;
        let released = {
            let mut queues = self.queues();
            let store = queues.entry(handle.address.name.clone()).or_default();
            store.cancel_scheduled(sequence_numbers, Utc::now())
        };

        if released.is_empty() {
            Ok(())
        } else {
            Err(BusError::AlreadyReleased {
                sequence_numbers: released,
            })
        }
    }

    async fn close(&self, handle: &Handle) -> Result<()> {
        if self.handles().remove(&handle.id).is_some() {
            debug!("Closed handle {} on {}", handle.id, handle.address);
        }
        Ok(())
    }
}
