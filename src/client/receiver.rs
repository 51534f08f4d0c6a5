//! Message receivers
//!
//! [`Receiver`] is the capability every receiver shares. The delivery mode is
//! fixed at construction by picking one of two concrete types:
//!
//! - [`PeekLockReceiver`]: messages stay on the broker, locked for this
//!   receiver, until they are settled or the lock expires. At-least-once.
//! - [`ReceiveAndDeleteReceiver`]: messages are removed as they are
//!   delivered. At-most-once; every settlement call is rejected.
//!
//! `receive_messages` returns each message with its lock token. Settlement
//! takes the message back explicitly, so overlapping receives never share
//! state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::broker::{
    BrokerTransport, Handle, HandleKind, QueueAddress, ReceiveMode, ReceivedMessage, SettleAction,
    SubQueue,
};
use crate::client::dedup::{DedupPolicy, RecentCompletions};
use crate::client::lease::{Lease, LeaseContext, LeaseRegistry};
use crate::client::renewer::LockRenewer;
use crate::utils::{BusError, Result};

/// Extra time granted to the transport beyond `max_wait` before a receive is
/// abandoned client-side.
const FETCH_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    pub mode: ReceiveMode,
    pub sub_queue: SubQueue,
    /// Enables auto-renewal, capped at this cumulative extension. Also caps
    /// manual `renew_message_lock` calls.
    pub max_auto_lock_renewal: Option<Duration>,
    pub dedup: Option<DedupPolicy>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self::peek_lock()
    }
}

impl ReceiverOptions {
    pub fn peek_lock() -> Self {
        Self {
            mode: ReceiveMode::PeekLock,
            sub_queue: SubQueue::Main,
            max_auto_lock_renewal: None,
            dedup: None,
        }
    }

    pub fn receive_and_delete() -> Self {
        Self {
            mode: ReceiveMode::ReceiveAndDelete,
            ..Self::peek_lock()
        }
    }

    pub fn with_sub_queue(mut self, sub_queue: SubQueue) -> Self {
        self.sub_queue = sub_queue;
        self
    }

    pub fn with_auto_lock_renewal(mut self, ceiling: Duration) -> Self {
        self.max_auto_lock_renewal = Some(ceiling);
        self
    }

    pub fn with_dedup(mut self, policy: DedupPolicy) -> Self {
        self.dedup = Some(policy);
        self
    }
}

#[async_trait]
pub trait Receiver: Send + Sync {
    fn address(&self) -> &QueueAddress;

    fn mode(&self) -> ReceiveMode;

    fn is_closed(&self) -> bool;

    /// Waits at most `max_wait`; may return fewer than `max_count` messages,
    /// or none.
    async fn receive_messages(
        &self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Read-only. Without `from_sequence_number` it continues after the last
    /// peeked message.
    async fn peek_messages(
        &self,
        count: usize,
        from_sequence_number: Option<i64>,
    ) -> Result<Vec<ReceivedMessage>>;

    async fn receive_deferred_messages(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>>;

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<()>;

    async fn abandon_message(&self, message: &ReceivedMessage) -> Result<()>;

    async fn defer_message(&self, message: &ReceivedMessage) -> Result<()>;

    async fn dead_letter_message(
        &self,
        message: &ReceivedMessage,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<()>;

    async fn renew_message_lock(&self, message: &ReceivedMessage) -> Result<DateTime<Utc>>;

    async fn close(&self) -> Result<()>;
}

/// The handle-level plumbing both receiver types share.
struct ReceiverLink {
    transport: Arc<dyn BrokerTransport>,
    handle: Handle,
    closed: AtomicBool,
    peek_cursor: AtomicI64,
}

impl ReceiverLink {
    async fn open(
        transport: Arc<dyn BrokerTransport>,
        address: QueueAddress,
        mode: ReceiveMode,
    ) -> Result<Self> {
        let handle = transport.open(&address, HandleKind::Receiver(mode)).await?;
        Ok(Self {
            transport,
            handle,
            closed: AtomicBool::new(false),
            peek_cursor: AtomicI64::new(1),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BusError::Closed("receiver"))
        } else {
            Ok(())
        }
    }

    async fn fetch(&self, max_count: usize, max_wait: Duration) -> Result<Vec<ReceivedMessage>> {
        self.ensure_open()?;
        if self.handle.address.sub_queue == SubQueue::Deferred {
            return Err(BusError::unsupported(
                "deferred messages can only be received by sequence number",
            ));
        }
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let fetch = self.transport.fetch(&self.handle, max_count, max_wait);
        match tokio::time::timeout(max_wait + FETCH_GRACE, fetch).await {
            Ok(result) => result,
            Err(_) => {
                let waited = max_wait + FETCH_GRACE;
                warn!("Receive on {} did not answer within {:?}", self.handle.address, waited);
                // Messages may already be locked for this receive; it is not an empty queue.
                Err(BusError::Transport(format!(
                    "receive on {} did not answer within {:?}",
                    self.handle.address, waited
                )))
            }
        }
    }

    async fn peek(
        &self,
        count: usize,
        from_sequence_number: Option<i64>,
    ) -> Result<Vec<ReceivedMessage>> {
        self.ensure_open()?;
        let from = from_sequence_number.unwrap_or_else(|| self.peek_cursor.load(Ordering::SeqCst));
        let messages = self.transport.peek(&self.handle, count, from).await?;
        if let Some(last) = messages.last() {
            self.peek_cursor
                .store(last.sequence_number + 1, Ordering::SeqCst);
        }
        Ok(messages)
    }

    async fn fetch_deferred(&self, sequence_numbers: &[i64]) -> Result<Vec<ReceivedMessage>> {
        self.ensure_open()?;
        if sequence_numbers.is_empty() {
            return Ok(Vec::new());
        }
        self.transport
            .fetch_deferred(&self.handle, sequence_numbers)
            .await
    }

    /// Marks the link closed. Returns false when it already was.
    fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if !self.begin_close() {
            return Ok(());
        }
        self.transport.close(&self.handle).await
    }
}

pub struct PeekLockReceiver {
    link: ReceiverLink,
    leases: Arc<LeaseContext>,
    renewer: LockRenewer,
    max_auto_lock_renewal: Option<Duration>,
    completed: Option<Mutex<RecentCompletions>>,
}

impl PeekLockReceiver {
    pub async fn open(
        transport: Arc<dyn BrokerTransport>,
        address: QueueAddress,
        lock_duration: Duration,
        options: &ReceiverOptions,
    ) -> Result<Self> {
        let link = ReceiverLink::open(transport.clone(), address, ReceiveMode::PeekLock).await?;
        let leases = Arc::new(LeaseContext {
            transport,
            handle: link.handle.clone(),
            registry: LeaseRegistry::new(),
            lock_duration,
        });
        Ok(Self {
            link,
            leases,
            renewer: LockRenewer::default(),
            max_auto_lock_renewal: options.max_auto_lock_renewal,
            completed: options
                .dedup
                .map(|policy| Mutex::new(RecentCompletions::new(policy))),
        })
    }

    /// The lease currently held for `message`, if any.
    pub fn lease(&self, message: &ReceivedMessage) -> Option<Lease> {
        self.leases.registry.get(&message.lock_token?)
    }

    pub fn active_leases(&self) -> usize {
        self.leases.registry.len()
    }

    pub fn active_renewals(&self) -> usize {
        self.renewer.active()
    }

    fn completions(&self) -> Option<MutexGuard<'_, RecentCompletions>> {
        self.completed
            .as_ref()
            .map(|completed| completed.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn is_duplicate(&self, message_id: &str) -> bool {
        self.completions()
            .is_some_and(|mut completed| completed.contains(message_id, Instant::now()))
    }

    async fn prune_expired(&self) {
        for token in self.leases.registry.prune_expired(Utc::now()) {
            self.renewer.stop(&token).await;
        }
    }

    /// Registers a lease for every locked delivery and starts auto-renewal.
    /// Deliveries of already completed message ids are completed and dropped.
    async fn track(&self, delivered: Vec<ReceivedMessage>) -> Vec<ReceivedMessage> {
        let mut kept = Vec::with_capacity(delivered.len());
        for message in delivered {
            let Some(lease) =
                Lease::from_delivery(&message, self.link.handle.id, self.max_auto_lock_renewal)
            else {
                kept.push(message);
                continue;
            };
            let lock_token = lease.lock_token;
            self.leases.registry.insert(lease);

            if self.is_duplicate(&message.message_id) {
                debug!(
                    "Dropping duplicate delivery of message {} ({})",
                    message.sequence_number, message.message_id
                );
                if let Err(e) = self.settle(&message, SettleAction::Complete).await {
                    warn!(
                        "Could not complete duplicate message {}: {}",
                        message.sequence_number, e
                    );
                }
                continue;
            }

            if self.max_auto_lock_renewal.is_some() {
                self.renewer
                    .start(self.leases.clone(), lock_token, message.sequence_number);
            }
            kept.push(message);
        }
        kept
    }

    /// A receive that overlapped `close` leaves no lease or renewal behind.
    /// Its locks lapse on the broker.
    async fn unless_closed(&self, kept: Vec<ReceivedMessage>) -> Result<Vec<ReceivedMessage>> {
        if !self.link.is_closed() {
            return Ok(kept);
        }
        self.renewer.stop_all().await;
        self.leases.registry.drain();
        Err(BusError::Closed("receiver"))
    }

    async fn settle(&self, message: &ReceivedMessage, action: SettleAction) -> Result<()> {
        self.link.ensure_open()?;
        let Some(lock_token) = message.lock_token else {
            return Err(BusError::unsupported(format!(
                "{} of message {} which was not received under a lock",
                action.name(),
                message.sequence_number
            )));
        };
        let sequence_number = message.sequence_number;
        let registry = &self.leases.registry;

        registry.begin_settle(lock_token, sequence_number, Utc::now())?;
        // No renewal may race the settlement to the broker.
        self.renewer.stop(&lock_token).await;

        let completing = action == SettleAction::Complete;
        let action_name = action.name();
        match self
            .link
            .transport
            .settle(&self.link.handle, lock_token, action)
            .await
        {
            Ok(()) => {
                registry.finish_settle(&lock_token);
                if completing {
                    if let Some(mut completed) = self.completions() {
                        completed.record(&message.message_id, Instant::now());
                    }
                }
                debug!("Message {} settled: {}", sequence_number, action_name);
                Ok(())
            }
            Err(BusError::LockLost { reason, .. }) => {
                registry.remove(&lock_token);
                Err(BusError::lock_lost(sequence_number, reason))
            }
            Err(e) => {
                registry.abort_settle(&lock_token);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Receiver for PeekLockReceiver {
    fn address(&self) -> &QueueAddress {
        &self.link.handle.address
    }

    fn mode(&self) -> ReceiveMode {
        ReceiveMode::PeekLock
    }

    fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    async fn receive_messages(
        &self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        self.prune_expired().await;
        let delivered = self.link.fetch(max_count, max_wait).await?;
        let kept = self.track(delivered).await;
        self.unless_closed(kept).await
    }

    async fn peek_messages(
        &self,
        count: usize,
        from_sequence_number: Option<i64>,
    ) -> Result<Vec<ReceivedMessage>> {
        self.link.peek(count, from_sequence_number).await
    }

    async fn receive_deferred_messages(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>> {
        self.prune_expired().await;
        let delivered = self.link.fetch_deferred(sequence_numbers).await?;
        let kept = self.track(delivered).await;
        self.unless_closed(kept).await
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<()> {
        self.settle(message, SettleAction::Complete).await
    }

    async fn abandon_message(&self, message: &ReceivedMessage) -> Result<()> {
        self.settle(message, SettleAction::Abandon).await
    }

    async fn defer_message(&self, message: &ReceivedMessage) -> Result<()> {
        self.settle(message, SettleAction::Defer).await
    }

    async fn dead_letter_message(
        &self,
        message: &ReceivedMessage,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<()> {
        self.settle(
            message,
            SettleAction::DeadLetter {
                reason,
                description,
            },
        )
        .await
    }

    async fn renew_message_lock(&self, message: &ReceivedMessage) -> Result<DateTime<Utc>> {
        self.link.ensure_open()?;
        let Some(lock_token) = message.lock_token else {
            return Err(BusError::unsupported(format!(
                "renewing message {} which was not received under a lock",
                message.sequence_number
            )));
        };
        self.leases.renew(lock_token, message.sequence_number).await
    }

    /// Stops every renewal task and drops the leases. Locks still held on the
    /// broker lapse at their expiry.
    async fn close(&self) -> Result<()> {
        if !self.link.begin_close() {
            return Ok(());
        }
        self.renewer.stop_all().await;
        let abandoned = self.leases.registry.drain();
        if !abandoned.is_empty() {
            debug!(
                "Closing {} with {} unsettled lease(s)",
                self.link.handle.address,
                abandoned.len()
            );
        }
        self.link.transport.close(&self.link.handle).await
    }
}

pub struct ReceiveAndDeleteReceiver {
    link: ReceiverLink,
}

impl ReceiveAndDeleteReceiver {
    pub async fn open(transport: Arc<dyn BrokerTransport>, address: QueueAddress) -> Result<Self> {
        let link = ReceiverLink::open(transport, address, ReceiveMode::ReceiveAndDelete).await?;
        Ok(Self { link })
    }

    fn unsupported<T>(&self, operation: &str) -> Result<T> {
        Err(BusError::unsupported(format!(
            "{operation} in receive-and-delete mode"
        )))
    }
}

#[async_trait]
impl Receiver for ReceiveAndDeleteReceiver {
    fn address(&self) -> &QueueAddress {
        &self.link.handle.address
    }

    fn mode(&self) -> ReceiveMode {
        ReceiveMode::ReceiveAndDelete
    }

    fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    async fn receive_messages(
        &self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        self.link.fetch(max_count, max_wait).await
    }

    async fn peek_messages(
        &self,
        count: usize,
        from_sequence_number: Option<i64>,
    ) -> Result<Vec<ReceivedMessage>> {
        self.link.peek(count, from_sequence_number).await
    }

    async fn receive_deferred_messages(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>> {
        self.link.fetch_deferred(sequence_numbers).await
    }

    async fn complete_message(&self, _message: &ReceivedMessage) -> Result<()> {
        self.unsupported("complete")
    }

    async fn abandon_message(&self, _message: &ReceivedMessage) -> Result<()> {
        self.unsupported("abandon")
    }

    async fn defer_message(&self, _message: &ReceivedMessage) -> Result<()> {
        self.unsupported("defer")
    }

    async fn dead_letter_message(
        &self,
        _message: &ReceivedMessage,
        _reason: Option<String>,
        _description: Option<String>,
    ) -> Result<()> {
        self.unsupported("dead_letter")
    }

    async fn renew_message_lock(&self, _message: &ReceivedMessage) -> Result<DateTime<Utc>> {
        self.unsupported("renew_lock")
    }

    async fn close(&self) -> Result<()> {
        self.link.close().await
    }
}
