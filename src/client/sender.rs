//! Producer side: batch packing, sending and scheduling.
//!
//! Every multi-message operation goes through the same first-fit-in-order
//! packer. Messages are added to the current batch in caller order; when one
//! does not fit, the current batch is flushed and the message is retried on a
//! fresh batch. If it does not fit there either it is larger than the ceiling
//! on its own and the whole operation aborts with `MessageTooLarge`. Batches
//! flushed before that point stay sent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::broker::{BrokerTransport, Handle, HandleKind, OutboundMessage, QueueAddress};
use crate::client::batch::MessageBatch;
use crate::utils::{BusError, Result};

pub struct Sender {
    transport: Arc<dyn BrokerTransport>,
    handle: Handle,
    max_batch_size: usize,
    closed: AtomicBool,
}

impl Sender {
    pub(crate) async fn open(
        transport: Arc<dyn BrokerTransport>,
        queue: &str,
        max_batch_size: usize,
    ) -> Result<Self> {
        let handle = transport
            .open(&QueueAddress::main(queue), HandleKind::Sender)
            .await?;
        Ok(Self {
            transport,
            handle,
            max_batch_size,
            closed: AtomicBool::new(false),
        })
    }

    pub fn queue(&self) -> &str {
        &self.handle.address.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BusError::Closed("sender"))
        } else {
            Ok(())
        }
    }

    /// Empty batch bounded by `max_size_in_bytes`, or by the sender's default.
    pub fn create_message_batch(&self, max_size_in_bytes: Option<usize>) -> MessageBatch {
        MessageBatch::new(max_size_in_bytes.unwrap_or(self.max_batch_size))
    }

    /// Sends one batch. An empty batch is a no-op.
    pub async fn send_batch(&self, batch: MessageBatch) -> Result<Vec<i64>> {
        self.flush(batch, None).await
    }

    pub async fn send_message(&self, message: OutboundMessage) -> Result<i64> {
        let sequence_numbers = self.send_messages(std::slice::from_ref(&message)).await?;
        sequence_numbers
            .first()
            .copied()
            .ok_or_else(|| BusError::Transport("broker assigned no sequence number".into()))
    }

    /// Packs `messages` into as few batches as in-order packing allows and
    /// sends them. Returns the sequence numbers in input order.
    pub async fn send_messages(&self, messages: &[OutboundMessage]) -> Result<Vec<i64>> {
        self.pack(messages, None).await
    }

    /// Enqueues `messages` invisibly until `release_at`.
    pub async fn schedule_messages(
        &self,
        messages: &[OutboundMessage],
        release_at: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let sequence_numbers = self.pack(messages, Some(release_at)).await?;
        info!(
            "Scheduled {} message(s) on {} for {}",
            sequence_numbers.len(),
            self.queue(),
            release_at
        );
        Ok(sequence_numbers)
    }

    /// Cancels scheduled messages. Those released already are reported via
    /// `BusError::AlreadyReleased`; the others are cancelled regardless.
    pub async fn cancel_scheduled_messages(&self, sequence_numbers: &[i64]) -> Result<()> {
        self.ensure_open()?;
        if sequence_numbers.is_empty() {
            return Ok(());
        }
        self.transport
            .cancel_scheduled(&self.handle, sequence_numbers)
            .await
    }

    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport.close(&self.handle).await
    }

    async fn pack(
        &self,
        messages: &[OutboundMessage],
        release_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<i64>> {
        self.ensure_open()?;
        let mut sequence_numbers = Vec::with_capacity(messages.len());
        let mut batch = self.create_message_batch(None);

        for (index, message) in messages.iter().enumerate() {
            if batch.try_add_message(message)? {
                continue;
            }

            if !batch.is_empty() {
                let full = std::mem::replace(&mut batch, self.create_message_batch(None));
                sequence_numbers.extend(self.flush(full, release_at).await?);
                if batch.try_add_message(message)? {
                    continue;
                }
            }

            return Err(BusError::MessageTooLarge {
                index,
                size: message.serialized_size()?,
                max_size: batch.max_size_in_bytes(),
            });
        }

        sequence_numbers.extend(self.flush(batch, release_at).await?);
        Ok(sequence_numbers)
    }

    async fn flush(
        &self,
        batch: MessageBatch,
        release_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<i64>> {
        self.ensure_open()?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Flushing batch of {} message(s), {} bytes, to {}",
            batch.count(),
            batch.size_in_bytes(),
            self.queue()
        );
        let messages = batch.into_messages();
        match release_at {
            Some(release_at) => {
                self.transport
                    .schedule_batch(&self.handle, messages, release_at)
                    .await
            }
            None => self.transport.send_batch(&self.handle, messages).await,
        }
    }
}
