use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::broker::address::SubQueue;
use crate::broker::message::{MessageState, OutboundMessage, ReceivedMessage};
use crate::broker::transport::{ReceiveMode, SettleAction};
use crate::utils::{BusError, LockLostReason, Result};

/// Dead-letter reason used when a message runs out of delivery attempts.
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// The two physical message maps behind a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Main,
    DeadLetter,
}

impl From<SubQueue> for Stream {
    fn from(sub_queue: SubQueue) -> Self {
        match sub_queue {
            SubQueue::Main | SubQueue::Deferred => Stream::Main,
            SubQueue::DeadLetter => Stream::DeadLetter,
        }
    }
}

/// State a locked message returns to when its lock ends without settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Active,
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StoredState {
    Active,
    Deferred,
    Scheduled {
        release_at: DateTime<Utc>,
    },
    Locked {
        token: Uuid,
        until: DateTime<Utc>,
        holder: u64,
        origin: Origin,
    },
}

impl From<Origin> for StoredState {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::Active => StoredState::Active,
            Origin::Deferred => StoredState::Deferred,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub message: OutboundMessage,
    pub sequence_number: i64,
    pub enqueued_at: DateTime<Utc>,
    pub delivery_count: u32,
    pub state: StoredState,
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_description: Option<String>,
}

impl StoredMessage {
    fn visible_state(&self) -> MessageState {
        match &self.state {
            StoredState::Active => MessageState::Active,
            StoredState::Deferred => MessageState::Deferred,
            StoredState::Scheduled { .. } => MessageState::Scheduled,
            StoredState::Locked { origin, .. } => match origin {
                Origin::Active => MessageState::Active,
                Origin::Deferred => MessageState::Deferred,
            },
        }
    }

    fn is_deferred(&self) -> bool {
        self.visible_state() == MessageState::Deferred
    }

    /// Read-only view: never carries a lock token.
    pub fn snapshot(&self) -> ReceivedMessage {
        self.view(None)
    }

    fn view(&self, lock: Option<(Uuid, DateTime<Utc>)>) -> ReceivedMessage {
        ReceivedMessage {
            body: self.message.body.clone(),
            message_id: self.message.message_id.clone(),
            subject: self.message.subject.clone(),
            sequence_number: self.sequence_number,
            enqueued_at: self.enqueued_at,
            delivery_count: self.delivery_count,
            state: self.visible_state(),
            lock_token: lock.map(|(token, _)| token),
            locked_until: lock.map(|(_, until)| until),
            scheduled_enqueue_time: self.scheduled_enqueue_time,
            dead_letter_reason: self.dead_letter_reason.clone(),
            dead_letter_description: self.dead_letter_description.clone(),
        }
    }
}

/// Everything the broker keeps for one queue name.
#[derive(Debug)]
pub(crate) struct QueueStore {
    next_sequence: i64,
    main: BTreeMap<i64, StoredMessage>,
    dead_letter: BTreeMap<i64, StoredMessage>,
    notify: Arc<Notify>,
}

impl Default for QueueStore {
    fn default() -> Self {
        Self {
            next_sequence: 1,
            main: BTreeMap::new(),
            dead_letter: BTreeMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl QueueStore {
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn stream(&self, stream: Stream) -> &BTreeMap<i64, StoredMessage> {
        match stream {
            Stream::Main => &self.main,
            Stream::DeadLetter => &self.dead_letter,
        }
    }

    fn stream_mut(&mut self, stream: Stream) -> &mut BTreeMap<i64, StoredMessage> {
        match stream {
            Stream::Main => &mut self.main,
            Stream::DeadLetter => &mut self.dead_letter,
        }
    }

    pub fn len(&self, stream: Stream) -> usize {
        self.stream(stream).len()
    }

    /// Appends a message and returns its sequence number.
    pub fn enqueue(
        &mut self,
        message: OutboundMessage,
        release_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> i64 {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;

        let state = match release_at {
            Some(release_at) => StoredState::Scheduled { release_at },
            None => StoredState::Active,
        };
        self.main.insert(
            sequence_number,
            StoredMessage {
                message,
                sequence_number,
                enqueued_at: now,
                delivery_count: 0,
                state,
                scheduled_enqueue_time: release_at,
                dead_letter_reason: None,
                dead_letter_description: None,
            },
        );
        sequence_number
    }

    pub fn wake_receivers(&self) {
        self.notify.notify_waiters();
    }

    /// Releases due scheduled messages and expired locks. Returns true when
    /// anything became receivable.
    pub fn sweep(&mut self, now: DateTime<Utc>, max_delivery_count: u32) -> bool {
        let mut released = false;
        let mut exhausted = Vec::new();

        for (seq, stored) in self.main.iter_mut() {
            match stored.state {
                StoredState::Scheduled { release_at } if release_at <= now => {
                    stored.state = StoredState::Active;
                    released = true;
                }
                StoredState::Locked { until, origin, .. } if until <= now => {
                    stored.state = origin.into();
                    released = true;
                    if exhausted_deliveries(stored, max_delivery_count) {
                        exhausted.push(*seq);
                    }
                }
                _ => {}
            }
        }

        for stored in self.dead_letter.values_mut() {
            if let StoredState::Locked { until, origin, .. } = stored.state {
                if until <= now {
                    stored.state = origin.into();
                    released = true;
                }
            }
        }

        for seq in exhausted {
            self.move_to_dead_letter(seq, Some(MAX_DELIVERY_COUNT_EXCEEDED.to_string()), None);
        }

        released
    }

    /// Hands out up to `max_count` active messages in sequence order.
    pub fn take_visible(
        &mut self,
        stream: Stream,
        holder: u64,
        mode: ReceiveMode,
        max_count: usize,
        now: DateTime<Utc>,
        lock_duration: TimeDelta,
    ) -> Vec<ReceivedMessage> {
        let ready: Vec<i64> = self
            .stream(stream)
            .values()
            .filter(|stored| stored.state == StoredState::Active)
            .map(|stored| stored.sequence_number)
            .take(max_count)
            .collect();

        let messages = self.stream_mut(stream);
        ready
            .into_iter()
            .filter_map(|seq| deliver(messages, seq, holder, mode, now, lock_duration, Origin::Active))
            .collect()
    }

    /// Hands out deferred messages by exact sequence number.
    pub fn take_deferred(
        &mut self,
        stream: Stream,
        sequence_numbers: &[i64],
        holder: u64,
        mode: ReceiveMode,
        now: DateTime<Utc>,
        lock_duration: TimeDelta,
    ) -> Vec<ReceivedMessage> {
        let messages = self.stream_mut(stream);
        let mut delivered = Vec::new();
        for seq in sequence_numbers {
            let deferred = messages
                .get(seq)
                .is_some_and(|stored| stored.state == StoredState::Deferred);
            if !deferred {
                continue;
            }
            if let Some(message) =
                deliver(messages, *seq, holder, mode, now, lock_duration, Origin::Deferred)
            {
                delivered.push(message);
            }
        }
        delivered
    }

    /// Read-only listing starting at `from_sequence_number`.
    pub fn peek(
        &self,
        sub_queue: SubQueue,
        count: usize,
        from_sequence_number: i64,
    ) -> Vec<ReceivedMessage> {
        self.stream(sub_queue.into())
            .range(from_sequence_number..)
            .map(|(_, stored)| stored)
            .filter(|stored| sub_queue != SubQueue::Deferred || stored.is_deferred())
            .take(count)
            .map(StoredMessage::snapshot)
            .collect()
    }

    /// Looks a lock up and checks that `holder` still owns it. An expired lock
    /// is released on the spot.
    fn held_lock(
        &mut self,
        stream: Stream,
        token: Uuid,
        holder: u64,
        now: DateTime<Utc>,
    ) -> Result<(i64, Origin)> {
        let messages = self.stream_mut(stream);
        let Some(stored) = messages.values_mut().find(
            |stored| matches!(stored.state, StoredState::Locked { token: t, .. } if t == token),
        ) else {
            return Err(BusError::lock_lost(0, LockLostReason::NotHeld));
        };

        let StoredState::Locked {
            until,
            holder: owner,
            origin,
            ..
        } = stored.state
        else {
            return Err(BusError::lock_lost(stored.sequence_number, LockLostReason::NotHeld));
        };

        if owner != holder {
            return Err(BusError::lock_lost(stored.sequence_number, LockLostReason::NotHeld));
        }
        if until <= now {
            stored.state = origin.into();
            return Err(BusError::lock_lost(stored.sequence_number, LockLostReason::Expired));
        }
        Ok((stored.sequence_number, origin))
    }

    pub fn renew(
        &mut self,
        stream: Stream,
        token: Uuid,
        holder: u64,
        now: DateTime<Utc>,
        lock_duration: TimeDelta,
    ) -> Result<DateTime<Utc>> {
        let (seq, origin) = self.held_lock(stream, token, holder, now)?;
        let until = now + lock_duration;
        if let Some(stored) = self.stream_mut(stream).get_mut(&seq) {
            stored.state = StoredState::Locked {
                token,
                until,
                holder,
                origin,
            };
        }
        Ok(until)
    }

    /// Applies a settlement. Returns the settled sequence number.
    pub fn settle(
        &mut self,
        stream: Stream,
        token: Uuid,
        holder: u64,
        action: SettleAction,
        now: DateTime<Utc>,
        max_delivery_count: u32,
    ) -> Result<i64> {
        if stream == Stream::DeadLetter && matches!(action, SettleAction::DeadLetter { .. }) {
            return Err(BusError::unsupported(
                "dead-lettering a message that is already in the dead-letter sub-queue",
            ));
        }

        let (seq, origin) = self.held_lock(stream, token, holder, now)?;
        let messages = self.stream_mut(stream);

        match action {
            SettleAction::Complete => {
                messages.remove(&seq);
            }
            SettleAction::Abandon => {
                let mut exhausted = false;
                if let Some(stored) = messages.get_mut(&seq) {
                    stored.state = origin.into();
                    exhausted =
                        stream == Stream::Main && exhausted_deliveries(stored, max_delivery_count);
                }
                if exhausted {
                    self.move_to_dead_letter(seq, Some(MAX_DELIVERY_COUNT_EXCEEDED.to_string()), None);
                }
            }
            SettleAction::Defer => {
                if let Some(stored) = messages.get_mut(&seq) {
                    stored.state = StoredState::Deferred;
                }
            }
            SettleAction::DeadLetter {
                reason,
                description,
            } => {
                self.move_to_dead_letter(seq, reason, description);
            }
        }
        Ok(seq)
    }

    /// Removes still-scheduled messages. Returns the ones that were already
    /// released (or no longer exist).
    pub fn cancel_scheduled(&mut self, sequence_numbers: &[i64], now: DateTime<Utc>) -> Vec<i64> {
        let mut released = Vec::new();
        for seq in sequence_numbers {
            match self.main.get(seq).map(|stored| &stored.state) {
                Some(StoredState::Scheduled { release_at }) if *release_at > now => {
                    self.main.remove(seq);
                }
                _ => released.push(*seq),
            }
        }
        released
    }

    fn move_to_dead_letter(
        &mut self,
        seq: i64,
        reason: Option<String>,
        description: Option<String>,
    ) {
        if let Some(mut stored) = self.main.remove(&seq) {
            stored.state = StoredState::Active;
            stored.dead_letter_reason = reason;
            stored.dead_letter_description = description;
            self.dead_letter.insert(seq, stored);
        }
    }
}

fn exhausted_deliveries(stored: &StoredMessage, max_delivery_count: u32) -> bool {
    max_delivery_count > 0 && stored.delivery_count >= max_delivery_count
}

fn deliver(
    messages: &mut BTreeMap<i64, StoredMessage>,
    seq: i64,
    holder: u64,
    mode: ReceiveMode,
    now: DateTime<Utc>,
    lock_duration: TimeDelta,
    origin: Origin,
) -> Option<ReceivedMessage> {
    match mode {
        ReceiveMode::ReceiveAndDelete => {
            let mut stored = messages.remove(&seq)?;
            stored.delivery_count += 1;
            Some(stored.snapshot())
        }
        ReceiveMode::PeekLock => {
            let stored = messages.get_mut(&seq)?;
            let token = Uuid::new_v4();
            let until = now + lock_duration;
            stored.delivery_count += 1;
            stored.state = StoredState::Locked {
                token,
                until,
                holder,
                origin,
            };
            Some(stored.view(Some((token, until))))
        }
    }
}
