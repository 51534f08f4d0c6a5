use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// How many acknowledged completions a receiver remembers, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupPolicy {
    pub capacity: usize,
    pub window: Duration,
}

impl DedupPolicy {
    /// `None` when `capacity` is zero.
    pub fn bounded(capacity: usize, window: Duration) -> Option<Self> {
        (capacity > 0).then_some(Self { capacity, window })
    }
}

/// Bounded FIFO of message ids whose `complete` the broker acknowledged.
#[derive(Debug)]
pub(crate) struct RecentCompletions {
    policy: DedupPolicy,
    order: VecDeque<(String, Instant)>,
    ids: HashSet<String>,
}

impl RecentCompletions {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            order: VecDeque::with_capacity(policy.capacity),
            ids: HashSet::with_capacity(policy.capacity),
        }
    }

    pub fn record(&mut self, message_id: &str, now: Instant) {
        self.evict(now);
        if !self.ids.insert(message_id.to_string()) {
            return;
        }
        self.order.push_back((message_id.to_string(), now));
        while self.order.len() > self.policy.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    pub fn contains(&mut self, message_id: &str, now: Instant) -> bool {
        self.evict(now);
        self.ids.contains(message_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((id, recorded_at)) = self.order.front() {
            if now.duration_since(*recorded_at) < self.policy.window {
                break;
            }
            self.ids.remove(id);
            self.order.pop_front();
        }
    }
}
