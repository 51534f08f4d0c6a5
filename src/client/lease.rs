//! Lease registry
//!
//! Tracks, per lock token, the locks this receiver currently holds. The
//! broker is authoritative; the registry mirrors what it granted so that
//! obviously dead leases (expired, settled, settling) are rejected without a
//! round trip, and so renewal can be capped by a ceiling.
//!
//! A lease moves `Active -> Settling -> (removed)`. Only one settlement can move
//! a lease to `Settling`, which is how two local call sites racing on the same
//! message resolve: the second one sees `LockLost`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::broker::{BrokerTransport, Handle, ReceivedMessage};
use crate::utils::{BusError, LockLostReason, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Active,
    Settling,
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub sequence_number: i64,
    pub message_id: String,
    pub lock_token: Uuid,
    pub locked_until: DateTime<Utc>,
    /// Maximum cumulative extension; `None` means unbounded manual renewal.
    pub renewal_ceiling: Option<Duration>,
    /// Granted renewals plus those still in flight.
    pub cumulative_extension: Duration,
    /// Id of the receiver handle that holds the lock.
    pub holder: u64,
    pub state: LeaseState,
}

impl Lease {
    /// Builds a lease from a lock-mode delivery. `None` when the message
    /// carries no lock.
    pub fn from_delivery(
        message: &ReceivedMessage,
        holder: u64,
        renewal_ceiling: Option<Duration>,
    ) -> Option<Self> {
        Some(Self {
            sequence_number: message.sequence_number,
            message_id: message.message_id.clone(),
            lock_token: message.lock_token?,
            locked_until: message.locked_until?,
            renewal_ceiling,
            cumulative_extension: Duration::ZERO,
            holder,
            state: LeaseState::Active,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.locked_until <= now
    }
}

#[derive(Debug, Default)]
pub struct LeaseRegistry {
    leases: Mutex<HashMap<Uuid, Lease>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<Uuid, Lease>> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, lease: Lease) {
        self.leases().insert(lease.lock_token, lease);
    }

    pub fn get(&self, lock_token: &Uuid) -> Option<Lease> {
        self.leases().get(lock_token).cloned()
    }

    pub fn len(&self) -> usize {
        self.leases().len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases().is_empty()
    }

    pub fn remove(&self, lock_token: &Uuid) -> Option<Lease> {
        self.leases().remove(lock_token)
    }

    /// Claims the lease for settlement.
    pub fn begin_settle(
        &self,
        lock_token: Uuid,
        sequence_number: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut leases = self.leases();
        let lease = usable(&mut leases, lock_token, sequence_number, now)?;
        lease.state = LeaseState::Settling;
        Ok(())
    }

    /// The broker accepted the settlement; the lease is gone.
    pub fn finish_settle(&self, lock_token: &Uuid) -> Option<Lease> {
        self.remove(lock_token)
    }

    /// The settlement failed without a verdict; the lease may still be held.
    pub fn abort_settle(&self, lock_token: &Uuid) {
        if let Some(lease) = self.leases().get_mut(lock_token) {
            lease.state = LeaseState::Active;
        }
    }

    /// Reserves one more renewal of `increment` against the ceiling.
    ///
    /// The increment is counted before the broker is asked, so renewals that
    /// overlap see each other. Call `release_renewal` if the broker refuses.
    pub fn reserve_renewal(
        &self,
        lock_token: Uuid,
        sequence_number: i64,
        now: DateTime<Utc>,
        increment: Duration,
    ) -> Result<()> {
        let mut leases = self.leases();
        let lease = usable(&mut leases, lock_token, sequence_number, now)?;
        if let Some(ceiling) = lease.renewal_ceiling {
            if lease.cumulative_extension + increment > ceiling {
                return Err(BusError::RenewalCeilingExceeded {
                    sequence_number,
                    ceiling,
                });
            }
        }
        lease.cumulative_extension += increment;
        Ok(())
    }

    /// Gives back a reservation the broker did not grant.
    pub fn release_renewal(&self, lock_token: &Uuid, increment: Duration) {
        if let Some(lease) = self.leases().get_mut(lock_token) {
            lease.cumulative_extension = lease.cumulative_extension.saturating_sub(increment);
        }
    }

    pub fn record_renewal(
        &self,
        lock_token: Uuid,
        sequence_number: i64,
        locked_until: DateTime<Utc>,
    ) -> Result<()> {
        let mut leases = self.leases();
        match leases.get_mut(&lock_token) {
            Some(lease) if lease.state == LeaseState::Active => {
                if locked_until > lease.locked_until {
                    lease.locked_until = locked_until;
                }
                Ok(())
            }
            _ => Err(BusError::lock_lost(sequence_number, LockLostReason::NotHeld)),
        }
    }

    /// Drops active leases whose expiry has passed and returns their tokens.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut leases = self.leases();
        let expired: Vec<Uuid> = leases
            .values()
            .filter(|lease| lease.state == LeaseState::Active && lease.is_expired(now))
            .map(|lease| lease.lock_token)
            .collect();
        for token in &expired {
            leases.remove(token);
        }
        expired
    }

    pub fn drain(&self) -> Vec<Lease> {
        self.leases().drain().map(|(_, lease)| lease).collect()
    }
}

fn usable<'a>(
    leases: &'a mut HashMap<Uuid, Lease>,
    lock_token: Uuid,
    sequence_number: i64,
    now: DateTime<Utc>,
) -> Result<&'a mut Lease> {
    let expired = match leases.get(&lock_token) {
        None => return Err(BusError::lock_lost(sequence_number, LockLostReason::NotHeld)),
        Some(lease) if lease.state == LeaseState::Settling => {
            return Err(BusError::lock_lost(sequence_number, LockLostReason::NotHeld));
        }
        Some(lease) => lease.is_expired(now),
    };

    if expired {
        leases.remove(&lock_token);
        return Err(BusError::lock_lost(sequence_number, LockLostReason::Expired));
    }

    leases
        .get_mut(&lock_token)
        .ok_or_else(|| BusError::lock_lost(sequence_number, LockLostReason::NotHeld))
}

/// What a renewal needs: the receiver's link to the broker and its leases.
/// Shared between a receiver and its auto-renew tasks.
pub(crate) struct LeaseContext {
    pub transport: Arc<dyn BrokerTransport>,
    pub handle: Handle,
    pub registry: LeaseRegistry,
    /// Extension granted by one renewal; counted against the ceiling.
    pub lock_duration: Duration,
}

impl LeaseContext {
    pub async fn renew(&self, lock_token: Uuid, sequence_number: i64) -> Result<DateTime<Utc>> {
        self.registry.reserve_renewal(
            lock_token,
            sequence_number,
            Utc::now(),
            self.lock_duration,
        )?;

        match self.transport.renew_lock(&self.handle, lock_token).await {
            Ok(locked_until) => {
                self.registry
                    .record_renewal(lock_token, sequence_number, locked_until)?;
                Ok(locked_until)
            }
            Err(BusError::LockLost { reason, .. }) => {
                self.registry.remove(&lock_token);
                Err(BusError::lock_lost(sequence_number, reason))
            }
            Err(e) => {
                self.registry.release_renewal(&lock_token, self.lock_duration);
                Err(e)
            }
        }
    }
}
