//! Automatic lock renewal
//!
//! One background task per lease renews the lock shortly before it lapses,
//! until the renewal ceiling is reached, the message is settled or the
//! receiver closes. Each task is paired with a cancel signal and its
//! `JoinHandle`; [`LockRenewer::stop`] signals and then joins, so once it
//! returns no renewal for that lease can still be in flight.
//!
//! Renewal here is best-effort: failures end the task and are logged, they
//! never reach the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::lease::LeaseContext;
use crate::utils::BusError;

/// Renewals are attempted at most this long before expiry.
const MAX_RENEW_MARGIN: Duration = Duration::from_secs(10);

struct RenewTask {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RenewTask {
    async fn shutdown(self) {
        // The task may already have finished on its own.
        let _ = self.cancel.send(());
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!("Lock renewal task panicked: {}", e);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct LockRenewer {
    tasks: Mutex<HashMap<Uuid, RenewTask>>,
}

impl LockRenewer {
    fn tasks(&self) -> MutexGuard<'_, HashMap<Uuid, RenewTask>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn start(&self, ctx: Arc<LeaseContext>, lock_token: Uuid, sequence_number: i64) {
        let (cancel, cancelled) = oneshot::channel();
        let handle = tokio::spawn(auto_renew(ctx, lock_token, sequence_number, cancelled));
        if let Some(previous) = self.tasks().insert(lock_token, RenewTask { cancel, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancels and joins the task for `lock_token`, if any.
    pub async fn stop(&self, lock_token: &Uuid) {
        let task = self.tasks().remove(lock_token);
        if let Some(task) = task {
            task.shutdown().await;
        }
    }

    pub async fn stop_all(&self) {
        let tasks: Vec<RenewTask> = self.tasks().drain().map(|(_, task)| task).collect();
        for task in tasks {
            task.shutdown().await;
        }
    }

    pub fn active(&self) -> usize {
        self.tasks()
            .values()
            .filter(|task| !task.handle.is_finished())
            .count()
    }
}

async fn auto_renew(
    ctx: Arc<LeaseContext>,
    lock_token: Uuid,
    sequence_number: i64,
    mut cancelled: oneshot::Receiver<()>,
) {
    loop {
        let Some(lease) = ctx.registry.get(&lock_token) else {
            break;
        };
        let wait = renew_delay(lease.locked_until, Utc::now(), ctx.lock_duration);

        tokio::select! {
            biased;
            _ = &mut cancelled => break,
            _ = tokio::time::sleep(wait) => {}
        }

        match ctx.renew(lock_token, sequence_number).await {
            Ok(locked_until) => {
                debug!("Renewed lock on message {} until {}", sequence_number, locked_until);
            }
            Err(BusError::RenewalCeilingExceeded { ceiling, .. }) => {
                debug!(
                    "Message {} reached its auto-renewal ceiling of {}s",
                    sequence_number,
                    ceiling.as_secs()
                );
                break;
            }
            Err(e @ BusError::LockLost { .. }) => {
                debug!("Stopped renewing: {}", e);
                break;
            }
            Err(e) => {
                warn!("Auto lock renewal for message {} failed: {}", sequence_number, e);
                break;
            }
        }
    }
}

/// How long to sleep before renewing a lock that expires at `locked_until`.
pub(crate) fn renew_delay(
    locked_until: DateTime<Utc>,
    now: DateTime<Utc>,
    lock_duration: Duration,
) -> Duration {
    let margin = (lock_duration / 2).min(MAX_RENEW_MARGIN);
    (locked_until - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .saturating_sub(margin)
}
