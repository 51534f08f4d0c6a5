use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::{info, warn};

use crate::broker::{BrokerTransport, QueueAddress, ReceiveMode};
use crate::client::batch::DEFAULT_MAX_BATCH_SIZE_BYTES;
use crate::client::receiver::{
    PeekLockReceiver, ReceiveAndDeleteReceiver, Receiver, ReceiverOptions,
};
use crate::client::sender::Sender;
use crate::config::BusSettings;
use crate::utils::{BusError, Result};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Lock duration the broker grants; one renewal extends by this much.
    pub lock_duration: Duration,
    pub max_batch_size_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(60),
            max_batch_size_bytes: DEFAULT_MAX_BATCH_SIZE_BYTES,
        }
    }
}

impl From<&BusSettings> for ClientOptions {
    fn from(settings: &BusSettings) -> Self {
        Self {
            lock_duration: settings.lock_duration(),
            max_batch_size_bytes: settings.max_batch_size_bytes,
        }
    }
}

/// Entry point: creates receivers and senders over one transport and closes
/// all of them on shutdown.
///
/// Every receiver and sender gets its own broker handle. The client keeps
/// only weak references, so dropping a sender does not keep it alive here.
pub struct BusClient {
    transport: Arc<dyn BrokerTransport>,
    options: ClientOptions,
    receivers: Mutex<Vec<Weak<dyn Receiver>>>,
    senders: Mutex<Vec<Weak<Sender>>>,
    closed: AtomicBool,
}

impl BusClient {
    pub fn new(transport: Arc<dyn BrokerTransport>, options: ClientOptions) -> Self {
        Self {
            transport,
            options,
            receivers: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BusError::Closed("client"))
        } else {
            Ok(())
        }
    }

    fn receivers(&self) -> MutexGuard<'_, Vec<Weak<dyn Receiver>>> {
        self.receivers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn senders(&self) -> MutexGuard<'_, Vec<Weak<Sender>>> {
        self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn create_receiver(
        &self,
        queue: &str,
        options: ReceiverOptions,
    ) -> Result<Arc<dyn Receiver>> {
        self.ensure_open()?;
        let address = QueueAddress {
            name: queue.to_string(),
            sub_queue: options.sub_queue,
        };

        let receiver: Arc<dyn Receiver> = match options.mode {
            ReceiveMode::PeekLock => Arc::new(
                PeekLockReceiver::open(
                    self.transport.clone(),
                    address,
                    self.options.lock_duration,
                    &options,
                )
                .await?,
            ),
            ReceiveMode::ReceiveAndDelete => {
                if options.max_auto_lock_renewal.is_some() || options.dedup.is_some() {
                    return Err(BusError::unsupported(
                        "lock renewal and duplicate suppression need peek-lock mode",
                    ));
                }
                Arc::new(ReceiveAndDeleteReceiver::open(self.transport.clone(), address).await?)
            }
        };

        let mut receivers = self.receivers();
        receivers.retain(|weak| weak.strong_count() > 0);
        receivers.push(Arc::downgrade(&receiver));
        Ok(receiver)
    }

    pub async fn create_sender(&self, queue: &str) -> Result<Arc<Sender>> {
        self.ensure_open()?;
        let sender = Arc::new(
            Sender::open(
                self.transport.clone(),
                queue,
                self.options.max_batch_size_bytes,
            )
            .await?,
        );

        let mut senders = self.senders();
        senders.retain(|weak| weak.strong_count() > 0);
        senders.push(Arc::downgrade(&sender));
        Ok(sender)
    }

    /// Closes every receiver and sender still alive. Errors are logged and
    /// do not stop the remaining closes.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let receivers: Vec<Arc<dyn Receiver>> =
            self.receivers().drain(..).filter_map(|weak| weak.upgrade()).collect();
        let senders: Vec<Arc<Sender>> =
            self.senders().drain(..).filter_map(|weak| weak.upgrade()).collect();

        for receiver in &receivers {
            if let Err(e) = receiver.close().await {
                warn!("Failed to close receiver on {}: {}", receiver.address(), e);
            }
        }
        for sender in &senders {
            if let Err(e) = sender.close().await {
                warn!("Failed to close sender on {}: {}", sender.queue(), e);
            }
        }

        info!(
            "Closed {} receiver(s) and {} sender(s)",
            receivers.len(),
            senders.len()
        );
        Ok(())
    }
}
