use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Groups the front-end server, the bus client, the embedded broker,
/// persistence and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub bus: BusSettings,
    pub broker: BrokerSettings,
    pub persistence: PersistenceSettings,
    pub log: LogSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the WebSocket front-end will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Client-side lease and batching parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct BusSettings {
    pub queue: String,
    pub lock_duration_secs: u64,
    pub max_auto_lock_renewal_secs: u64,
    pub max_batch_size_bytes: usize,
    pub receive_wait_ms: u64,
    pub schedule_delay_secs: u64,
    /// Zero disables duplicate suppression.
    pub dedup_capacity: usize,
    pub dedup_window_secs: u64,
}

impl BusSettings {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn max_auto_lock_renewal(&self) -> Duration {
        Duration::from_secs(self.max_auto_lock_renewal_secs)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }
}

/// Parameters of the embedded broker.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub max_delivery_count: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceSettings {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from the defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub bus: Option<PartialBusSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBusSettings {
    pub queue: Option<String>,
    pub lock_duration_secs: Option<u64>,
    pub max_auto_lock_renewal_secs: Option<u64>,
    pub max_batch_size_bytes: Option<usize>,
    pub receive_wait_ms: Option<u64>,
    pub schedule_delay_secs: Option<u64>,
    pub dedup_capacity: Option<usize>,
    pub dedup_window_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_delivery_count: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialPersistenceSettings {
    pub path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Settings {
    /// Fills every value missing from `partial` with the default.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let server = partial.server.unwrap_or_default();
        let bus = partial.bus.unwrap_or_default();
        let broker = partial.broker.unwrap_or_default();
        let persistence = partial.persistence.unwrap_or_default();
        let log = partial.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            bus: BusSettings {
                queue: bus.queue.unwrap_or(default.bus.queue),
                lock_duration_secs: bus
                    .lock_duration_secs
                    .unwrap_or(default.bus.lock_duration_secs),
                max_auto_lock_renewal_secs: bus
                    .max_auto_lock_renewal_secs
                    .unwrap_or(default.bus.max_auto_lock_renewal_secs),
                max_batch_size_bytes: bus
                    .max_batch_size_bytes
                    .unwrap_or(default.bus.max_batch_size_bytes),
                receive_wait_ms: bus.receive_wait_ms.unwrap_or(default.bus.receive_wait_ms),
                schedule_delay_secs: bus
                    .schedule_delay_secs
                    .unwrap_or(default.bus.schedule_delay_secs),
                dedup_capacity: bus.dedup_capacity.unwrap_or(default.bus.dedup_capacity),
                dedup_window_secs: bus
                    .dedup_window_secs
                    .unwrap_or(default.bus.dedup_window_secs),
            },
            broker: BrokerSettings {
                max_delivery_count: broker
                    .max_delivery_count
                    .unwrap_or(default.broker.max_delivery_count),
            },
            persistence: PersistenceSettings {
                path: persistence.path.unwrap_or(default.persistence.path),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            bus: BusSettings {
                queue: "queue1".to_string(),
                lock_duration_secs: 60,
                max_auto_lock_renewal_secs: 5 * 60,
                max_batch_size_bytes: 256 * 1024,
                receive_wait_ms: 5000,
                schedule_delay_secs: 5 * 60,
                dedup_capacity: 1024,
                dedup_window_secs: 10 * 60,
            },
            broker: BrokerSettings {
                max_delivery_count: 10,
            },
            persistence: PersistenceSettings {
                path: "peeklock_db".to_string(),
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
