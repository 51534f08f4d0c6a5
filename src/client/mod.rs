//! The `client` module is the consumer and producer side of the bus.
//!
//! It provides the lease state machine for peek-lock consumption
//! (`lease`, `renewer`, `receiver`), the size-bounded batch packer and the
//! scheduler (`batch`, `sender`), and `BusClient`, which owns every
//! receiver and sender so shutdown can close them all.

pub mod batch;
pub mod bus_client;
pub mod dedup;
pub mod lease;
pub mod receiver;
mod renewer;
pub mod sender;

pub use batch::{DEFAULT_MAX_BATCH_SIZE_BYTES, MessageBatch};
pub use bus_client::{BusClient, ClientOptions};
pub use dedup::DedupPolicy;
pub use lease::{Lease, LeaseRegistry, LeaseState};
pub use receiver::{PeekLockReceiver, ReceiveAndDeleteReceiver, Receiver, ReceiverOptions};
pub use sender::Sender;
