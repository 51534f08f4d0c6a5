//! The `broker` module holds everything on the broker side of the
//! [`BrokerTransport`] seam: the message model, queue addressing, the
//! transport trait itself and the embedded in-memory broker.

pub mod address;
pub mod engine;
pub mod message;
pub mod queue;
pub mod transport;

pub use address::{QueueAddress, SubQueue};
pub use engine::{BrokerOptions, InMemoryBroker};
pub use message::{MessageState, OutboundMessage, ReceivedMessage};
pub use transport::{BrokerTransport, Handle, HandleKind, ReceiveMode, SettleAction};

#[cfg(test)]
mod tests;
