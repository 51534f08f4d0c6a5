//! The `transport` module is the WebSocket front-end over the bus client.
//!
//! It defines the JSON protocol spoken with connected clients (`message`),
//! maps each request onto the client API (`handler`), and runs the server
//! loop that accepts connections (`websocket`).

pub mod handler;
pub mod message;
pub mod websocket;

pub use handler::{AppState, Session, handle_client_message};
pub use message::{ClientMessage, ReceiverName, ReleaseAction, ServerMessage};
pub use websocket::start_websocket_server;

#[cfg(test)]
mod tests;
