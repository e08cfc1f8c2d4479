//! The `transport` module carries MQTT control packets between clients and
//! the engine, here as JSON frames over WebSockets.
//!
//! It owns everything the engine deliberately does not: sockets, framing,
//! the per-connection worker loop and connect/keep-alive timeouts.

pub mod message;
pub mod websocket;

pub use websocket::{serve, start_websocket_server};
