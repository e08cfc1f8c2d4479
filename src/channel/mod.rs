//! The `channel` module models one live client connection.
//!
//! It provides the `Channel` struct, which holds the connection's identity,
//! its locally subscribed topics, QoS flow state and the sink through which
//! outbound packets reach the transport.

pub mod mqtt_channel;
pub use mqtt_channel::{
    CLIENT_ID_PROPERTY, Channel, ConnectionStatus, InboundFlow, OutboundFlow,
};
