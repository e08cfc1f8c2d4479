//! # mqtt-core-broker
//!
//! Broker-side MQTT 3.1.1 protocol engine. Decoded control packets go in,
//! acknowledgments and subscriber deliveries come out; sockets, framing and
//! timeouts stay with the transport.
//!
//! ## Core Modules
//!
//! - `broker`: the protocol engine, topic matching, the packet model and
//!   CONNECT authentication.
//! - `channel`: per-connection state (identity, subscribed topics, in-flight
//!   QoS 1/2 flows).
//! - `config`: layered configuration (defaults, file, environment).
//! - `persistence`: the `SubscriptionStore` contract with in-memory and
//!   `sled`-backed implementations.
//! - `transport`: JSON-over-WebSocket adapter driving the engine.
//! - `utils`: the crate error type and logging setup.

pub mod broker;
pub mod channel;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
