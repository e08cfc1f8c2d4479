//! The broker: protocol engine, message model, topic matching and the
//! credential check used during CONNECT.

pub mod auth;
pub mod engine;
pub mod message;
pub mod topic;

pub use engine::{BrokerConfig, BrokerEngine, Delivery, PublishOutcome, Response};
