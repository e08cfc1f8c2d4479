//! Error type shared by the engine, the subscription stores and the transport.
//!
//! Clients never see these values: the transport turns a fatal error into a
//! closed connection and logs it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid QoS level {0}")]
    InvalidQos(u8),

    #[error("invalid topic name '{0}'")]
    InvalidTopicName(String),

    #[error("invalid topic filter '{0}'")]
    InvalidTopicFilter(String),

    #[error("channel is not connected")]
    NotConnected,

    #[error("client identifier cannot change once connected")]
    ClientIdImmutable,

    /// An acknowledgment step arrived for a packet id that is not waiting for it.
    #[error("unexpected {packet} for packet id {packet_id}")]
    UnexpectedPacketId {
        packet: &'static str,
        packet_id: u16,
    },

    #[error("outbound channel closed")]
    ChannelClosed,

    #[error("subscription store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Sled(#[from] sled::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl BrokerError {
    /// Whether the transport must close the connection after this error.
    ///
    /// Out-of-sequence acknowledgments are dropped without touching flow
    /// state; everything else ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BrokerError::UnexpectedPacketId { .. })
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
