//! Message model
//!
//! Typed MQTT 3.1.1 control packets as they cross the engine boundary.
//! Packets arrive already decoded (`InboundPacket`) and leave as typed values
//! (`OutboundPacket`); byte-level framing belongs to the transport.
//!
//! Both unions are serde-tagged on `"type"` so the JSON transport can use
//! them directly as its frame format.

use serde::{Deserialize, Serialize};

use crate::utils::BrokerError;

/// Delivery guarantee of a PUBLISH or a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = BrokerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(BrokerError::InvalidQos(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos as u8
    }
}

/// CONNECT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectMessage {
    pub protocol_name: String,
    pub protocol_level: u8,
    #[serde(default)]
    pub client_id: String,
    pub clean_session: bool,
    #[serde(default)]
    pub keep_alive: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Vec<u8>>,
}

impl ConnectMessage {
    /// A 3.1.1 CONNECT without credentials.
    pub fn new(client_id: impl Into<String>, clean_session: bool) -> Self {
        Self {
            protocol_name: "MQTT".to_string(),
            protocol_level: 4,
            client_id: client_id.into(),
            clean_session,
            keep_alive: 60,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &[u8]) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_vec());
        self
    }
}

/// CONNACK return codes (MQTT 3.1.1 table 3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectReturnCode {
    Accepted = 0x00,
    UnacceptableProtocolVersion = 0x01,
    IdentifierRejected = 0x02,
    ServerUnavailable = 0x03,
    BadUsernameOrPassword = 0x04,
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// CONNACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnAckMessage {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl ConnAckMessage {
    /// A refusal never reports a present session.
    pub fn rejected(return_code: ConnectReturnCode) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }
}

/// One `(topic filter, requested QoS)` pair of a SUBSCRIBE.
///
/// The QoS stays a raw byte so that out-of-range requests can be answered
/// with a per-filter failure instead of failing the decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSubscription {
    pub topic_filter: String,
    pub qos: u8,
}

impl TopicSubscription {
    pub fn new(topic_filter: impl Into<String>, qos: u8) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            qos,
        }
    }
}

/// SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeMessage {
    pub packet_id: u16,
    pub topics: Vec<TopicSubscription>,
}

/// Per-filter outcome carried by a SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAckReturnCode {
    Granted(QoS),
    Failure,
}

impl SubAckReturnCode {
    pub const FAILURE: u8 = 0x80;

    pub fn as_byte(self) -> u8 {
        match self {
            SubAckReturnCode::Granted(qos) => qos.into(),
            SubAckReturnCode::Failure => Self::FAILURE,
        }
    }
}

/// SUBACK. `return_codes` is in the order of the SUBSCRIBE's topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubAckMessage {
    pub packet_id: u16,
    pub return_codes: Vec<SubAckReturnCode>,
}

/// UNSUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeMessage {
    pub packet_id: u16,
    pub topic_filters: Vec<String>,
}

/// UNSUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubAckMessage {
    pub packet_id: u16,
}

/// PUBLISH. `packet_id` is present iff `qos` is above `AtMostOnce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub topic_name: String,
    #[serde(default)]
    pub payload: Vec<u8>,
    pub qos: QoS,
    #[serde(default)]
    pub dup: bool,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub packet_id: Option<u16>,
}

impl PublishMessage {
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            topic_name: topic_name.into(),
            payload: payload.into(),
            qos,
            dup: false,
            retain: false,
            packet_id: None,
        }
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = Some(packet_id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubAckMessage {
    pub packet_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubRecMessage {
    pub packet_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubRelMessage {
    pub packet_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubCompMessage {
    pub packet_id: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectMessage;

/// Packets a client may send to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundPacket {
    Connect(ConnectMessage),
    Subscribe(SubscribeMessage),
    Unsubscribe(UnsubscribeMessage),
    Publish(PublishMessage),
    PubAck(PubAckMessage),
    PubRec(PubRecMessage),
    PubRel(PubRelMessage),
    PubComp(PubCompMessage),
    PingReq,
    Disconnect,
}

impl InboundPacket {
    /// Control packet name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundPacket::Connect(_) => "CONNECT",
            InboundPacket::Subscribe(_) => "SUBSCRIBE",
            InboundPacket::Unsubscribe(_) => "UNSUBSCRIBE",
            InboundPacket::Publish(_) => "PUBLISH",
            InboundPacket::PubAck(_) => "PUBACK",
            InboundPacket::PubRec(_) => "PUBREC",
            InboundPacket::PubRel(_) => "PUBREL",
            InboundPacket::PubComp(_) => "PUBCOMP",
            InboundPacket::PingReq => "PINGREQ",
            InboundPacket::Disconnect => "DISCONNECT",
        }
    }
}

/// Packets the broker sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundPacket {
    ConnAck(ConnAckMessage),
    SubAck(SubAckMessage),
    UnsubAck(UnsubAckMessage),
    Publish(PublishMessage),
    PubAck(PubAckMessage),
    PubRec(PubRecMessage),
    PubRel(PubRelMessage),
    PubComp(PubCompMessage),
    PingResp,
}
