//! JSON frame codec
//!
//! Each WebSocket text frame carries one control packet as a JSON object
//! tagged by `"type"`, e.g. `{"type":"pub_ack","packet_id":7}`. Binary
//! frames are accepted with the same JSON body.

use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{InboundPacket, OutboundPacket};
use crate::utils::Result;

pub fn decode_frame(text: &str) -> Result<InboundPacket> {
    Ok(serde_json::from_str(text)?)
}

/// Decodes a data frame. Control frames (ping, pong, close) yield `None`.
pub fn decode_message(message: &WsMessage) -> Result<Option<InboundPacket>> {
    match message {
        WsMessage::Text(text) => decode_frame(text.as_str()).map(Some),
        WsMessage::Binary(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
        _ => Ok(None),
    }
}

pub fn encode_frame(packet: &OutboundPacket) -> Result<WsMessage> {
    Ok(WsMessage::text(serde_json::to_string(packet)?))
}
