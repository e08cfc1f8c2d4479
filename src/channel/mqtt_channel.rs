//! Per-connection state
//!
//! A `Channel` is created when the transport accepts a connection and is
//! shared as `Arc<Channel>` between the connection's worker, the engine and
//! (weakly) the subscription store. All mutable state sits behind a single
//! mutex so a publisher on another connection can register an in-flight
//! delivery while this connection's worker is processing its own packets.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::broker::message::{OutboundPacket, QoS};
use crate::utils::{BrokerError, Result};

/// Property key under which the client identifier is kept.
pub const CLIENT_ID_PROPERTY: &str = "Client-ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// QoS 2 step outstanding for a PUBLISH received from this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFlow {
    AwaitingPubRel,
}

/// Step outstanding for a QoS 1/2 PUBLISH delivered to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundFlow {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
}

#[derive(Debug)]
struct ChannelState {
    username: Option<String>,
    clean_session: bool,
    status: ConnectionStatus,
    keep_alive: u16,
    connected_at: Option<DateTime<Utc>>,
    topics: BTreeMap<String, QoS>,
    properties: HashMap<String, String>,
    next_packet_id: u16,
    inbound: HashMap<u16, InboundFlow>,
    outbound: HashMap<u16, OutboundFlow>,
}

#[derive(Debug)]
pub struct Channel {
    id: Uuid,
    sender: UnboundedSender<OutboundPacket>,
    state: Mutex<ChannelState>,
}

impl Channel {
    /// A fresh channel in `Connecting` state with no identity.
    pub fn new(sender: UnboundedSender<OutboundPacket>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            sender,
            state: Mutex::new(ChannelState {
                username: None,
                clean_session: true,
                status: ConnectionStatus::Connecting,
                keep_alive: 0,
                connected_at: None,
                topics: BTreeMap::new(),
                properties: HashMap::new(),
                next_packet_id: 1,
                inbound: HashMap::new(),
                outbound: HashMap::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport-level identity, unique per accepted connection.
    pub fn connection_id(&self) -> Uuid {
        self.id
    }

    /// The MQTT client identifier; empty until assigned.
    pub fn client_id(&self) -> String {
        self.property(CLIENT_ID_PROPERTY).unwrap_or_default()
    }

    pub fn set_client_id(&self, client_id: &str) -> Result<()> {
        self.set_property(CLIENT_ID_PROPERTY, client_id)
    }

    pub fn username(&self) -> Option<String> {
        self.state().username.clone()
    }

    pub fn clean_session(&self) -> bool {
        self.state().clean_session
    }

    pub fn set_clean_session(&self, clean_session: bool) {
        self.state().clean_session = clean_session;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn keep_alive(&self) -> u16 {
        self.state().keep_alive
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.state().connected_at
    }

    /// Applies the identity of an accepted CONNECT and promotes the channel.
    pub fn mark_connected(
        &self,
        client_id: &str,
        username: Option<String>,
        clean_session: bool,
        keep_alive: u16,
    ) -> Result<()> {
        let mut state = self.state();
        if state.status != ConnectionStatus::Connecting {
            return Err(BrokerError::ClientIdImmutable);
        }
        state
            .properties
            .insert(CLIENT_ID_PROPERTY.to_string(), client_id.to_string());
        state.username = username;
        state.clean_session = clean_session;
        state.keep_alive = keep_alive;
        state.status = ConnectionStatus::Connected;
        state.connected_at = Some(Utc::now());
        Ok(())
    }

    /// Drops in-flight flow state; identity and topics stay readable.
    pub fn mark_disconnected(&self) {
        let mut state = self.state();
        state.status = ConnectionStatus::Disconnected;
        state.inbound.clear();
        state.outbound.clear();
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.state().properties.get(key).cloned()
    }

    /// Sets a named property. The client identifier is frozen once the channel
    /// leaves `Connecting`.
    pub fn set_property(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state();
        if key == CLIENT_ID_PROPERTY && state.status != ConnectionStatus::Connecting {
            return Err(BrokerError::ClientIdImmutable);
        }
        state.properties.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Records a subscribed filter, replacing the QoS of an existing one.
    pub fn add_topic(&self, filter: &str, qos: QoS) {
        self.state().topics.insert(filter.to_string(), qos);
    }

    pub fn remove_topic(&self, filter: &str) -> Option<QoS> {
        self.state().topics.remove(filter)
    }

    pub fn topic_qos(&self, filter: &str) -> Option<QoS> {
        self.state().topics.get(filter).copied()
    }

    pub fn topics(&self) -> Vec<(String, QoS)> {
        self.state()
            .topics
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect()
    }

    pub fn clear_topics(&self) {
        self.state().topics.clear();
    }

    /// Hands a packet to the transport for this connection.
    pub fn send(&self, packet: OutboundPacket) -> Result<()> {
        self.sender
            .send(packet)
            .map_err(|_| BrokerError::ChannelClosed)
    }

    /// Records a received QoS 2 PUBLISH. Returns false if the packet id is
    /// already waiting for its PUBREL (a retransmission).
    pub fn begin_inbound_qos2(&self, packet_id: u16) -> bool {
        self.state()
            .inbound
            .insert(packet_id, InboundFlow::AwaitingPubRel)
            .is_none()
    }

    /// Completes a received QoS 2 flow on PUBREL.
    pub fn complete_inbound_qos2(&self, packet_id: u16) -> Result<()> {
        self.state()
            .inbound
            .remove(&packet_id)
            .map(|_| ())
            .ok_or(BrokerError::UnexpectedPacketId {
                packet: "PUBREL",
                packet_id,
            })
    }

    pub fn inbound_flow(&self, packet_id: u16) -> Option<InboundFlow> {
        self.state().inbound.get(&packet_id).copied()
    }

    /// Allocates a packet id for a QoS 1/2 delivery and records the step it
    /// now waits for. `None` when every identifier is in flight.
    pub fn start_outbound(&self, qos: QoS) -> Option<u16> {
        let flow = match qos {
            QoS::AtMostOnce => return None,
            QoS::AtLeastOnce => OutboundFlow::AwaitingPubAck,
            QoS::ExactlyOnce => OutboundFlow::AwaitingPubRec,
        };

        let mut state = self.state();
        for _ in 0..u16::MAX {
            let candidate = state.next_packet_id;
            state.next_packet_id = match candidate.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if !state.outbound.contains_key(&candidate) {
                state.outbound.insert(candidate, flow);
                return Some(candidate);
            }
        }
        None
    }

    /// Moves an outbound flow from `expected` to `next` (or finishes it).
    pub fn advance_outbound(
        &self,
        packet_id: u16,
        expected: OutboundFlow,
        next: Option<OutboundFlow>,
        packet: &'static str,
    ) -> Result<()> {
        let mut state = self.state();
        match state.outbound.get(&packet_id) {
            Some(flow) if *flow == expected => {
                match next {
                    Some(next) => state.outbound.insert(packet_id, next),
                    None => state.outbound.remove(&packet_id),
                };
                Ok(())
            }
            _ => Err(BrokerError::UnexpectedPacketId { packet, packet_id }),
        }
    }

    pub fn outbound_flow(&self, packet_id: u16) -> Option<OutboundFlow> {
        self.state().outbound.get(&packet_id).copied()
    }

    pub fn in_flight(&self) -> usize {
        let state = self.state();
        state.inbound.len() + state.outbound.len()
    }
}
