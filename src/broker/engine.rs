//! Broker engine
//!
//! `BrokerEngine` applies MQTT 3.1.1 rules to one decoded inbound packet at
//! a time:
//! - CONNECT validation and session establishment/resumption
//! - SUBSCRIBE / UNSUBSCRIBE bookkeeping in the store and on the channel
//! - PUBLISH acknowledgment (QoS 1/2) and fan-out to matching subscribers
//! - the PUBACK / PUBREC / PUBREL / PUBCOMP steps of in-flight flows
//! - DISCONNECT and clean-session teardown
//!
//! Concurrency and usage notes:
//! - The engine holds only read-only policy, so one instance is shared by
//!   every connection worker. All mutable state lives in the `Channel`s and
//!   the `SubscriptionStore`, both passed in explicitly.
//! - Handlers never block or send anything themselves. They return the
//!   packets to emit and the transport delivers them.
//! - Callers must feed a connection's packets in receipt order.

use std::cmp;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::auth::{AllowAll, AuthDecision, Authenticator, StaticCredentials};
use crate::broker::message::{
    ConnAckMessage, ConnectMessage, ConnectReturnCode, DisconnectMessage, InboundPacket,
    OutboundPacket, PubAckMessage, PubCompMessage, PubRecMessage, PubRelMessage, PublishMessage,
    QoS, SubAckMessage, SubAckReturnCode, SubscribeMessage, TopicSubscription, UnsubAckMessage,
    UnsubscribeMessage,
};
use crate::broker::topic;
use crate::channel::{Channel, ConnectionStatus, OutboundFlow};
use crate::config::{BrokerSettings, Settings};
use crate::persistence::{Subscription, SubscriptionStore};
use crate::utils::{BrokerError, Result};

/// Read-only protocol policy.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Ceiling applied to every granted subscription QoS.
    pub max_qos: QoS,
    /// Generate an identifier for clean-session clients that send none.
    pub assign_client_ids: bool,
    pub client_id_prefix: String,
    pub max_client_id_length: usize,
    /// Accept CONNECTs that carry no username.
    pub allow_anonymous: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_qos: QoS::ExactlyOnce,
            assign_client_ids: true,
            client_id_prefix: "auto-".to_string(),
            max_client_id_length: 65_535,
            allow_anonymous: true,
        }
    }
}

impl TryFrom<&BrokerSettings> for BrokerConfig {
    type Error = BrokerError;

    fn try_from(settings: &BrokerSettings) -> Result<Self> {
        Ok(Self {
            max_qos: QoS::try_from(settings.max_qos)?,
            assign_client_ids: settings.assign_client_ids,
            client_id_prefix: settings.client_id_prefix.clone(),
            max_client_id_length: settings.max_client_id_length,
            allow_anonymous: settings.allow_anonymous,
        })
    }
}

/// A PUBLISH addressed to one subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub channel: Arc<Channel>,
    pub publish: PublishMessage,
}

impl Delivery {
    pub fn dispatch(&self) -> Result<()> {
        self.channel
            .send(OutboundPacket::Publish(self.publish.clone()))
    }
}

/// Result of a PUBLISH: the acknowledgment owed to the publisher (if any)
/// and the copies owed to subscribers.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    pub ack: Option<OutboundPacket>,
    pub deliveries: Vec<Delivery>,
}

/// Everything one inbound packet produces.
#[derive(Debug, Default)]
pub struct Response {
    /// Packet for the originating channel.
    pub reply: Option<OutboundPacket>,
    pub deliveries: Vec<Delivery>,
    /// The transport must close the connection after sending `reply`.
    pub close: bool,
}

impl Response {
    fn reply(packet: OutboundPacket) -> Self {
        Self {
            reply: Some(packet),
            ..Self::default()
        }
    }

    /// Sends the reply to `origin` and every delivery to its subscriber.
    ///
    /// A subscriber whose connection is already gone is skipped; failing to
    /// reach the origin is an error.
    pub fn dispatch(&self, origin: &Channel) -> Result<()> {
        for delivery in &self.deliveries {
            if let Err(e) = delivery.dispatch() {
                warn!(
                    "Dropping delivery on '{}' to {}: {}",
                    delivery.publish.topic_name,
                    delivery.channel.client_id(),
                    e
                );
            }
        }
        match &self.reply {
            Some(packet) => origin.send(packet.clone()),
            None => Ok(()),
        }
    }
}

pub struct BrokerEngine {
    config: BrokerConfig,
    authenticator: Arc<dyn Authenticator>,
}

impl std::fmt::Debug for BrokerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for BrokerEngine {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl BrokerEngine {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_authenticator(config, Arc::new(AllowAll))
    }

    pub fn with_authenticator(config: BrokerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            config,
            authenticator,
        }
    }

    /// Builds the engine from loaded settings; a non-empty user table turns
    /// on credential checks.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let config = BrokerConfig::try_from(&settings.broker)?;
        let authenticator: Arc<dyn Authenticator> = if settings.auth.users.is_empty() {
            Arc::new(AllowAll)
        } else {
            Arc::new(StaticCredentials::new(settings.auth.users.clone()))
        };
        Ok(Self::with_authenticator(config, authenticator))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Routes a decoded packet to its handler.
    ///
    /// Anything but CONNECT on a channel that has not completed CONNECT is a
    /// protocol violation.
    pub fn handle(
        &self,
        packet: InboundPacket,
        channel: &Arc<Channel>,
        store: &dyn SubscriptionStore,
    ) -> Result<Response> {
        if !matches!(packet, InboundPacket::Connect(_)) && !channel.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        match packet {
            InboundPacket::Connect(connect) => {
                let ack = self.connect(connect, channel, store)?;
                Ok(Response {
                    reply: Some(OutboundPacket::ConnAck(ack)),
                    deliveries: Vec::new(),
                    close: ack.return_code != ConnectReturnCode::Accepted,
                })
            }
            InboundPacket::Subscribe(subscribe) => Ok(Response::reply(OutboundPacket::SubAck(
                self.subscribe(subscribe, channel, store)?,
            ))),
            InboundPacket::Unsubscribe(unsubscribe) => Ok(Response::reply(
                OutboundPacket::UnsubAck(self.unsubscribe(unsubscribe, channel, store)?),
            )),
            InboundPacket::Publish(publish) => {
                let outcome = self.publish(publish, channel, store)?;
                Ok(Response {
                    reply: outcome.ack,
                    deliveries: outcome.deliveries,
                    close: false,
                })
            }
            InboundPacket::PubAck(ack) => {
                self.puback(ack, channel)?;
                Ok(Response::default())
            }
            InboundPacket::PubRec(rec) => Ok(Response::reply(OutboundPacket::PubRel(
                self.pubrec(rec, channel)?,
            ))),
            InboundPacket::PubRel(rel) => Ok(Response::reply(OutboundPacket::PubComp(
                self.pubrel(rel, channel)?,
            ))),
            InboundPacket::PubComp(comp) => {
                self.pubcomp(comp, channel)?;
                Ok(Response::default())
            }
            InboundPacket::PingReq => Ok(Response::reply(OutboundPacket::PingResp)),
            InboundPacket::Disconnect => {
                self.disconnect(DisconnectMessage, channel, store)?;
                Ok(Response {
                    close: true,
                    ..Response::default()
                })
            }
        }
    }

    /// CONNECT -> CONNACK.
    ///
    /// A refused CONNECT leaves the channel in `Connecting`. An unknown
    /// protocol name or a repeated CONNECT is an error, since MQTT closes
    /// those connections without a CONNACK.
    pub fn connect(
        &self,
        connect: ConnectMessage,
        channel: &Arc<Channel>,
        store: &dyn SubscriptionStore,
    ) -> Result<ConnAckMessage> {
        if channel.status() != ConnectionStatus::Connecting {
            return Err(BrokerError::ProtocolViolation(
                "CONNECT received on an already connected channel".to_string(),
            ));
        }

        match (connect.protocol_name.as_str(), connect.protocol_level) {
            ("MQTT", 4) | ("MQIsdp", 3) => {}
            ("MQTT", level) | ("MQIsdp", level) => {
                warn!("Refusing CONNECT with protocol level {level}");
                return Ok(ConnAckMessage::rejected(
                    ConnectReturnCode::UnacceptableProtocolVersion,
                ));
            }
            (name, _) => {
                return Err(BrokerError::ProtocolViolation(format!(
                    "unknown protocol name '{name}'"
                )));
            }
        }

        if connect.password.is_some() && connect.username.is_none() {
            return Ok(ConnAckMessage::rejected(
                ConnectReturnCode::BadUsernameOrPassword,
            ));
        }

        let client_id = match self.resolve_client_id(&connect) {
            Ok(client_id) => client_id,
            Err(code) => {
                warn!("Rejecting client id '{}': {:?}", connect.client_id, code);
                return Ok(ConnAckMessage::rejected(code));
            }
        };

        if connect.username.is_none() && !self.config.allow_anonymous {
            return Ok(ConnAckMessage::rejected(ConnectReturnCode::NotAuthorized));
        }
        let decision = self.authenticator.authenticate(
            &client_id,
            connect.username.as_deref(),
            connect.password.as_deref(),
        );
        if decision != AuthDecision::Allow {
            warn!("Authentication failed for {client_id}: {decision:?}");
            return Ok(ConnAckMessage::rejected(decision.return_code()));
        }

        let established = self.establish_session(&client_id, connect.clean_session, channel, store);
        let session_present = match established {
            Ok(present) => present,
            Err(e) => {
                error!("Session lookup for {client_id} failed: {e}");
                let _ = store.release_session(&client_id, channel.connection_id());
                return Ok(ConnAckMessage::rejected(ConnectReturnCode::ServerUnavailable));
            }
        };

        channel.mark_connected(
            &client_id,
            connect.username,
            connect.clean_session,
            connect.keep_alive,
        )?;
        info!(
            "{client_id} connected (clean_session={}, session_present={session_present})",
            connect.clean_session
        );

        Ok(ConnAckMessage {
            session_present,
            return_code: ConnectReturnCode::Accepted,
        })
    }

    fn resolve_client_id(
        &self,
        connect: &ConnectMessage,
    ) -> std::result::Result<String, ConnectReturnCode> {
        if connect.client_id.is_empty() {
            if connect.clean_session && self.config.assign_client_ids {
                return Ok(format!("{}{}", self.config.client_id_prefix, Uuid::new_v4()));
            }
            return Err(ConnectReturnCode::IdentifierRejected);
        }
        if connect.client_id.len() > self.config.max_client_id_length
            || connect.client_id.contains('\0')
        {
            return Err(ConnectReturnCode::IdentifierRejected);
        }
        Ok(connect.client_id.clone())
    }

    /// Makes `channel` the owner of the client id's session, taking over any
    /// live connection that held it. Clean connects discard the previous
    /// session; persistent ones relink its subscriptions to this channel.
    /// Subscriptions made under a clean session are never carried over.
    /// Returns whether a session was carried over.
    fn establish_session(
        &self,
        client_id: &str,
        clean_session: bool,
        channel: &Arc<Channel>,
        store: &dyn SubscriptionStore,
    ) -> Result<bool> {
        if let Some(previous) = store.claim_session(client_id, channel)? {
            info!(
                "{client_id} taken over by connection {}, closing {}",
                channel.connection_id(),
                previous.connection_id()
            );
            previous.mark_disconnected();
        }

        if clean_session {
            store.remove_all_for_client(client_id)?;
            return Ok(false);
        }

        let stored = store.subscriptions_for_client(client_id)?;
        if stored.iter().any(|subscription| subscription.clean_session) {
            debug!("Discarding clean session subscriptions of {client_id}");
            store.remove_all_for_client(client_id)?;
            return Ok(false);
        }

        let subscriptions = store.reattach_channel(client_id, channel)?;
        for subscription in &subscriptions {
            channel.add_topic(&subscription.topic_filter, subscription.qos);
        }
        if !subscriptions.is_empty() {
            debug!(
                "Reattached {} subscriptions for {client_id}",
                subscriptions.len()
            );
        }
        Ok(!subscriptions.is_empty())
    }

    /// DISCONNECT (also used for transport closure and keep-alive expiry).
    ///
    /// Clean sessions lose every subscription; persistent ones stay in the
    /// store for the next CONNECT with the same client id. A channel whose
    /// session was taken over leaves the store alone.
    pub fn disconnect(
        &self,
        _disconnect: DisconnectMessage,
        channel: &Arc<Channel>,
        store: &dyn SubscriptionStore,
    ) -> Result<()> {
        channel.mark_disconnected();

        let client_id = channel.client_id();
        if client_id.is_empty() {
            return Ok(());
        }

        let owns_session = store
            .session_owner(&client_id)?
            .is_none_or(|owner| owner.connection_id() == channel.connection_id());
        if !owns_session {
            info!(
                "{client_id} disconnected from superseded connection {}",
                channel.connection_id()
            );
            return Ok(());
        }

        if channel.clean_session() {
            store.remove_all_for_client(&client_id)?;
            channel.clear_topics();
            info!("{client_id} disconnected, session discarded");
        } else {
            info!("{client_id} disconnected, session kept");
        }
        store.release_session(&client_id, channel.connection_id())
    }

    /// SUBSCRIBE -> SUBACK with one return code per requested filter.
    pub fn subscribe(
        &self,
        subscribe: SubscribeMessage,
        channel: &Arc<Channel>,
        store: &dyn SubscriptionStore,
    ) -> Result<SubAckMessage> {
        ensure_packet_id(subscribe.packet_id, "SUBSCRIBE")?;
        if subscribe.topics.is_empty() {
            warn!("SUBSCRIBE {} carries no topic filters", subscribe.packet_id);
        }

        let return_codes = subscribe
            .topics
            .iter()
            .map(|request| self.subscribe_one(request, channel, store))
            .collect();

        Ok(SubAckMessage {
            packet_id: subscribe.packet_id,
            return_codes,
        })
    }

    fn subscribe_one(
        &self,
        request: &TopicSubscription,
        channel: &Arc<Channel>,
        store: &dyn SubscriptionStore,
    ) -> SubAckReturnCode {
        let client_id = channel.client_id();

        let requested = match QoS::try_from(request.qos) {
            Ok(qos) => qos,
            Err(e) => {
                warn!("{client_id} subscribe to '{}': {e}", request.topic_filter);
                return SubAckReturnCode::Failure;
            }
        };
        if let Err(e) = topic::validate_topic_filter(&request.topic_filter) {
            warn!("{client_id} subscribe rejected: {e}");
            return SubAckReturnCode::Failure;
        }

        let granted = cmp::min(requested, self.config.max_qos);
        let subscription = Subscription::new(
            &request.topic_filter,
            &client_id,
            channel.username(),
            channel.clean_session(),
            granted,
            channel,
        );
        if let Err(e) = store.store_subscription(subscription) {
            error!(
                "Failed to store subscription {client_id} -> {}: {e}",
                request.topic_filter
            );
            return SubAckReturnCode::Failure;
        }
        channel.add_topic(&request.topic_filter, granted);

        debug!(
            "{client_id} subscribed to {} at {:?}{}",
            request.topic_filter,
            granted,
            if topic::is_wildcard(&request.topic_filter) {
                " (wildcard)"
            } else {
                ""
            }
        );
        SubAckReturnCode::Granted(granted)
    }

    /// UNSUBSCRIBE -> UNSUBACK. Filters that were never subscribed are
    /// removed vacuously.
    pub fn unsubscribe(
        &self,
        unsubscribe: UnsubscribeMessage,
        channel: &Arc<Channel>,
        store: &dyn SubscriptionStore,
    ) -> Result<UnsubAckMessage> {
        ensure_packet_id(unsubscribe.packet_id, "UNSUBSCRIBE")?;

        let client_id = channel.client_id();
        for filter in &unsubscribe.topic_filters {
            store.remove_subscription(filter, &client_id)?;
            channel.remove_topic(filter);
            debug!("{client_id} unsubscribed from {filter}");
        }

        Ok(UnsubAckMessage {
            packet_id: unsubscribe.packet_id,
        })
    }

    /// PUBLISH -> acknowledgment for the publisher plus subscriber copies.
    ///
    /// A QoS 2 PUBLISH whose packet id is still waiting for PUBREL is a
    /// retransmission: it is acknowledged again but not delivered twice.
    pub fn publish(
        &self,
        publish: PublishMessage,
        channel: &Arc<Channel>,
        store: &dyn SubscriptionStore,
    ) -> Result<PublishOutcome> {
        topic::validate_topic_name(&publish.topic_name)?;

        let packet_id = match publish.qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.unwrap_or(0);
                ensure_packet_id(packet_id, "PUBLISH")?;
                Some(packet_id)
            }
        };

        if let (QoS::ExactlyOnce, Some(packet_id)) = (publish.qos, packet_id) {
            if channel.inbound_flow(packet_id).is_some() {
                debug!("Duplicate QoS 2 PUBLISH {packet_id} from {}", channel.client_id());
                return Ok(PublishOutcome {
                    ack: Some(OutboundPacket::PubRec(PubRecMessage { packet_id })),
                    deliveries: Vec::new(),
                });
            }
        }

        let deliveries = self.fan_out(&publish, store)?;
        debug!(
            "{} published to {} ({:?}), {} deliveries",
            channel.client_id(),
            publish.topic_name,
            publish.qos,
            deliveries.len()
        );

        let ack = match (publish.qos, packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                Some(OutboundPacket::PubAck(PubAckMessage { packet_id }))
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                channel.begin_inbound_qos2(packet_id);
                Some(OutboundPacket::PubRec(PubRecMessage { packet_id }))
            }
            _ => None,
        };

        Ok(PublishOutcome { ack, deliveries })
    }

    /// One copy per subscribing client, at the highest QoS that client was
    /// granted among its matching filters, capped by the PUBLISH QoS.
    fn fan_out(
        &self,
        publish: &PublishMessage,
        store: &dyn SubscriptionStore,
    ) -> Result<Vec<Delivery>> {
        let subscribers = store.find_matching_subscribers(&publish.topic_name)?;

        let mut targets: BTreeMap<String, (QoS, Arc<Channel>)> = BTreeMap::new();
        for subscription in subscribers {
            let Some(target) = subscription.live_channel() else {
                debug!("{} has no live channel", subscription.client_id);
                continue;
            };
            if !target.is_connected() {
                continue;
            }
            targets
                .entry(subscription.client_id)
                .and_modify(|(qos, _)| *qos = cmp::max(*qos, subscription.qos))
                .or_insert((subscription.qos, target));
        }

        let mut deliveries = Vec::with_capacity(targets.len());
        for (client_id, (subscription_qos, target)) in targets {
            let qos = cmp::min(publish.qos, subscription_qos);
            let packet_id = match qos {
                QoS::AtMostOnce => None,
                _ => match target.start_outbound(qos) {
                    Some(packet_id) => Some(packet_id),
                    None => {
                        warn!("No free packet id for {client_id}, dropping delivery");
                        continue;
                    }
                },
            };
            deliveries.push(Delivery {
                channel: target,
                publish: PublishMessage {
                    topic_name: publish.topic_name.clone(),
                    payload: publish.payload.clone(),
                    qos,
                    dup: false,
                    retain: false,
                    packet_id,
                },
            });
        }
        Ok(deliveries)
    }

    /// PUBACK from a subscriber completes a QoS 1 delivery.
    pub fn puback(&self, ack: PubAckMessage, channel: &Arc<Channel>) -> Result<()> {
        channel.advance_outbound(ack.packet_id, OutboundFlow::AwaitingPubAck, None, "PUBACK")
    }

    /// PUBREC from a subscriber -> PUBREL. A repeated PUBREC gets the PUBREL
    /// again.
    pub fn pubrec(&self, rec: PubRecMessage, channel: &Arc<Channel>) -> Result<PubRelMessage> {
        let packet_id = rec.packet_id;
        if channel.outbound_flow(packet_id) != Some(OutboundFlow::AwaitingPubComp) {
            channel.advance_outbound(
                packet_id,
                OutboundFlow::AwaitingPubRec,
                Some(OutboundFlow::AwaitingPubComp),
                "PUBREC",
            )?;
        }
        Ok(PubRelMessage { packet_id })
    }

    /// PUBREL from a publisher -> PUBCOMP, finishing its QoS 2 PUBLISH.
    pub fn pubrel(&self, rel: PubRelMessage, channel: &Arc<Channel>) -> Result<PubCompMessage> {
        channel.complete_inbound_qos2(rel.packet_id)?;
        Ok(PubCompMessage {
            packet_id: rel.packet_id,
        })
    }

    /// PUBCOMP from a subscriber completes a QoS 2 delivery.
    pub fn pubcomp(&self, comp: PubCompMessage, channel: &Arc<Channel>) -> Result<()> {
        channel.advance_outbound(
            comp.packet_id,
            OutboundFlow::AwaitingPubComp,
            None,
            "PUBCOMP",
        )
    }
}

fn ensure_packet_id(packet_id: u16, packet: &str) -> Result<()> {
    if packet_id == 0 {
        return Err(BrokerError::ProtocolViolation(format!(
            "{packet} requires a non-zero packet identifier"
        )));
    }
    Ok(())
}
