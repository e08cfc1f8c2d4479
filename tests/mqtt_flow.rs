use std::sync::Arc;

use mqtt_core_broker::broker::BrokerEngine;
use mqtt_core_broker::broker::message::*;
use mqtt_core_broker::channel::Channel;
use mqtt_core_broker::config::{Settings, StoreBackend};
use mqtt_core_broker::persistence::{SubscriptionStore, open_store};
use tempfile::tempdir;
use tokio::sync::mpsc::{self, UnboundedReceiver};

fn new_channel() -> (Arc<Channel>, UnboundedReceiver<OutboundPacket>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Channel::new(tx), rx)
}

fn handle(
    engine: &BrokerEngine,
    store: &dyn SubscriptionStore,
    channel: &Arc<Channel>,
    packet: InboundPacket,
) {
    engine
        .handle(packet, channel, store)
        .unwrap()
        .dispatch(channel)
        .unwrap();
}

fn connect(client_id: &str, clean_session: bool) -> InboundPacket {
    InboundPacket::Connect(ConnectMessage::new(client_id, clean_session))
}

#[test]
fn persistent_session_survives_store_restart_and_completes_qos2() {
    let dir = tempdir().unwrap();
    let mut settings = Settings::default();
    settings.persistence.backend = StoreBackend::Sled;
    settings.persistence.path = dir.path().join("subs").to_string_lossy().into_owned();
    let engine = BrokerEngine::from_settings(&settings).unwrap();

    {
        let store = open_store(&settings.persistence).unwrap();
        let (sensor, mut rx) = new_channel();
        handle(&engine, store.as_ref(), &sensor, connect("dashboard", false));
        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundPacket::ConnAck(ConnAckMessage {
                session_present: false,
                return_code: ConnectReturnCode::Accepted,
            })
        );

        handle(
            &engine,
            store.as_ref(),
            &sensor,
            InboundPacket::Subscribe(SubscribeMessage {
                packet_id: 1,
                topics: vec![TopicSubscription::new("home/+/temp", 2)],
            }),
        );
        assert!(matches!(rx.try_recv().unwrap(), OutboundPacket::SubAck(_)));
        handle(&engine, store.as_ref(), &sensor, InboundPacket::Disconnect);
    }

    let store = open_store(&settings.persistence).unwrap();
    assert!(store.is_subscription_live("home/+/temp", "dashboard").unwrap());

    let (dashboard, mut dashboard_rx) = new_channel();
    handle(&engine, store.as_ref(), &dashboard, connect("dashboard", false));
    assert_eq!(
        dashboard_rx.try_recv().unwrap(),
        OutboundPacket::ConnAck(ConnAckMessage {
            session_present: true,
            return_code: ConnectReturnCode::Accepted,
        })
    );

    let (thermometer, mut thermometer_rx) = new_channel();
    handle(&engine, store.as_ref(), &thermometer, connect("thermometer", true));
    thermometer_rx.try_recv().unwrap();

    handle(
        &engine,
        store.as_ref(),
        &thermometer,
        InboundPacket::Publish(
            PublishMessage::new("home/kitchen/temp", "21.5", QoS::ExactlyOnce).with_packet_id(7),
        ),
    );
    assert_eq!(
        thermometer_rx.try_recv().unwrap(),
        OutboundPacket::PubRec(PubRecMessage { packet_id: 7 })
    );

    let delivered = match dashboard_rx.try_recv().unwrap() {
        OutboundPacket::Publish(publish) => publish,
        other => panic!("Expected a publish, got {other:?}"),
    };
    assert_eq!(delivered.qos, QoS::ExactlyOnce);
    assert_eq!(delivered.payload, b"21.5".to_vec());
    let packet_id = delivered.packet_id.unwrap();

    handle(
        &engine,
        store.as_ref(),
        &dashboard,
        InboundPacket::PubRec(PubRecMessage { packet_id }),
    );
    assert_eq!(
        dashboard_rx.try_recv().unwrap(),
        OutboundPacket::PubRel(PubRelMessage { packet_id })
    );
    handle(
        &engine,
        store.as_ref(),
        &dashboard,
        InboundPacket::PubComp(PubCompMessage { packet_id }),
    );
    assert_eq!(dashboard.in_flight(), 0);

    handle(
        &engine,
        store.as_ref(),
        &thermometer,
        InboundPacket::PubRel(PubRelMessage { packet_id: 7 }),
    );
    assert_eq!(
        thermometer_rx.try_recv().unwrap(),
        OutboundPacket::PubComp(PubCompMessage { packet_id: 7 })
    );
    assert_eq!(thermometer.in_flight(), 0);
}

#[test]
fn unknown_ack_is_reported_but_not_fatal() {
    let engine = BrokerEngine::default();
    let store = open_store(&Settings::default().persistence).unwrap();
    let (channel, _rx) = new_channel();
    handle(&engine, store.as_ref(), &channel, connect("client", true));

    let err = engine
        .handle(
            InboundPacket::PubAck(PubAckMessage { packet_id: 99 }),
            &channel,
            store.as_ref(),
        )
        .unwrap_err();
    assert!(!err.is_fatal());

    let err = engine
        .handle(connect("client", true), &channel, store.as_ref())
        .unwrap_err();
    assert!(err.is_fatal());
}
