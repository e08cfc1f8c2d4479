use std::sync::Arc;

use super::*;
use crate::broker::message::{OutboundPacket, QoS};
use crate::channel::Channel;
use crate::config::{PersistenceSettings, Settings, StoreBackend};
use tempfile::tempdir;
use tokio::sync::mpsc::{self, UnboundedReceiver};

fn new_channel() -> (Arc<Channel>, UnboundedReceiver<OutboundPacket>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Channel::new(tx), rx)
}

fn subscription(filter: &str, client_id: &str, qos: QoS, channel: &Arc<Channel>) -> Subscription {
    Subscription::new(filter, client_id, None, false, qos, channel)
}

fn open_sled(path: &std::path::Path) -> SledSubscriptionStore {
    SledSubscriptionStore::open(path.to_str().unwrap()).unwrap()
}

// Behaviour shared by every backend.

fn check_store_and_remove(store: &dyn SubscriptionStore) {
    let (channel, _rx) = new_channel();
    store
        .store_subscription(subscription("a/b", "client1", QoS::AtLeastOnce, &channel))
        .unwrap();
    assert!(store.is_subscription_live("a/b", "client1").unwrap());
    assert!(!store.is_subscription_live("a/b", "client2").unwrap());
    assert!(!store.is_subscription_live("a/c", "client1").unwrap());

    store.remove_subscription("a/b", "client1").unwrap();
    assert!(!store.is_subscription_live("a/b", "client1").unwrap());

    // removing an absent entry is fine
    store.remove_subscription("a/b", "client1").unwrap();
}

fn check_upsert_replaces_qos(store: &dyn SubscriptionStore) {
    let (channel, _rx) = new_channel();
    store
        .store_subscription(subscription("a/b", "client1", QoS::AtMostOnce, &channel))
        .unwrap();
    store
        .store_subscription(subscription("a/b", "client1", QoS::ExactlyOnce, &channel))
        .unwrap();

    let subscriptions = store.subscriptions_for_client("client1").unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].qos, QoS::ExactlyOnce);
}

fn check_matching_subscribers(store: &dyn SubscriptionStore) {
    let (channel, _rx) = new_channel();
    for (filter, client) in [
        ("a/b", "exact"),
        ("a/+", "plus"),
        ("#", "all"),
        ("a/b/c", "deeper"),
        ("$SYS/#", "sys"),
    ] {
        store
            .store_subscription(subscription(filter, client, QoS::AtMostOnce, &channel))
            .unwrap();
    }

    let mut clients: Vec<String> = store
        .find_matching_subscribers("a/b")
        .unwrap()
        .into_iter()
        .map(|s| s.client_id)
        .collect();
    clients.sort();
    assert_eq!(clients, vec!["all", "exact", "plus"]);

    let sys: Vec<String> = store
        .find_matching_subscribers("$SYS/uptime")
        .unwrap()
        .into_iter()
        .map(|s| s.client_id)
        .collect();
    assert_eq!(sys, vec!["sys"]);
}

fn check_remove_all_for_client(store: &dyn SubscriptionStore) {
    let (channel, _rx) = new_channel();
    for filter in ["a", "b", "c/#"] {
        store
            .store_subscription(subscription(filter, "leaving", QoS::AtLeastOnce, &channel))
            .unwrap();
    }
    store
        .store_subscription(subscription("a", "staying", QoS::AtLeastOnce, &channel))
        .unwrap();

    store.remove_all_for_client("leaving").unwrap();

    assert!(store.subscriptions_for_client("leaving").unwrap().is_empty());
    assert!(store.is_subscription_live("a", "staying").unwrap());
    assert_eq!(store.find_matching_subscribers("a").unwrap().len(), 1);
}

fn check_reattach_channel(store: &dyn SubscriptionStore) {
    let (old, _rx1) = new_channel();
    store
        .store_subscription(subscription("a/b", "client1", QoS::AtLeastOnce, &old))
        .unwrap();
    drop(old);
    assert!(
        store.find_matching_subscribers("a/b").unwrap()[0]
            .live_channel()
            .is_none()
    );

    let (new, _rx2) = new_channel();
    let reattached = store.reattach_channel("client1", &new).unwrap();
    assert_eq!(reattached.len(), 1);
    assert_eq!(reattached[0].topic_filter, "a/b");

    let found = store.find_matching_subscribers("a/b").unwrap();
    let live = found[0].live_channel().unwrap();
    assert!(Arc::ptr_eq(&live, &new));

    let (other, _rx3) = new_channel();
    assert!(store.reattach_channel("unknown", &other).unwrap().is_empty());
}

fn check_session_owners(store: &dyn SubscriptionStore) {
    let (first, _rx1) = new_channel();
    let (second, _rx2) = new_channel();
    assert!(store.session_owner("client1").unwrap().is_none());

    assert!(store.claim_session("client1", &first).unwrap().is_none());
    // claiming again from the same connection is not a takeover
    assert!(store.claim_session("client1", &first).unwrap().is_none());

    let previous = store.claim_session("client1", &second).unwrap().unwrap();
    assert!(Arc::ptr_eq(&previous, &first));
    let owner = store.session_owner("client1").unwrap().unwrap();
    assert!(Arc::ptr_eq(&owner, &second));

    // a superseded connection cannot release the new owner's claim
    store
        .release_session("client1", first.connection_id())
        .unwrap();
    assert!(store.session_owner("client1").unwrap().is_some());

    store
        .release_session("client1", second.connection_id())
        .unwrap();
    assert!(store.session_owner("client1").unwrap().is_none());

    let (third, _rx3) = new_channel();
    store.claim_session("client2", &third).unwrap();
    drop(third);
    assert!(store.session_owner("client2").unwrap().is_none());
}

#[test]
fn test_memory_store_and_remove() {
    check_store_and_remove(&MemorySubscriptionStore::new());
}

#[test]
fn test_memory_upsert_replaces_qos() {
    let store = MemorySubscriptionStore::new();
    check_upsert_replaces_qos(&store);
    assert_eq!(store.len(), 1);
}

#[test]
fn test_memory_matching_subscribers() {
    check_matching_subscribers(&MemorySubscriptionStore::new());
}

#[test]
fn test_memory_remove_all_for_client() {
    check_remove_all_for_client(&MemorySubscriptionStore::new());
}

#[test]
fn test_memory_reattach_channel() {
    check_reattach_channel(&MemorySubscriptionStore::new());
}

#[test]
fn test_memory_session_owners() {
    check_session_owners(&MemorySubscriptionStore::new());
}

#[test]
fn test_memory_store_drops_empty_filters() {
    let store = MemorySubscriptionStore::new();
    let (channel, _rx) = new_channel();
    store
        .store_subscription(subscription("a", "client1", QoS::AtMostOnce, &channel))
        .unwrap();
    store.remove_subscription("a", "client1").unwrap();
    assert!(store.is_empty());
}

#[test]
fn test_sled_store_and_remove() {
    let dir = tempdir().unwrap();
    check_store_and_remove(&open_sled(dir.path()));
}

#[test]
fn test_sled_upsert_replaces_qos() {
    let dir = tempdir().unwrap();
    let store = open_sled(dir.path());
    check_upsert_replaces_qos(&store);
    assert_eq!(store.len(), 1);
}

#[test]
fn test_sled_matching_subscribers() {
    let dir = tempdir().unwrap();
    check_matching_subscribers(&open_sled(dir.path()));
}

#[test]
fn test_sled_remove_all_for_client() {
    let dir = tempdir().unwrap();
    check_remove_all_for_client(&open_sled(dir.path()));
}

#[test]
fn test_sled_reattach_channel() {
    let dir = tempdir().unwrap();
    check_reattach_channel(&open_sled(dir.path()));
}

#[test]
fn test_sled_session_owners() {
    let dir = tempdir().unwrap();
    check_session_owners(&open_sled(dir.path()));
}

#[test]
fn test_sled_subscriptions_survive_reopen() {
    let dir = tempdir().unwrap();
    let (channel, _rx) = new_channel();
    {
        let store = open_sled(dir.path());
        store
            .store_subscription(Subscription::new(
                "sensors/+/temp",
                "sensor-1",
                Some("alice".to_string()),
                false,
                QoS::ExactlyOnce,
                &channel,
            ))
            .unwrap();
        store.flush().unwrap();
    }

    let store = open_sled(dir.path());
    assert!(
        store
            .is_subscription_live("sensors/+/temp", "sensor-1")
            .unwrap()
    );
    let restored = store.subscriptions_for_client("sensor-1").unwrap();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].qos, QoS::ExactlyOnce);
    assert_eq!(restored[0].username.as_deref(), Some("alice"));
    assert!(!restored[0].clean_session);
    // the channel link is process-local and not restored
    assert!(restored[0].live_channel().is_none());

    let matching = store.find_matching_subscribers("sensors/kitchen/temp").unwrap();
    assert_eq!(matching.len(), 1);
}

#[test]
fn test_sled_client_prefix_does_not_leak() {
    let dir = tempdir().unwrap();
    let store = open_sled(dir.path());
    let (channel, _rx) = new_channel();
    store
        .store_subscription(subscription("a", "client", QoS::AtMostOnce, &channel))
        .unwrap();
    store
        .store_subscription(subscription("a", "client-2", QoS::AtMostOnce, &channel))
        .unwrap();

    store
        .store_subscription(subscription("b", "client\0b", QoS::AtMostOnce, &channel))
        .unwrap();

    store.remove_all_for_client("client").unwrap();
    assert!(store.is_subscription_live("a", "client-2").unwrap());
    assert_eq!(store.subscriptions_for_client("client-2").unwrap().len(), 1);
    assert!(store.is_subscription_live("b", "client\0b").unwrap());
    assert!(!store.is_subscription_live("\0b", "client").unwrap());

    // a NUL inside the client id does not collide with the filter boundary
    store
        .store_subscription(subscription("x", "a", QoS::AtMostOnce, &channel))
        .unwrap();
    store
        .store_subscription(subscription("y", "a\0evil", QoS::AtMostOnce, &channel))
        .unwrap();
    store.remove_all_for_client("a").unwrap();
    assert!(!store.is_subscription_live("x", "a").unwrap());
    assert!(store.is_subscription_live("y", "a\0evil").unwrap());
    assert!(store.subscriptions_for_client("a").unwrap().is_empty());
    assert_eq!(store.subscriptions_for_client("a\0evil").unwrap().len(), 1);
}

#[test]
fn test_open_store_selects_backend() {
    let memory = open_store(&Settings::default().persistence).unwrap();
    assert!(memory.subscriptions_for_client("x").unwrap().is_empty());

    let dir = tempdir().unwrap();
    let settings = PersistenceSettings {
        backend: StoreBackend::Sled,
        path: dir.path().join("db").to_string_lossy().into_owned(),
    };
    let sled = open_store(&settings).unwrap();
    let (channel, _rx) = new_channel();
    sled.store_subscription(subscription("a", "c", QoS::AtMostOnce, &channel))
        .unwrap();
    assert!(sled.is_subscription_live("a", "c").unwrap());
}
