//! Subscription store backed by `sled`
//!
//! Subscriptions live in one tree keyed by the client id (prefixed with its
//! big-endian `u32` byte length) followed by the topic filter, so all of a
//! client's subscriptions are a single prefix scan away and no client id can
//! be a prefix of another's keys. Values are JSON `StoredSubscription`
//! records. Live channels cannot be persisted; the session owner of each
//! client id is tracked in memory and re-linked on reconnect.
//!
//! A store-wide `RwLock` serialises mutations against lookups so a fan-out
//! never observes a half-applied change.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{SessionOwners, Subscription, SubscriptionStore, claim_owner, release_owner};
use crate::broker::message::QoS;
use crate::broker::topic;
use crate::channel::Channel;
use crate::utils::Result;

const SUBSCRIPTIONS_TREE: &str = "subscriptions";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredSubscription {
    pub topic_filter: String,
    pub client_id: String,
    pub username: Option<String>,
    pub clean_session: bool,
    pub qos: QoS,
    /// Milliseconds since UNIX epoch.
    pub subscribed_at: i64,
}

pub struct SledSubscriptionStore {
    db: Db,
    tree: Tree,
    live: RwLock<SessionOwners>,
}

fn client_prefix(client_id: &str) -> Vec<u8> {
    let length = client_id.len() as u32;
    let mut prefix = Vec::with_capacity(4 + client_id.len());
    prefix.extend_from_slice(&length.to_be_bytes());
    prefix.extend_from_slice(client_id.as_bytes());
    prefix
}

fn subscription_key(client_id: &str, topic_filter: &str) -> Vec<u8> {
    let mut key = client_prefix(client_id);
    key.extend_from_slice(topic_filter.as_bytes());
    key
}

impl SledSubscriptionStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(SUBSCRIPTIONS_TREE)?;
        Ok(Self {
            db,
            tree,
            live: RwLock::new(HashMap::new()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionOwners> {
        self.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionOwners> {
        self.live.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forces pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn hydrate(stored: StoredSubscription, live: &SessionOwners) -> Subscription {
        let channel = live.get(&stored.client_id).cloned().unwrap_or_default();
        Subscription {
            topic_filter: stored.topic_filter,
            client_id: stored.client_id,
            username: stored.username,
            clean_session: stored.clean_session,
            qos: stored.qos,
            channel,
        }
    }

    fn load_prefix(&self, client_id: &str, live: &SessionOwners) -> Result<Vec<Subscription>> {
        let mut subscriptions = Vec::new();
        for entry in self.tree.scan_prefix(client_prefix(client_id)) {
            let (_, value) = entry?;
            let stored: StoredSubscription = serde_json::from_slice(&value)?;
            subscriptions.push(Self::hydrate(stored, live));
        }
        Ok(subscriptions)
    }
}

impl SubscriptionStore for SledSubscriptionStore {
    fn store_subscription(&self, subscription: Subscription) -> Result<()> {
        let mut live = self.write();
        let stored = StoredSubscription {
            topic_filter: subscription.topic_filter.clone(),
            client_id: subscription.client_id.clone(),
            username: subscription.username.clone(),
            clean_session: subscription.clean_session,
            qos: subscription.qos,
            subscribed_at: Utc::now().timestamp_millis(),
        };
        let value = serde_json::to_vec(&stored)?;
        self.tree.insert(
            subscription_key(&stored.client_id, &stored.topic_filter),
            value,
        )?;
        let owned = live
            .get(&subscription.client_id)
            .is_some_and(|owner| owner.strong_count() > 0);
        if !owned {
            live.insert(subscription.client_id, subscription.channel);
        }
        debug!(
            "Persisted subscription {} -> {}",
            stored.client_id, stored.topic_filter
        );
        Ok(())
    }

    fn remove_subscription(&self, topic_filter: &str, client_id: &str) -> Result<()> {
        let _live = self.write();
        self.tree.remove(subscription_key(client_id, topic_filter))?;
        Ok(())
    }

    fn is_subscription_live(&self, topic_filter: &str, client_id: &str) -> Result<bool> {
        let _live = self.read();
        Ok(self
            .tree
            .contains_key(subscription_key(client_id, topic_filter))?)
    }

    fn find_matching_subscribers(&self, topic_name: &str) -> Result<Vec<Subscription>> {
        let live = self.read();
        let mut matching = Vec::new();
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            let stored: StoredSubscription = serde_json::from_slice(&value)?;
            if topic::matches(&stored.topic_filter, topic_name) {
                matching.push(Self::hydrate(stored, &live));
            }
        }
        Ok(matching)
    }

    fn remove_all_for_client(&self, client_id: &str) -> Result<()> {
        let _live = self.write();
        let mut batch = Batch::default();
        for entry in self.tree.scan_prefix(client_prefix(client_id)) {
            let (key, _) = entry?;
            batch.remove(key);
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    fn subscriptions_for_client(&self, client_id: &str) -> Result<Vec<Subscription>> {
        let live = self.read();
        self.load_prefix(client_id, &live)
    }

    fn reattach_channel(
        &self,
        client_id: &str,
        channel: &Arc<Channel>,
    ) -> Result<Vec<Subscription>> {
        let mut live = self.write();
        let subscriptions = self.load_prefix(client_id, &live)?;
        if subscriptions.is_empty() {
            return Ok(subscriptions);
        }
        live.insert(client_id.to_string(), Arc::downgrade(channel));
        Ok(subscriptions
            .into_iter()
            .map(|mut subscription| {
                subscription.channel = Arc::downgrade(channel);
                subscription
            })
            .collect())
    }

    fn claim_session(
        &self,
        client_id: &str,
        channel: &Arc<Channel>,
    ) -> Result<Option<Arc<Channel>>> {
        Ok(claim_owner(&mut self.write(), client_id, channel))
    }

    fn session_owner(&self, client_id: &str) -> Result<Option<Arc<Channel>>> {
        Ok(self.read().get(client_id).and_then(|owner| owner.upgrade()))
    }

    fn release_session(&self, client_id: &str, connection_id: Uuid) -> Result<()> {
        release_owner(&mut self.write(), client_id, connection_id);
        Ok(())
    }
}

impl Drop for SledSubscriptionStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            warn!("Failed to flush subscription store: {e}");
        }
    }
}

impl std::fmt::Debug for SledSubscriptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledSubscriptionStore")
            .field("db", &"sled::Db")
            .field("subscriptions", &self.tree.len())
            .finish()
    }
}
