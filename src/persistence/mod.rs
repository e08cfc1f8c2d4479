//! The `persistence` module records which clients are subscribed to which
//! topic filters.
//!
//! The engine only talks to the [`SubscriptionStore`] trait, so the backing
//! store can be swapped without touching protocol logic. Two implementations
//! ship with the crate:
//!
//! - [`MemorySubscriptionStore`]: process-local, lost on restart.
//! - [`SledSubscriptionStore`]: durable, uses `sled` as an embedded
//!   key-value store so persistent sessions survive a broker restart.

pub mod memory_store;
pub mod sled_store;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tracing::info;
use uuid::Uuid;

use crate::broker::message::QoS;
use crate::channel::Channel;
use crate::config::{PersistenceSettings, StoreBackend};
use crate::utils::Result;

pub use memory_store::MemorySubscriptionStore;
pub use sled_store::{SledSubscriptionStore, StoredSubscription};

/// One `(client id, topic filter)` subscription.
///
/// The channel reference is weak: it routes deliveries and never keeps a
/// closed connection alive.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic_filter: String,
    pub client_id: String,
    pub username: Option<String>,
    pub clean_session: bool,
    pub qos: QoS,
    pub channel: Weak<Channel>,
}

impl Subscription {
    pub fn new(
        topic_filter: &str,
        client_id: &str,
        username: Option<String>,
        clean_session: bool,
        qos: QoS,
        channel: &Arc<Channel>,
    ) -> Self {
        Self {
            topic_filter: topic_filter.to_string(),
            client_id: client_id.to_string(),
            username,
            clean_session,
            qos,
            channel: Arc::downgrade(channel),
        }
    }

    /// The live channel, if the owning connection is still open.
    pub fn live_channel(&self) -> Option<Arc<Channel>> {
        self.channel.upgrade()
    }
}

/// Capability set the engine needs from a subscription store.
///
/// Mutations must be atomic with respect to concurrent reads: a fan-out
/// lookup sees either all or none of a concurrent change.
pub trait SubscriptionStore: Send + Sync {
    /// Upserts keyed by `(client_id, topic_filter)`; an existing entry has
    /// its QoS (and channel) replaced.
    fn store_subscription(&self, subscription: Subscription) -> Result<()>;

    /// Removes the entry if present. Absent entries are not an error.
    fn remove_subscription(&self, topic_filter: &str, client_id: &str) -> Result<()>;

    /// True iff an entry exists for exactly this pair.
    fn is_subscription_live(&self, topic_filter: &str, client_id: &str) -> Result<bool>;

    /// Every subscription whose filter matches `topic_name`, in a stable order.
    fn find_matching_subscribers(&self, topic_name: &str) -> Result<Vec<Subscription>>;

    /// Drops every subscription owned by `client_id`.
    fn remove_all_for_client(&self, client_id: &str) -> Result<()>;

    /// Subscriptions currently held for `client_id`.
    fn subscriptions_for_client(&self, client_id: &str) -> Result<Vec<Subscription>>;

    /// Points every subscription of `client_id` at a new channel (session
    /// resumption) and returns them.
    fn reattach_channel(&self, client_id: &str, channel: &Arc<Channel>)
    -> Result<Vec<Subscription>>;

    /// Makes `channel` the owner of `client_id`'s session. Returns the
    /// previous owner if it is a different, still-alive connection.
    fn claim_session(&self, client_id: &str, channel: &Arc<Channel>)
    -> Result<Option<Arc<Channel>>>;

    /// The live connection currently owning `client_id`'s session.
    fn session_owner(&self, client_id: &str) -> Result<Option<Arc<Channel>>>;

    /// Forgets the owner of `client_id`'s session, but only if it is still
    /// the connection `connection_id`.
    fn release_session(&self, client_id: &str, connection_id: Uuid) -> Result<()>;
}

/// Owner bookkeeping shared by the stores: at most one live channel per
/// client id.
pub(crate) type SessionOwners = HashMap<String, Weak<Channel>>;

pub(crate) fn claim_owner(
    owners: &mut SessionOwners,
    client_id: &str,
    channel: &Arc<Channel>,
) -> Option<Arc<Channel>> {
    owners.retain(|_, owner| owner.strong_count() > 0);
    owners
        .insert(client_id.to_string(), Arc::downgrade(channel))
        .and_then(|previous| previous.upgrade())
        .filter(|previous| previous.connection_id() != channel.connection_id())
}

pub(crate) fn release_owner(owners: &mut SessionOwners, client_id: &str, connection_id: Uuid) {
    let owned = owners
        .get(client_id)
        .and_then(Weak::upgrade)
        .is_none_or(|owner| owner.connection_id() == connection_id);
    if owned {
        owners.remove(client_id);
    }
}

/// Opens the store selected by configuration.
pub fn open_store(settings: &PersistenceSettings) -> Result<Arc<dyn SubscriptionStore>> {
    match settings.backend {
        StoreBackend::Memory => {
            info!("Using in-memory subscription store");
            Ok(Arc::new(MemorySubscriptionStore::new()))
        }
        StoreBackend::Sled => {
            info!("Using sled subscription store at {}", settings.path);
            Ok(Arc::new(SledSubscriptionStore::open(&settings.path)?))
        }
    }
}

#[cfg(test)]
mod tests;
