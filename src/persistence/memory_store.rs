//! In-memory subscription store
//!
//! Subscriptions are kept as `filter -> (client id -> Subscription)` behind a
//! single `RwLock`. Both levels are ordered maps, so lookups return matches
//! in a deterministic order. Session owners sit in a separate map.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;
use uuid::Uuid;

use super::{SessionOwners, Subscription, SubscriptionStore, claim_owner, release_owner};
use crate::broker::topic;
use crate::channel::Channel;
use crate::utils::Result;

type FilterTable = BTreeMap<String, BTreeMap<String, Subscription>>;

#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    filters: RwLock<FilterTable>,
    owners: RwLock<SessionOwners>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, FilterTable> {
        self.filters.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FilterTable> {
        self.filters.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn owners(&self) -> RwLockWriteGuard<'_, SessionOwners> {
        self.owners.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total number of stored subscriptions.
    pub fn len(&self) -> usize {
        self.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SubscriptionStore for MemorySubscriptionStore {
    fn store_subscription(&self, subscription: Subscription) -> Result<()> {
        debug!(
            "Storing subscription {} -> {} ({:?})",
            subscription.client_id, subscription.topic_filter, subscription.qos
        );
        self.write()
            .entry(subscription.topic_filter.clone())
            .or_default()
            .insert(subscription.client_id.clone(), subscription);
        Ok(())
    }

    fn remove_subscription(&self, topic_filter: &str, client_id: &str) -> Result<()> {
        let mut filters = self.write();
        if let Some(clients) = filters.get_mut(topic_filter) {
            clients.remove(client_id);
            if clients.is_empty() {
                filters.remove(topic_filter);
            }
        }
        Ok(())
    }

    fn is_subscription_live(&self, topic_filter: &str, client_id: &str) -> Result<bool> {
        Ok(self
            .read()
            .get(topic_filter)
            .is_some_and(|clients| clients.contains_key(client_id)))
    }

    fn find_matching_subscribers(&self, topic_name: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .read()
            .iter()
            .filter(|(filter, _)| topic::matches(filter, topic_name))
            .flat_map(|(_, clients)| clients.values().cloned())
            .collect())
    }

    fn remove_all_for_client(&self, client_id: &str) -> Result<()> {
        let mut filters = self.write();
        filters.retain(|_, clients| {
            clients.remove(client_id);
            !clients.is_empty()
        });
        Ok(())
    }

    fn subscriptions_for_client(&self, client_id: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .read()
            .values()
            .filter_map(|clients| clients.get(client_id).cloned())
            .collect())
    }

    fn reattach_channel(
        &self,
        client_id: &str,
        channel: &Arc<Channel>,
    ) -> Result<Vec<Subscription>> {
        let mut filters = self.write();
        let mut reattached = Vec::new();
        for clients in filters.values_mut() {
            if let Some(subscription) = clients.get_mut(client_id) {
                subscription.channel = Arc::downgrade(channel);
                reattached.push(subscription.clone());
            }
        }
        Ok(reattached)
    }

    fn claim_session(
        &self,
        client_id: &str,
        channel: &Arc<Channel>,
    ) -> Result<Option<Arc<Channel>>> {
        Ok(claim_owner(&mut self.owners(), client_id, channel))
    }

    fn session_owner(&self, client_id: &str) -> Result<Option<Arc<Channel>>> {
        Ok(self
            .owners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .and_then(|owner| owner.upgrade()))
    }

    fn release_session(&self, client_id: &str, connection_id: Uuid) -> Result<()> {
        release_owner(&mut self.owners(), client_id, connection_id);
        Ok(())
    }
}
