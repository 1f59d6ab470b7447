//! Cluster-state feed.
//!
//! Stores advertise their descriptors under a per-store key; store pools
//! subscribe to the stream of updates. [`LocalGossip`] is an in-process
//! feed backed by a tokio broadcast channel.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rangekeep_id::StoreId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

use crate::error::FeedError;
use crate::types::{Liveness, StoreDescriptor};

/// Default buffer of the in-process feed.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Feed key under which a store's descriptor is advertised.
pub fn store_key(store_id: StoreId) -> String {
    format!("store:{}", store_id.value())
}

/// One observation of a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreUpdate {
    pub descriptor: StoreDescriptor,
    pub liveness: Liveness,
    pub observed_at: DateTime<Utc>,
    /// How long the info stays retrievable from the feed. Zero means forever.
    #[serde(with = "ttl_millis")]
    pub ttl: Duration,
}

impl StoreUpdate {
    pub fn store_id(&self) -> StoreId {
        self.descriptor.store_id
    }

    pub fn key(&self) -> String {
        store_key(self.store_id())
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        if self.ttl.is_zero() {
            return false;
        }
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - self.observed_at > ttl,
            Err(_) => false,
        }
    }
}

mod ttl_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(ttl.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Read side and publish primitive of the cluster-state feed.
pub trait ClusterFeed: Send + Sync {
    /// Stream of updates published after the call.
    fn subscribe(&self) -> BroadcastStream<StoreUpdate>;

    /// Advertise a live store's descriptor, retained for `ttl`.
    fn publish(&self, descriptor: StoreDescriptor, ttl: Duration) -> Result<(), FeedError>;
}

/// In-process feed shared by every node of a local cluster.
pub struct LocalGossip {
    tx: broadcast::Sender<StoreUpdate>,
    infos: Mutex<HashMap<StoreId, StoreUpdate>>,
}

impl LocalGossip {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            infos: Mutex::new(HashMap::new()),
        }
    }

    /// Broadcast an arbitrary observation.
    pub fn announce(&self, update: StoreUpdate) -> Result<(), FeedError> {
        let store_id = update.store_id();
        trace!(key = %update.key(), liveness = %update.liveness, "announcing store");
        self.infos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(store_id, update.clone());
        self.tx
            .send(update)
            .map(|_| ())
            .map_err(|_| FeedError::NoSubscribers { store_id })
    }

    /// Broadcast that a previously advertised store is dead.
    ///
    /// Returns false if the store never advertised itself.
    pub fn declare_dead(&self, store_id: StoreId) -> bool {
        let Some(last) = self.latest_any(store_id) else {
            return false;
        };
        let update = StoreUpdate {
            liveness: Liveness::Dead,
            observed_at: Utc::now(),
            ttl: Duration::ZERO,
            ..last
        };
        if let Err(e) = self.announce(update) {
            debug!(error = %e, "dead store announcement had no listeners");
        }
        true
    }

    /// Latest unexpired info for `store_id`.
    pub fn latest(&self, store_id: StoreId, now: DateTime<Utc>) -> Option<StoreUpdate> {
        self.latest_any(store_id).filter(|u| !u.expired(now))
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn latest_any(&self, store_id: StoreId) -> Option<StoreUpdate> {
        self.infos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&store_id)
            .cloned()
    }
}

impl Default for LocalGossip {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl ClusterFeed for LocalGossip {
    fn subscribe(&self) -> BroadcastStream<StoreUpdate> {
        BroadcastStream::new(self.tx.subscribe())
    }

    fn publish(&self, descriptor: StoreDescriptor, ttl: Duration) -> Result<(), FeedError> {
        self.announce(StoreUpdate {
            descriptor,
            liveness: Liveness::Alive,
            observed_at: Utc::now(),
            ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Attributes, NodeDescriptor, StoreCapacity};
    use rangekeep_id::NodeId;
    use tokio_stream::StreamExt;

    fn descriptor(id: i32) -> StoreDescriptor {
        StoreDescriptor {
            store_id: StoreId::new(id),
            node: NodeDescriptor {
                node_id: NodeId::new(id),
                attrs: Attributes::default(),
            },
            attrs: Attributes::default(),
            capacity: StoreCapacity::default(),
        }
    }

    #[test]
    fn test_store_key() {
        assert_eq!(store_key(StoreId::new(12)), "store:12");
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let gossip = LocalGossip::default();
        let mut updates = gossip.subscribe();

        gossip.publish(descriptor(1), Duration::ZERO).unwrap();

        let update = updates.next().await.unwrap().unwrap();
        assert_eq!(update.store_id(), StoreId::new(1));
        assert_eq!(update.liveness, Liveness::Alive);
    }

    #[test]
    fn test_publish_without_subscribers_is_reported() {
        let gossip = LocalGossip::default();
        let err = gossip.publish(descriptor(1), Duration::ZERO).unwrap_err();
        assert_eq!(
            err,
            FeedError::NoSubscribers {
                store_id: StoreId::new(1)
            }
        );
        // The info is still retained.
        assert!(gossip.latest(StoreId::new(1), Utc::now()).is_some());
    }

    #[tokio::test]
    async fn test_declare_dead() {
        let gossip = LocalGossip::default();
        let mut updates = gossip.subscribe();
        assert!(!gossip.declare_dead(StoreId::new(2)));

        gossip.publish(descriptor(2), Duration::ZERO).unwrap();
        assert!(gossip.declare_dead(StoreId::new(2)));

        let first = updates.next().await.unwrap().unwrap();
        let second = updates.next().await.unwrap().unwrap();
        assert_eq!(first.liveness, Liveness::Alive);
        assert_eq!(second.liveness, Liveness::Dead);
        assert_eq!(second.descriptor, first.descriptor);
    }

    #[test]
    fn test_info_expires_after_ttl() {
        let gossip = LocalGossip::default();
        let _ = gossip.publish(descriptor(3), Duration::from_secs(10));
        let now = Utc::now();

        assert!(gossip.latest(StoreId::new(3), now).is_some());
        assert!(gossip
            .latest(StoreId::new(3), now + chrono::Duration::seconds(11))
            .is_none());
    }
}
