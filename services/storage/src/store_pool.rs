//! Eventually-consistent view of every store's capacity and liveness.
//!
//! The pool is fed by the cluster-state feed and read by the allocator.
//! Readers load an immutable snapshot without locking; writers build a new
//! map and swap it in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rangekeep_id::StoreId;
use tokio::sync::watch;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::gossip::{ClusterFeed, StoreUpdate};
use crate::types::{Liveness, ReplicaDescriptor, StoreDescriptor};

/// What the pool knows about one store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreDetail {
    pub descriptor: StoreDescriptor,
    pub liveness: Liveness,
    pub last_update: DateTime<Utc>,
}

/// Averages over the alive stores.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CapacityStats {
    pub alive_stores: usize,
    pub mean_range_count: f64,
    pub mean_fraction_used: f64,
}

type Snapshot = HashMap<StoreId, StoreDetail>;

/// Per-node cache of store descriptors and liveness.
pub struct StorePool {
    snapshot: ArcSwap<Snapshot>,
    time_until_store_dead: Duration,
    sweep_interval: Duration,
}

impl StorePool {
    /// Create an empty pool.
    ///
    /// A store not heard from for `time_until_store_dead` is considered
    /// dead; the background task checks every `sweep_interval`.
    pub fn new(time_until_store_dead: Duration, sweep_interval: Duration) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            time_until_store_dead,
            sweep_interval,
        }
    }

    pub fn time_until_store_dead(&self) -> Duration {
        self.time_until_store_dead
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Descriptor for `store_id`, if the store has ever been observed.
    pub fn store_descriptor(&self, store_id: StoreId) -> Option<StoreDescriptor> {
        self.snapshot
            .load()
            .get(&store_id)
            .map(|d| d.descriptor.clone())
    }

    /// Full detail for `store_id`.
    pub fn store_detail(&self, store_id: StoreId) -> Option<StoreDetail> {
        self.snapshot.load().get(&store_id).cloned()
    }

    /// Liveness of `store_id`; `Unknown` if never observed.
    pub fn liveness(&self, store_id: StoreId) -> Liveness {
        self.snapshot
            .load()
            .get(&store_id)
            .map_or(Liveness::Unknown, |d| d.liveness)
    }

    /// Replicas whose store is dead, in input order.
    pub fn dead_replicas(&self, replicas: &[ReplicaDescriptor]) -> Vec<ReplicaDescriptor> {
        let snapshot = self.snapshot.load();
        replicas
            .iter()
            .filter(|r| {
                snapshot
                    .get(&r.store_id)
                    .is_some_and(|d| d.liveness == Liveness::Dead)
            })
            .copied()
            .collect()
    }

    /// Number of replicas whose store is alive. Unknown stores do not count.
    pub fn live_count(&self, replicas: &[ReplicaDescriptor]) -> usize {
        let snapshot = self.snapshot.load();
        replicas
            .iter()
            .filter(|r| {
                snapshot
                    .get(&r.store_id)
                    .is_some_and(|d| d.liveness == Liveness::Alive)
            })
            .count()
    }

    /// Descriptors of every alive store, ordered by store ID.
    pub fn alive_stores(&self) -> Vec<StoreDescriptor> {
        let mut stores: Vec<_> = self
            .snapshot
            .load()
            .values()
            .filter(|d| d.liveness == Liveness::Alive)
            .map(|d| d.descriptor.clone())
            .collect();
        stores.sort_by_key(|d| d.store_id);
        stores
    }

    /// Every known store, ordered by store ID.
    pub fn all_stores(&self) -> Vec<StoreDetail> {
        let mut stores: Vec<_> = self.snapshot.load().values().cloned().collect();
        stores.sort_by_key(|d| d.descriptor.store_id);
        stores
    }

    /// Mean range count and disk usage across alive stores.
    pub fn capacity_stats(&self) -> CapacityStats {
        let snapshot = self.snapshot.load();
        let alive: Vec<_> = snapshot
            .values()
            .filter(|d| d.liveness == Liveness::Alive)
            .collect();

        if alive.is_empty() {
            return CapacityStats::default();
        }

        let count = alive.len() as f64;
        let ranges: f64 = alive
            .iter()
            .map(|d| f64::from(d.descriptor.capacity.range_count))
            .sum();
        let used: f64 = alive
            .iter()
            .map(|d| d.descriptor.capacity.fraction_used())
            .sum();

        CapacityStats {
            alive_stores: alive.len(),
            mean_range_count: ranges / count,
            mean_fraction_used: used / count,
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Merge one feed update.
    ///
    /// An update older than what the pool already holds for the store is
    /// ignored; otherwise it replaces the entry, whichever liveness it
    /// carries.
    pub fn apply(&self, update: StoreUpdate) {
        let store_id = update.store_id();
        let detail = StoreDetail {
            descriptor: update.descriptor,
            liveness: update.liveness,
            last_update: update.observed_at,
        };

        self.snapshot.rcu(|current| {
            if let Some(existing) = current.get(&store_id) {
                if existing.last_update > detail.last_update {
                    return Arc::clone(current);
                }
            }
            let mut next = HashMap::clone(current);
            next.insert(store_id, detail.clone());
            Arc::new(next)
        });
    }

    /// Mark stores not heard from within `time_until_store_dead` as dead.
    ///
    /// Returns the stores that changed state.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Vec<StoreId> {
        let Ok(threshold) = chrono::Duration::from_std(self.time_until_store_dead) else {
            return Vec::new();
        };

        let is_stale =
            |d: &StoreDetail| d.liveness == Liveness::Alive && now - d.last_update > threshold;

        let mut expired = Vec::new();
        self.snapshot.rcu(|current| {
            expired.clear();
            if !current.values().any(is_stale) {
                return Arc::clone(current);
            }
            let mut next = HashMap::clone(current);
            for (store_id, detail) in next.iter_mut() {
                if is_stale(&*detail) {
                    detail.liveness = Liveness::Dead;
                    expired.push(*store_id);
                }
            }
            Arc::new(next)
        });

        expired.sort();
        expired
    }

    // =========================================================================
    // Background Task
    // =========================================================================

    /// Follow `feed` and sweep for stale stores until shutdown.
    #[instrument(skip(self, feed, shutdown))]
    pub async fn run(&self, feed: &dyn ClusterFeed, mut shutdown: watch::Receiver<bool>) {
        let mut updates = feed.subscribe();
        let sweep_interval = self.sweep_interval.max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval(sweep_interval);

        info!(
            time_until_store_dead_secs = self.time_until_store_dead.as_secs(),
            sweep_interval_ms = sweep_interval.as_millis() as u64,
            "Starting store pool"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Store pool shutting down");
                        break;
                    }
                }
                msg = updates.next() => {
                    match msg {
                        Some(Ok(update)) => {
                            debug!(
                                key = %update.key(),
                                liveness = %update.liveness,
                                "store update"
                            );
                            self.apply(update);
                        }
                        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                            warn!(skipped, "store pool fell behind the feed, continuing");
                        }
                        None => {
                            info!("Cluster feed closed, store pool stopping");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    for store_id in self.expire_stale(Utc::now()) {
                        warn!(store_id = %store_id, "store not heard from, marking dead");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Attributes, NodeDescriptor, StoreCapacity};
    use rangekeep_id::NodeId;

    fn update(id: i32, liveness: Liveness, ranges: i32, at: DateTime<Utc>) -> StoreUpdate {
        StoreUpdate {
            descriptor: StoreDescriptor {
                store_id: StoreId::new(id),
                node: NodeDescriptor {
                    node_id: NodeId::new(id),
                    attrs: Attributes::default(),
                },
                attrs: Attributes::default(),
                capacity: StoreCapacity {
                    total_bytes: 100,
                    available_bytes: 100 - i64::from(ranges),
                    range_count: ranges,
                },
            },
            liveness,
            observed_at: at,
            ttl: Duration::ZERO,
        }
    }

    fn replica(id: i32) -> ReplicaDescriptor {
        ReplicaDescriptor::new(NodeId::new(id), StoreId::new(id))
    }

    fn pool() -> StorePool {
        StorePool::new(Duration::from_secs(60), Duration::from_secs(1))
    }

    #[test]
    fn test_unknown_store() {
        let pool = pool();
        assert_eq!(pool.liveness(StoreId::new(9)), Liveness::Unknown);
        assert!(pool.store_descriptor(StoreId::new(9)).is_none());
        assert_eq!(pool.live_count(&[replica(9)]), 0);
        assert!(pool.dead_replicas(&[replica(9)]).is_empty());
    }

    #[test]
    fn test_dead_and_live_counts() {
        let pool = pool();
        let now = Utc::now();
        pool.apply(update(1, Liveness::Alive, 0, now));
        pool.apply(update(2, Liveness::Dead, 0, now));
        pool.apply(update(3, Liveness::Alive, 0, now));

        let replicas = [replica(1), replica(2), replica(3), replica(4)];
        assert_eq!(pool.live_count(&replicas), 2);
        assert_eq!(pool.dead_replicas(&replicas), vec![replica(2)]);
    }

    #[test]
    fn test_flapping_store() {
        let pool = pool();
        let now = Utc::now();
        pool.apply(update(1, Liveness::Alive, 0, now));
        pool.apply(update(1, Liveness::Dead, 0, now + chrono::Duration::seconds(1)));
        assert_eq!(pool.liveness(StoreId::new(1)), Liveness::Dead);

        pool.apply(update(1, Liveness::Alive, 0, now + chrono::Duration::seconds(2)));
        assert_eq!(pool.liveness(StoreId::new(1)), Liveness::Alive);
    }

    #[test]
    fn test_older_update_is_ignored() {
        let pool = pool();
        let now = Utc::now();
        pool.apply(update(1, Liveness::Dead, 0, now));
        pool.apply(update(1, Liveness::Alive, 0, now - chrono::Duration::seconds(1)));
        assert_eq!(pool.liveness(StoreId::new(1)), Liveness::Dead);
    }

    #[test]
    fn test_expire_stale() {
        let pool = pool();
        let now = Utc::now();
        pool.apply(update(1, Liveness::Alive, 0, now - chrono::Duration::seconds(120)));
        pool.apply(update(2, Liveness::Alive, 0, now));

        assert_eq!(pool.expire_stale(now), vec![StoreId::new(1)]);
        assert_eq!(pool.liveness(StoreId::new(1)), Liveness::Dead);
        assert_eq!(pool.liveness(StoreId::new(2)), Liveness::Alive);
        assert!(pool.expire_stale(now).is_empty());
    }

    #[test]
    fn test_alive_stores_and_stats() {
        let pool = pool();
        let now = Utc::now();
        pool.apply(update(3, Liveness::Alive, 30, now));
        pool.apply(update(1, Liveness::Alive, 10, now));
        pool.apply(update(2, Liveness::Dead, 90, now));

        let ids: Vec<_> = pool.alive_stores().iter().map(|d| d.store_id).collect();
        assert_eq!(ids, vec![StoreId::new(1), StoreId::new(3)]);

        let stats = pool.capacity_stats();
        assert_eq!(stats.alive_stores, 2);
        assert!((stats.mean_range_count - 20.0).abs() < 1e-9);
        assert!((stats.mean_fraction_used - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_all_stores_includes_dead() {
        let pool = pool();
        let now = Utc::now();
        pool.apply(update(2, Liveness::Dead, 5, now));
        pool.apply(update(1, Liveness::Alive, 0, now));

        let seen: Vec<_> = pool
            .all_stores()
            .into_iter()
            .map(|d| (d.descriptor.store_id, d.liveness))
            .collect();
        assert_eq!(
            seen,
            vec![
                (StoreId::new(1), Liveness::Alive),
                (StoreId::new(2), Liveness::Dead),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_applies_feed_updates() {
        use crate::gossip::LocalGossip;

        let pool = Arc::new(pool());
        let gossip = Arc::new(LocalGossip::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let pool = Arc::clone(&pool);
            let gossip = Arc::clone(&gossip);
            tokio::spawn(async move { pool.run(gossip.as_ref(), shutdown_rx).await })
        };

        while gossip.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        gossip
            .publish(update(5, Liveness::Alive, 1, Utc::now()).descriptor, Duration::ZERO)
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.liveness(StoreId::new(5)) != Liveness::Alive {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("update should be applied");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
