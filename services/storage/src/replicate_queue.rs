//! Replica-count maintenance.
//!
//! The replicate queue admits ranges that are under- or over-replicated, hold
//! dead replicas, or sit on an overfull store, and repairs them one
//! membership change at a time. After every change the range is re-offered
//! so multi-step repairs (add, then trim) finish without waiting for the
//! next scan.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rangekeep_id::StoreId;
use rangekeep_queue::{requeue_channel, BaseQueue, ConfigProvider, QueueImpl, Requeue};
use tracing::{debug, error, info, instrument, warn};

use crate::allocator::{compute_quorum, Allocator, AllocatorAction};
use crate::config::ReplicationConfig;
use crate::consensus::ReplicaChanger;
use crate::error::ReplicationError;
use crate::gossip::ClusterFeed;
use crate::replica::Replica;
use crate::system_config::SystemConfig;
use crate::types::{ChangeRequest, ChangeType, RangeDescriptor, ReplicaDescriptor, StoreDescriptor};

/// Name used for the replicate queue in logs.
pub const QUEUE_NAME: &str = "replicate";

/// Computes the local store's current descriptor.
pub trait StoreDescriber: Send + Sync {
    fn describe(&self) -> StoreDescriptor;
}

/// Re-advertises the local store after each membership change, so other
/// allocators see its new capacity without waiting for the periodic
/// broadcast.
pub struct SelfReporter {
    feed: Arc<dyn ClusterFeed>,
    describer: Arc<dyn StoreDescriber>,
    ttl: Duration,
}

impl SelfReporter {
    pub fn new(
        feed: Arc<dyn ClusterFeed>,
        describer: Arc<dyn StoreDescriber>,
        ttl: Duration,
    ) -> Self {
        Self {
            feed,
            describer,
            ttl,
        }
    }

    fn report(&self) {
        let desc = self.describer.describe();
        let store_id = desc.store_id;
        if let Err(e) = self.feed.publish(desc, self.ttl) {
            debug!(store_id = %store_id, error = %e, "failed to publish store descriptor");
        }
    }
}

/// The queue plug-in for one store.
pub struct ReplicateQueue {
    store_id: StoreId,
    allocator: Allocator,
    changer: Arc<dyn ReplicaChanger>,
    requeue: Requeue<Replica>,
    timer_interval: Duration,
    reporter: Option<SelfReporter>,
}

impl ReplicateQueue {
    pub fn new(
        store_id: StoreId,
        allocator: Allocator,
        changer: Arc<dyn ReplicaChanger>,
        requeue: Requeue<Replica>,
        timer_interval: Duration,
    ) -> Self {
        Self {
            store_id,
            allocator,
            changer,
            requeue,
            timer_interval,
            reporter: None,
        }
    }

    /// Publish the local store descriptor after each change.
    pub fn with_reporter(mut self, reporter: SelfReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Refuse a removal that would leave the range without a live quorum.
    fn check_removal_quorum(
        &self,
        desc: &RangeDescriptor,
        target: &ReplicaDescriptor,
    ) -> Result<(), ReplicationError> {
        let pool = self.allocator.store_pool();
        let remaining: Vec<_> = desc
            .replicas
            .iter()
            .filter(|r| r.store_id != target.store_id)
            .copied()
            .collect();
        let live = pool.live_count(&remaining);
        let quorum = compute_quorum(remaining.len());
        if live < quorum {
            return Err(ReplicationError::QuorumViolation {
                range_id: desc.range_id,
                live,
                quorum,
            });
        }
        Ok(())
    }

    async fn change(
        &self,
        replica: &Replica,
        desc: &RangeDescriptor,
        change_type: ChangeType,
        target: ReplicaDescriptor,
    ) -> Result<(), ReplicationError> {
        let request = ChangeRequest::new(change_type, target);
        info!(
            change_id = %request.id,
            change = %change_type,
            target = %target,
            replicas = desc.replicas.len(),
            "dispatching membership change"
        );

        let updated = self
            .changer
            .change_replicas(replica.range(), &request, desc)
            .await?;
        debug!(
            change_id = %request.id,
            replicas = updated.replicas.len(),
            "membership change done"
        );

        if let Some(reporter) = &self.reporter {
            reporter.report();
        }
        Ok(())
    }
}

#[async_trait]
impl QueueImpl for ReplicateQueue {
    type Item = Replica;
    type Config = SystemConfig;
    type Error = ReplicationError;

    fn needs_leader_lease(&self) -> bool {
        true
    }

    /// Ranges spanning zones have no single replication policy.
    fn accepts_unsplit_ranges(&self) -> bool {
        false
    }

    fn timer_interval(&self) -> Duration {
        self.timer_interval
    }

    fn should_queue(
        &self,
        _now: DateTime<Utc>,
        replica: &Replica,
        cfg: &SystemConfig,
    ) -> (bool, f64) {
        let desc = replica.desc();
        if !cfg.compute_split_keys(&desc.start_key, &desc.end_key).is_empty() {
            return (false, 0.0);
        }

        let zone = match cfg.zone_for_key(&desc.start_key) {
            Ok(zone) => zone,
            Err(e) => {
                error!(range_id = %desc.range_id, error = %e, "zone lookup failed");
                return (false, 0.0);
            }
        };

        let (action, priority) = self.allocator.compute_action(&zone, &desc);
        if action != AllocatorAction::Noop {
            return (true, priority);
        }

        (self.allocator.should_rebalance(self.store_id), 0.0)
    }

    #[instrument(
        skip(self, _now, replica, cfg),
        fields(range_id = %replica.range_id(), store_id = %self.store_id)
    )]
    async fn process(
        &self,
        _now: DateTime<Utc>,
        replica: &Replica,
        cfg: &SystemConfig,
    ) -> Result<(), ReplicationError> {
        let desc = replica.desc();
        let zone = cfg.zone_for_key(&desc.start_key)?;
        let (action, _) = self.allocator.compute_action(&zone, &desc);

        let pool = self.allocator.store_pool();
        let live = pool.live_count(&desc.replicas);
        let quorum = compute_quorum(desc.replicas.len());
        if live < quorum {
            return Err(ReplicationError::QuorumViolation {
                range_id: desc.range_id,
                live,
                quorum,
            });
        }

        debug!(action = %action, replicas = desc.replicas.len(), live, "processing range");

        let requeue = match action {
            AllocatorAction::Add => {
                let constraint = zone.replica_attrs.first().cloned().unwrap_or_default();
                let target = self
                    .allocator
                    .allocate_target(&constraint, &desc.replicas, true, &[])?;
                self.change(replica, &desc, ChangeType::AddReplica, target.as_replica())
                    .await?;
                true
            }
            AllocatorAction::Remove => {
                let target = self.allocator.remove_target(&desc.replicas)?;
                self.check_removal_quorum(&desc, &target)?;
                self.change(replica, &desc, ChangeType::RemoveReplica, target)
                    .await?;
                // This store no longer holds the range.
                target.store_id != self.store_id
            }
            AllocatorAction::RemoveDead => match pool.dead_replicas(&desc.replicas).first() {
                Some(dead) => {
                    let dead = *dead;
                    self.check_removal_quorum(&desc, &dead)?;
                    self.change(replica, &desc, ChangeType::RemoveReplica, dead)
                        .await?;
                    true
                }
                None => {
                    warn!("range classified as having dead replicas, but none were found");
                    false
                }
            },
            AllocatorAction::Noop => {
                let constraint = zone.replica_attrs.first().cloned().unwrap_or_default();
                match self.allocator.rebalance_target(&constraint, &desc.replicas) {
                    Some(target) => {
                        self.change(replica, &desc, ChangeType::AddReplica, target.as_replica())
                            .await?;
                        true
                    }
                    None => {
                        debug!("no rebalance target found");
                        false
                    }
                }
            }
        };

        if requeue {
            self.requeue.requeue(Arc::new(replica.clone()), Utc::now());
        }
        Ok(())
    }
}

/// Build the replicate queue for `store_id`.
pub fn build_replicate_queue(
    store_id: StoreId,
    allocator: Allocator,
    changer: Arc<dyn ReplicaChanger>,
    system_config: Arc<dyn ConfigProvider<SystemConfig>>,
    config: &ReplicationConfig,
    reporter: Option<SelfReporter>,
) -> BaseQueue<ReplicateQueue> {
    let (requeue, requeue_rx) = requeue_channel();
    let mut plugin =
        ReplicateQueue::new(store_id, allocator, changer, requeue, config.timer_interval);
    if let Some(reporter) = reporter {
        plugin = plugin.with_reporter(reporter);
    }
    BaseQueue::new(
        format!("{QUEUE_NAME}-{store_id}"),
        config.queue_max_size,
        plugin,
        system_config,
        requeue_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::RebalancingOptions;
    use crate::consensus::LocalReplicaChanger;
    use crate::gossip::StoreUpdate;
    use crate::replica::RangeState;
    use crate::store_pool::StorePool;
    use crate::types::{Attributes, Lease, Liveness, NodeDescriptor, StoreCapacity, ZoneConfig};
    use rangekeep_id::{NodeId, RangeId};
    use rangekeep_queue::{QueueItem, SplitPolicy};

    fn pool(stores: &[(i32, Liveness)]) -> Arc<StorePool> {
        let pool = StorePool::new(Duration::from_secs(300), Duration::from_secs(1));
        for (id, liveness) in stores {
            pool.apply(StoreUpdate {
                descriptor: StoreDescriptor {
                    store_id: StoreId::new(*id),
                    node: NodeDescriptor {
                        node_id: NodeId::new(*id),
                        attrs: Attributes::default(),
                    },
                    attrs: Attributes::default(),
                    capacity: StoreCapacity {
                        total_bytes: 1000,
                        available_bytes: 1000,
                        range_count: 0,
                    },
                },
                liveness: *liveness,
                observed_at: Utc::now(),
                ttl: Duration::ZERO,
            });
        }
        Arc::new(pool)
    }

    fn plugin(pool: Arc<StorePool>) -> ReplicateQueue {
        let (requeue, _rx) = requeue_channel();
        ReplicateQueue::new(
            StoreId::new(1),
            Allocator::new(
                pool,
                RebalancingOptions {
                    deterministic: true,
                    ..Default::default()
                },
            ),
            Arc::new(LocalReplicaChanger::new()),
            requeue,
            Duration::ZERO,
        )
    }

    fn replica_on(ids: &[i32], start: &[u8], end: &[u8]) -> Replica {
        let desc = ids.iter().fold(
            RangeDescriptor::new(RangeId::new(1), start.to_vec(), end.to_vec()),
            |d, id| d.with_replica(ReplicaDescriptor::new(NodeId::new(*id), StoreId::new(*id))),
        );
        let lease = Lease {
            holder: StoreId::new(1),
            expiration: Utc::now() + chrono::Duration::seconds(60),
        };
        Replica::new(StoreId::new(1), Arc::new(RangeState::new(desc, Some(lease))))
    }

    #[test]
    fn test_capabilities() {
        let q = plugin(pool(&[]));
        assert!(q.needs_leader_lease());
        assert!(!q.accepts_unsplit_ranges());
        assert!(q.timer_interval().is_zero());
    }

    #[test]
    fn test_should_queue_skips_unsplit_range() {
        let q = plugin(pool(&[(1, Liveness::Alive)]));
        let cfg = SystemConfig::with_default_zone(ZoneConfig::with_replication_factor(3))
            .with_zone(b"m".to_vec(), ZoneConfig::with_replication_factor(3));
        let replica = replica_on(&[1], b"a", b"z");

        assert_eq!(q.should_queue(Utc::now(), &replica, &cfg), (false, 0.0));
        assert!(cfg.needs_split(&replica));
    }

    #[test]
    fn test_should_queue_skips_missing_zone() {
        let q = plugin(pool(&[(1, Liveness::Alive)]));
        let replica = replica_on(&[1], b"a", b"b");
        assert_eq!(q.should_queue(Utc::now(), &replica, &SystemConfig::new()), (false, 0.0));
    }

    #[tokio::test]
    async fn test_process_missing_zone_is_policy_error() {
        let q = plugin(pool(&[(1, Liveness::Alive)]));
        let replica = replica_on(&[1], b"a", b"b");
        let err = q
            .process(Utc::now(), &replica, &SystemConfig::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Policy(_)));
    }

    #[test]
    fn test_replica_key_is_range() {
        let replica = replica_on(&[1], b"a", b"b");
        assert_eq!(replica.key(), RangeId::new(1));
    }
}
