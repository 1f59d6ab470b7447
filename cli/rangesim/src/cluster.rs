//! In-process cluster: nodes, stores, gossip, and the scan loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use rangekeep_id::{NodeId, RangeId, StoreId};
use rangekeep_queue::{BaseQueue, SharedConfig};
use rangekeep_storage::types::{
    Attributes, Key, Lease, Liveness, NodeDescriptor, RangeDescriptor, ReplicaDescriptor,
    ZoneConfig,
};
use rangekeep_storage::{
    build_replicate_queue, Allocator, ClusterFeed, LocalGossip, LocalReplicaChanger, RangeState,
    Replica, ReplicateQueue, ReplicationConfig, SelfReporter, StoreDescriber, StorePool,
    StoreUpdate, SystemConfig,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::output::{SimReport, StoreRow};
use crate::store::SimStore;

/// Lease duration for every lease in the simulation.
const SIM_LEASE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// How long to wait for gossip or queues to settle before moving on.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Shape of the simulated cluster.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    pub nodes: u32,
    pub stores_per_node: u32,
    pub ranges: u32,
    pub replication_factor: usize,
    pub kill_store: Option<StoreId>,
    pub kill_after: u32,
    pub max_cycles: u32,
}

impl ClusterSpec {
    fn validate(&self) -> Result<()> {
        if self.nodes == 0 || self.stores_per_node == 0 {
            bail!("cluster needs at least one node with one store");
        }
        if self.ranges == 0 {
            bail!("cluster needs at least one range");
        }
        if self.replication_factor == 0 {
            bail!("replication factor must be at least 1");
        }
        if let Some(store_id) = self.kill_store {
            let total = i64::from(self.nodes) * i64::from(self.stores_per_node);
            if store_id.value() < 1 || i64::from(store_id.value()) > total {
                bail!("store {store_id} does not exist (cluster has {total} stores)");
            }
        }
        Ok(())
    }
}

struct StoreHandle {
    store: Arc<SimStore>,
    queue: BaseQueue<ReplicateQueue>,
}

struct SimNode {
    pool: Arc<StorePool>,
    stores: Vec<StoreHandle>,
}

/// A running simulated cluster.
pub struct Cluster {
    spec: ClusterSpec,
    config: ReplicationConfig,
    gossip: Arc<LocalGossip>,
    changer: Arc<LocalReplicaChanger>,
    ranges: Arc<[Arc<RangeState>]>,
    nodes: Vec<SimNode>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Build the cluster and start every store pool and queue worker.
    pub async fn start(spec: ClusterSpec, config: ReplicationConfig) -> Result<Self> {
        spec.validate()?;

        let gossip = Arc::new(LocalGossip::default());
        let changer = Arc::new(LocalReplicaChanger::new().with_lease_duration(SIM_LEASE_DURATION));
        let system_config = Arc::new(SharedConfig::new(SystemConfig::with_default_zone(
            ZoneConfig::with_replication_factor(spec.replication_factor),
        )));
        let ranges = initial_ranges(spec.ranges);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut nodes = Vec::new();
        let mut tasks = Vec::new();
        for n in 0..spec.nodes {
            let node = NodeDescriptor {
                node_id: NodeId::new(node_number(n)),
                attrs: Attributes::default(),
            };
            let pool = Arc::new(StorePool::new(
                config.time_until_store_dead,
                config.store_sweep_interval,
            ));

            tasks.push(tokio::spawn({
                let pool = Arc::clone(&pool);
                let gossip = Arc::clone(&gossip);
                let shutdown_rx = shutdown_rx.clone();
                async move { pool.run(gossip.as_ref(), shutdown_rx).await }
            }));

            let mut stores = Vec::new();
            for s in 0..spec.stores_per_node {
                let store_id = StoreId::new(node_number(n * spec.stores_per_node + s));
                let store = Arc::new(SimStore::new(store_id, node.clone(), Arc::clone(&ranges)));
                let reporter = SelfReporter::new(
                    gossip.clone(),
                    store.clone(),
                    config.store_ttl,
                );
                let queue = build_replicate_queue(
                    store_id,
                    Allocator::new(Arc::clone(&pool), config.rebalancing),
                    changer.clone(),
                    system_config.clone(),
                    &config,
                    Some(reporter),
                );

                tasks.push(tokio::spawn({
                    let queue = queue.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    async move { queue.run(shutdown_rx).await }
                }));

                stores.push(StoreHandle { store, queue });
            }

            nodes.push(SimNode { pool, stores });
        }

        let cluster = Self {
            spec,
            config,
            gossip,
            changer,
            ranges,
            nodes,
            shutdown_tx,
            tasks,
        };

        let node_count = cluster.nodes.len();
        let gossip = Arc::clone(&cluster.gossip);
        settle("store pools subscribed", move || gossip.subscriber_count() >= node_count).await;

        info!(
            nodes = cluster.spec.nodes,
            stores = cluster.stores().count(),
            ranges = cluster.ranges.len(),
            replication_factor = cluster.spec.replication_factor,
            "Cluster started"
        );

        Ok(cluster)
    }

    /// Run scan cycles until the cluster converges or the cycle budget runs
    /// out.
    pub async fn run(&self) -> SimReport {
        let mut converged = false;
        let mut cycles = 0;

        for cycle in 1..=self.spec.max_cycles {
            cycles = cycle;

            let kill_pending = self.spec.kill_store.is_some() && cycle <= self.spec.kill_after;
            if let Some(store_id) = self.spec.kill_store {
                if cycle == self.spec.kill_after + 1 {
                    self.kill(store_id);
                }
            }

            let before = self.changer.applied();
            self.gossip_stores().await;
            self.scan();
            self.wait_for_idle().await;
            let changes = self.changer.applied() - before;

            info!(cycle, changes, "Cycle complete");

            if changes == 0 && !kill_pending && self.ranges_healthy() {
                converged = true;
                break;
            }
        }

        self.report(cycles, converged)
    }

    /// Stop every background task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
    }

    fn stores(&self) -> impl Iterator<Item = &StoreHandle> {
        self.nodes.iter().flat_map(|n| n.stores.iter())
    }

    fn store(&self, store_id: StoreId) -> Option<&StoreHandle> {
        self.stores().find(|h| h.store.store_id() == store_id)
    }

    /// Publish every live store and wait until every pool has seen it.
    async fn gossip_stores(&self) {
        let mut published = Vec::new();
        for handle in self.stores().filter(|h| h.store.is_alive()) {
            let desc = handle.store.describe();
            if let Err(e) = self.gossip.publish(desc.clone(), self.config.store_ttl) {
                warn!(error = %e, "failed to gossip store");
            }
            published.push(desc);
        }

        let pools: Vec<_> = self.nodes.iter().map(|n| Arc::clone(&n.pool)).collect();
        let dead: Vec<_> = self
            .stores()
            .filter(|h| !h.store.is_alive())
            .map(|h| h.store.store_id())
            .collect();
        settle("gossip propagated", move || {
            pools.iter().all(|pool| {
                published
                    .iter()
                    .all(|d| pool.store_descriptor(d.store_id).as_ref() == Some(d))
                    && dead.iter().all(|id| pool.liveness(*id) == Liveness::Dead)
            })
        })
        .await;
    }

    /// Offer every replica of every range to its store's queue.
    fn scan(&self) {
        let now = Utc::now();
        for range in self.ranges.iter() {
            let desc = range.desc();
            for replica in &desc.replicas {
                let Some(handle) = self.store(replica.store_id) else {
                    continue;
                };
                if !handle.store.is_alive() {
                    continue;
                }
                handle
                    .queue
                    .maybe_add(Arc::new(Replica::new(replica.store_id, Arc::clone(range))), now);
            }
        }
    }

    async fn wait_for_idle(&self) {
        let queues: Vec<_> = self.stores().map(|h| h.queue.clone()).collect();
        settle("queues idle", move || queues.iter().all(BaseQueue::is_idle)).await;
    }

    /// Mark `store_id` dead and move its leases to a surviving replica.
    fn kill(&self, store_id: StoreId) {
        let Some(handle) = self.store(store_id) else {
            return;
        };
        handle.store.kill();
        if !self.gossip.declare_dead(store_id) {
            let update = StoreUpdate {
                descriptor: handle.store.describe(),
                liveness: Liveness::Dead,
                observed_at: Utc::now(),
                ttl: Duration::ZERO,
            };
            if let Err(e) = self.gossip.announce(update) {
                warn!(store_id = %store_id, error = %e, "failed to announce dead store");
            }
        }

        let now = Utc::now();
        let mut moved = 0;
        for range in self.ranges.iter() {
            if !range.lease().is_some_and(|l| l.holder == store_id) {
                continue;
            }
            let desc = range.desc();
            let successor = desc.replicas.iter().find(|r| {
                r.store_id != store_id && self.store(r.store_id).is_some_and(|h| h.store.is_alive())
            });
            range.set_lease(successor.map(|r| Lease {
                holder: r.store_id,
                expiration: now + chrono::Duration::hours(24),
            }));
            moved += 1;
        }

        warn!(store_id = %store_id, leases_moved = moved, "Store killed");
    }

    fn ranges_healthy(&self) -> bool {
        let (under, over, dead) = self.replication_counts();
        under == 0 && over == 0 && dead == 0
    }

    /// Ranges that are under-replicated, over-replicated, or hold a replica
    /// on a dead store.
    fn replication_counts(&self) -> (usize, usize, usize) {
        let factor = self.spec.replication_factor;
        let mut under = 0;
        let mut over = 0;
        let mut dead = 0;
        for range in self.ranges.iter() {
            let desc = range.desc();
            match desc.replicas.len().cmp(&factor) {
                std::cmp::Ordering::Less => under += 1,
                std::cmp::Ordering::Greater => over += 1,
                std::cmp::Ordering::Equal => {}
            }
            if desc
                .replicas
                .iter()
                .any(|r| !self.store(r.store_id).is_some_and(|h| h.store.is_alive()))
            {
                dead += 1;
            }
        }
        (under, over, dead)
    }

    fn report(&self, cycles: u32, converged: bool) -> SimReport {
        let (under_replicated, over_replicated, with_dead_replicas) = self.replication_counts();

        // Liveness as gossiped to the first node.
        let gossiped: HashMap<StoreId, Liveness> = self
            .nodes
            .first()
            .map(|n| n.pool.all_stores())
            .unwrap_or_default()
            .into_iter()
            .map(|d| (d.descriptor.store_id, d.liveness))
            .collect();

        let stores = self
            .stores()
            .map(|h| {
                let capacity = h.store.capacity();
                let stats = h.queue.stats();
                debug!(store_id = %h.store.store_id(), ?stats, "queue stats");
                StoreRow {
                    store: h.store.store_id().value(),
                    node: h.store.node().node_id.value(),
                    status: gossiped
                        .get(&h.store.store_id())
                        .copied()
                        .unwrap_or(Liveness::Unknown),
                    replicas: h.store.replica_count(),
                    leases: h.store.lease_count(),
                    available_pct: 100.0 * capacity.available_bytes as f64
                        / capacity.total_bytes as f64,
                    processed: stats.processed,
                    failed: stats.failed,
                }
            })
            .collect();

        SimReport {
            cycles,
            converged,
            changes: self.changer.applied(),
            ranges: self.ranges.len(),
            under_replicated,
            over_replicated,
            with_dead_replicas,
            stores,
        }
    }
}

fn node_number(index: u32) -> i32 {
    i32::try_from(index).unwrap_or(i32::MAX - 1) + 1
}

/// Split the key space into `count` ranges, each with one replica on the
/// first store, which also holds the lease.
fn initial_ranges(count: u32) -> Arc<[Arc<RangeState>]> {
    let first = ReplicaDescriptor::new(NodeId::new(1), StoreId::new(1));
    let expiration = Utc::now() + chrono::Duration::hours(24);

    (0..count)
        .map(|i| {
            let start: Key = if i == 0 { Vec::new() } else { range_key(i) };
            let end: Key = if i + 1 == count {
                vec![0xff]
            } else {
                range_key(i + 1)
            };
            let desc = RangeDescriptor::new(RangeId::new(i64::from(i) + 1), start, end)
                .with_replica(first);
            Arc::new(RangeState::new(
                desc,
                Some(Lease {
                    holder: first.store_id,
                    expiration,
                }),
            ))
        })
        .collect()
}

fn range_key(i: u32) -> Key {
    format!("k{i:08}").into_bytes()
}

/// Poll `done` until it holds, giving up after [`SETTLE_TIMEOUT`].
async fn settle<F>(what: &str, done: F)
where
    F: Fn() -> bool,
{
    let result = tokio::time::timeout(SETTLE_TIMEOUT, async {
        while !done() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    if result.is_err() {
        warn!(waiting_for = what, "timed out, continuing");
    }
}
