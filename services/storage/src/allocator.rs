//! Placement decisions.
//!
//! The allocator is pure decision logic over a store-pool snapshot: it
//! classifies a range (add, remove, remove dead, nothing) and picks the store
//! to act on. It never issues changes itself.

use std::cmp::{Ordering, Reverse};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use rand::Rng;
use rangekeep_id::StoreId;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::AllocatorError;
use crate::store_pool::StorePool;
use crate::types::{
    Attributes, Liveness, RangeDescriptor, ReplicaDescriptor, StoreDescriptor, ZoneConfig,
};

/// Priority floor for ranges with dead replicas. Always above any add or
/// remove priority.
pub const REMOVE_DEAD_PRIORITY_BASE: f64 = 10_000.0;

/// Stores above this fraction of used disk receive no new replicas.
pub const MAX_FRACTION_USED: f64 = 0.95;

/// Default tolerated deviation from the mean range count.
pub const DEFAULT_REBALANCE_THRESHOLD: f64 = 0.05;

/// Minimum number of live replicas for a group of `replicas` to make
/// progress.
pub fn compute_quorum(replicas: usize) -> usize {
    replicas / 2 + 1
}

/// What a range needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocatorAction {
    Noop,
    Add,
    Remove,
    RemoveDead,
}

impl fmt::Display for AllocatorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorAction::Noop => write!(f, "noop"),
            AllocatorAction::Add => write!(f, "add"),
            AllocatorAction::Remove => write!(f, "remove"),
            AllocatorAction::RemoveDead => write!(f, "remove_dead"),
        }
    }
}

/// Knobs for load-based rebalancing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RebalancingOptions {
    /// Allow moving replicas when no replica-count repair is needed.
    pub allow_rebalance: bool,

    /// Always pick the best candidate. Otherwise pick randomly between the
    /// two best, spreading concurrent allocators across targets.
    pub deterministic: bool,

    /// Fraction of the mean range count a store may deviate before it is
    /// considered over- or under-full.
    pub threshold: f64,
}

impl Default for RebalancingOptions {
    fn default() -> Self {
        Self {
            allow_rebalance: true,
            deterministic: false,
            threshold: DEFAULT_REBALANCE_THRESHOLD,
        }
    }
}

/// Placement decisions over a store pool.
#[derive(Clone)]
pub struct Allocator {
    store_pool: Arc<StorePool>,
    options: RebalancingOptions,
}

impl Allocator {
    pub fn new(store_pool: Arc<StorePool>, options: RebalancingOptions) -> Self {
        Self {
            store_pool,
            options,
        }
    }

    pub fn store_pool(&self) -> &Arc<StorePool> {
        &self.store_pool
    }

    pub fn options(&self) -> &RebalancingOptions {
        &self.options
    }

    /// Classify a range and give its queue priority.
    ///
    /// Dead replicas are removed first, but only while the survivors still
    /// form a quorum; then missing replicas are added; then surplus ones
    /// removed.
    pub fn compute_action(
        &self,
        zone: &ZoneConfig,
        desc: &RangeDescriptor,
    ) -> (AllocatorAction, f64) {
        let have = desc.replicas.len();
        let need = zone.replication_factor();

        let dead = self.store_pool.dead_replicas(&desc.replicas).len();
        let live = self.store_pool.live_count(&desc.replicas);
        if dead > 0 && live >= compute_quorum(have) {
            return (
                AllocatorAction::RemoveDead,
                REMOVE_DEAD_PRIORITY_BASE + dead as f64,
            );
        }

        match have.cmp(&need) {
            Ordering::Less => (AllocatorAction::Add, (need - have) as f64),
            Ordering::Greater => (AllocatorAction::Remove, (have - need) as f64),
            Ordering::Equal => (AllocatorAction::Noop, 0.0),
        }
    }

    /// Pick a store for a new replica.
    ///
    /// With `require_diversity`, stores on nodes already hosting a replica are
    /// skipped; without it they are only ranked after node-diverse stores.
    pub fn allocate_target(
        &self,
        constraint: &Attributes,
        existing: &[ReplicaDescriptor],
        require_diversity: bool,
        exclude: &[StoreId],
    ) -> Result<StoreDescriptor, AllocatorError> {
        let alive = self.store_pool.alive_stores();
        let considered = alive.len();
        let candidates = rank_candidates(alive, constraint, existing, require_diversity, exclude);

        self.pick(candidates)
            .ok_or_else(|| AllocatorError::NoSuitableStore {
                constraint: constraint.clone(),
                candidates: considered,
            })
    }

    /// Pick the replica to drop from an over-replicated range: the one on the
    /// most loaded store.
    pub fn remove_target(
        &self,
        replicas: &[ReplicaDescriptor],
    ) -> Result<ReplicaDescriptor, AllocatorError> {
        replicas
            .iter()
            .map(|r| (self.load(r.store_id), r))
            .max_by(|(a, ra), (b, rb)| {
                a.0.total_cmp(&b.0)
                    .then(a.1.cmp(&b.1))
                    .then(ra.store_id.cmp(&rb.store_id))
            })
            .map(|(_, r)| *r)
            .ok_or(AllocatorError::NoRemovableReplica)
    }

    /// True if `store_id` holds noticeably more ranges than the cluster mean.
    pub fn should_rebalance(&self, store_id: StoreId) -> bool {
        if !self.options.allow_rebalance {
            return false;
        }
        let Some(detail) = self.store_pool.store_detail(store_id) else {
            return false;
        };
        if detail.liveness != Liveness::Alive {
            return false;
        }

        let mean = self.store_pool.capacity_stats().mean_range_count;
        let count = f64::from(detail.descriptor.capacity.range_count);
        let over = count > mean * (1.0 + self.options.threshold) && count - mean >= 1.0;
        trace!(store_id = %store_id, count, mean, over, "rebalance check");
        over
    }

    /// Pick an underfull store to receive an extra replica, if any would
    /// improve balance.
    pub fn rebalance_target(
        &self,
        constraint: &Attributes,
        existing: &[ReplicaDescriptor],
    ) -> Option<StoreDescriptor> {
        if !self.options.allow_rebalance {
            return None;
        }

        let mean = self.store_pool.capacity_stats().mean_range_count;
        let ceiling = mean * (1.0 - self.options.threshold);
        let candidates: Vec<_> = rank_candidates(
            self.store_pool.alive_stores(),
            constraint,
            existing,
            false,
            &[],
        )
        .into_iter()
        .filter(|c| {
            let count = f64::from(c.store.capacity.range_count);
            count < ceiling && mean - count >= 1.0
        })
        .collect();

        self.pick(candidates)
    }

    /// Load of a store as (fraction used, range count). Stores missing from
    /// the pool count as full.
    fn load(&self, store_id: StoreId) -> (f64, i32) {
        match self.store_pool.store_descriptor(store_id) {
            Some(desc) => (desc.capacity.fraction_used(), desc.capacity.range_count),
            None => (1.0, i32::MAX),
        }
    }

    fn pick(&self, mut candidates: Vec<Candidate>) -> Option<StoreDescriptor> {
        if candidates.is_empty() {
            return None;
        }
        let mut index = 0;
        if !self.options.deterministic
            && candidates.len() > 1
            && candidates[0].diverse == candidates[1].diverse
            && rand::rng().random_bool(0.5)
        {
            index = 1;
        }
        Some(candidates.swap_remove(index).store)
    }
}

struct Candidate {
    store: StoreDescriptor,
    diverse: bool,
}

/// Filter alive stores down to valid targets and order them best first.
fn rank_candidates(
    alive: Vec<StoreDescriptor>,
    constraint: &Attributes,
    existing: &[ReplicaDescriptor],
    require_diversity: bool,
    exclude: &[StoreId],
) -> Vec<Candidate> {
    let used_nodes: HashSet<_> = existing.iter().map(|r| r.node_id).collect();
    let used_stores: HashSet<_> = existing.iter().map(|r| r.store_id).collect();

    let mut candidates: Vec<_> = alive
        .into_iter()
        .filter(|s| !used_stores.contains(&s.store_id) && !exclude.contains(&s.store_id))
        .filter(|s| constraint.is_subset_of(&s.combined_attrs()))
        .filter(|s| s.capacity.fraction_used() < MAX_FRACTION_USED)
        .map(|s| Candidate {
            diverse: !used_nodes.contains(&s.node.node_id),
            store: s,
        })
        .filter(|c| c.diverse || !require_diversity)
        .collect();

    candidates.sort_by_key(|c| {
        (
            !c.diverse,
            Reverse(c.store.capacity.available_bytes),
            c.store.capacity.range_count,
            c.store.store_id,
        )
    });
    candidates
}
