//! Simulated stores.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rangekeep_id::StoreId;
use rangekeep_storage::types::{Attributes, NodeDescriptor, StoreCapacity, StoreDescriptor};
use rangekeep_storage::{RangeState, StoreDescriber};

/// Bytes each replica occupies.
pub const BYTES_PER_RANGE: i64 = 64 << 20; // 64 MiB

/// Disk size of every store.
pub const CAPACITY_PER_STORE: i64 = 1 << 40; // 1 TiB

/// A store whose capacity is derived from the replicas it hosts.
pub struct SimStore {
    store_id: StoreId,
    node: NodeDescriptor,
    ranges: Arc<[Arc<RangeState>]>,
    alive: AtomicBool,
}

impl SimStore {
    pub fn new(store_id: StoreId, node: NodeDescriptor, ranges: Arc<[Arc<RangeState>]>) -> Self {
        Self {
            store_id,
            node,
            ranges,
            alive: AtomicBool::new(true),
        }
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Ranges with a replica on this store.
    pub fn replica_count(&self) -> usize {
        self.ranges
            .iter()
            .filter(|r| r.desc().has_store(self.store_id))
            .count()
    }

    /// Ranges whose lease this store holds.
    pub fn lease_count(&self) -> usize {
        let now = Utc::now();
        self.ranges
            .iter()
            .filter(|r| r.lease().is_some_and(|l| l.is_held_by(self.store_id, now)))
            .count()
    }

    pub fn capacity(&self) -> StoreCapacity {
        let count = self.replica_count() as i64;
        StoreCapacity {
            total_bytes: CAPACITY_PER_STORE,
            available_bytes: CAPACITY_PER_STORE - count * BYTES_PER_RANGE,
            range_count: i32::try_from(count).unwrap_or(i32::MAX),
        }
    }
}

impl StoreDescriber for SimStore {
    fn describe(&self) -> StoreDescriptor {
        StoreDescriptor {
            store_id: self.store_id,
            node: self.node.clone(),
            attrs: Attributes::default(),
            capacity: self.capacity(),
        }
    }
}
