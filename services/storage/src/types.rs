//! Data model shared by the store pool, allocator, and replication queue.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rangekeep_id::{ChangeId, NodeId, RangeId, StoreId};
use serde::{Deserialize, Serialize};

/// A key in the ordered key space.
pub type Key = Vec<u8>;

// =============================================================================
// Attributes
// =============================================================================

/// A set of free-form attributes such as `ssd` or `us-east`.
///
/// Used both to describe nodes and stores and, in a zone config, as the
/// constraint a replica's store must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeSet<String>);

impl Attributes {
    /// Create an attribute set.
    pub fn new<I, S>(attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(attrs.into_iter().map(Into::into).collect())
    }

    /// True if every attribute in `self` is present in `other`.
    pub fn is_subset_of(&self, other: &Attributes) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Union of two attribute sets.
    pub fn union(&self, other: &Attributes) -> Attributes {
        Attributes(self.0.union(&other.0).cloned().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, attr) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{attr}")?;
        }
        write!(f, "]")
    }
}

// =============================================================================
// Ranges
// =============================================================================

/// One store's copy of a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub node_id: NodeId,
    pub store_id: StoreId,
}

impl ReplicaDescriptor {
    pub fn new(node_id: NodeId, store_id: StoreId) -> Self {
        Self { node_id, store_id }
    }
}

impl fmt::Display for ReplicaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.store_id)
    }
}

/// Membership and key span of a range.
///
/// The range covers `[start_key, end_key)`. Replica order is insertion
/// order; at most one replica per store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Key,
    pub end_key: Key,
    pub replicas: Vec<ReplicaDescriptor>,
}

impl RangeDescriptor {
    /// Create a descriptor with no replicas.
    pub fn new(range_id: RangeId, start_key: impl Into<Key>, end_key: impl Into<Key>) -> Self {
        Self {
            range_id,
            start_key: start_key.into(),
            end_key: end_key.into(),
            replicas: Vec::new(),
        }
    }

    /// Builder-style helper adding a replica.
    pub fn with_replica(mut self, replica: ReplicaDescriptor) -> Self {
        if !self.has_store(replica.store_id) {
            self.replicas.push(replica);
        }
        self
    }

    /// True if `store_id` hosts a replica of this range.
    pub fn has_store(&self, store_id: StoreId) -> bool {
        self.replicas.iter().any(|r| r.store_id == store_id)
    }

    /// The replica on `store_id`, if any.
    pub fn replica_on(&self, store_id: StoreId) -> Option<&ReplicaDescriptor> {
        self.replicas.iter().find(|r| r.store_id == store_id)
    }

    /// True if `key` falls inside the range.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && key < self.end_key.as_slice()
    }
}

// =============================================================================
// Zones
// =============================================================================

/// Replication policy for a key span.
///
/// Each entry in `replica_attrs` is the constraint for one replica slot; the
/// number of slots is the desired replication factor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub replica_attrs: Vec<Attributes>,
}

impl ZoneConfig {
    /// A zone of `factor` unconstrained replicas.
    pub fn with_replication_factor(factor: usize) -> Self {
        Self {
            replica_attrs: vec![Attributes::default(); factor],
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.replica_attrs.len()
    }
}

// =============================================================================
// Stores
// =============================================================================

/// A node and its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    #[serde(default)]
    pub attrs: Attributes,
}

/// Disk usage of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapacity {
    pub total_bytes: i64,
    pub available_bytes: i64,
    pub range_count: i32,
}

impl StoreCapacity {
    /// Fraction of the disk in use. A store reporting no capacity is full.
    pub fn fraction_used(&self) -> f64 {
        if self.total_bytes <= 0 {
            return 1.0;
        }
        1.0 - (self.available_bytes as f64 / self.total_bytes as f64)
    }
}

/// What a store advertises about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub store_id: StoreId,
    pub node: NodeDescriptor,
    #[serde(default)]
    pub attrs: Attributes,
    pub capacity: StoreCapacity,
}

impl StoreDescriptor {
    /// Node and store attributes combined, as matched against constraints.
    pub fn combined_attrs(&self) -> Attributes {
        self.node.attrs.union(&self.attrs)
    }

    /// This store as a replica location.
    pub fn as_replica(&self) -> ReplicaDescriptor {
        ReplicaDescriptor::new(self.node.node_id, self.store_id)
    }
}

/// Liveness of a store as seen by the local store pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Dead,
    Unknown,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Alive => write!(f, "alive"),
            Liveness::Dead => write!(f, "dead"),
            Liveness::Unknown => write!(f, "unknown"),
        }
    }
}

// =============================================================================
// Leases and Changes
// =============================================================================

/// Exclusive right of one store to drive decisions for a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: StoreId,
    pub expiration: DateTime<Utc>,
}

impl Lease {
    /// True if `store_id` holds this lease at `now`.
    pub fn is_held_by(&self, store_id: StoreId, now: DateTime<Utc>) -> bool {
        self.holder == store_id && now < self.expiration
    }
}

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    AddReplica,
    RemoveReplica,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::AddReplica => write!(f, "add_replica"),
            ChangeType::RemoveReplica => write!(f, "remove_replica"),
        }
    }
}

/// A single membership change submitted to the consensus layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: ChangeId,
    pub change_type: ChangeType,
    pub target: ReplicaDescriptor,
}

impl ChangeRequest {
    pub fn new(change_type: ChangeType, target: ReplicaDescriptor) -> Self {
        Self {
            id: ChangeId::new(),
            change_type,
            target,
        }
    }
}
