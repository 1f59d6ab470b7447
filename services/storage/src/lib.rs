//! rangekeep replica placement
//!
//! Keeps every range at its desired replica count and spreads replicas
//! across stores. Each store runs a replicate queue over the ranges whose
//! lease it holds; the queue consults the allocator, which reads a
//! gossip-fed store pool, and submits one membership change at a time.
//!
//! ```text
//! ClusterFeed ──► StorePool ──► Allocator ──► ReplicateQueue ──► ReplicaChanger
//!                                                   ▲
//!                                   scanner ────────┘ (maybe_add)
//! ```
//!
//! ## Modules
//!
//! - `types`: range, store, zone, and lease data model
//! - `gossip`: cluster-state feed and the in-process `LocalGossip`
//! - `store_pool`: per-node store capacity and liveness view
//! - `allocator`: placement decisions
//! - `system_config`: zone lookup and split boundaries
//! - `replica`: shared range state and the per-store replica handle
//! - `consensus`: membership-change contract and `LocalReplicaChanger`
//! - `replicate_queue`: the queue plug-in

pub mod allocator;
pub mod config;
pub mod consensus;
pub mod error;
pub mod gossip;
pub mod replica;
pub mod replicate_queue;
pub mod store_pool;
pub mod system_config;
pub mod types;

pub use allocator::{compute_quorum, Allocator, AllocatorAction, RebalancingOptions};
pub use config::ReplicationConfig;
pub use consensus::{LocalReplicaChanger, ReplicaChanger};
pub use error::{AllocatorError, ChangeError, FeedError, PolicyError, ReplicationError};
pub use gossip::{ClusterFeed, LocalGossip, StoreUpdate};
pub use replica::{RangeState, Replica};
pub use replicate_queue::{build_replicate_queue, ReplicateQueue, SelfReporter, StoreDescriber};
pub use store_pool::{CapacityStats, StorePool, StoreDetail};
pub use system_config::SystemConfig;
