//! Maintenance queue primitives.
//!
//! This library provides the generic engine behind per-range maintenance
//! loops such as replica-count repair. Key concepts:
//!
//! - **Admission**: callers offer items with `maybe_add`; the plug-in's
//!   predicate decides whether and at what priority they are queued.
//! - **Drain**: a single worker pops the highest-priority entry and hands it
//!   to the plug-in's handler.
//! - **Re-offer**: the handler re-offers an item through the [`Requeue`]
//!   handle when more work may follow.
//!
//! # Invariants
//!
//! - At most one entry per item identity; re-adding replaces the priority
//! - The queue never holds more than `max_size` entries
//! - `process` never runs concurrently with itself on one queue

mod engine;
mod priority;

pub use engine::{
    requeue_channel, BaseQueue, ConfigProvider, QueueImpl, QueueItem, QueueStats, Requeue,
    RequeueReceiver, SharedConfig, SplitPolicy,
};
pub use priority::{Entry, IndexedPriorityQueue, Priority, Upsert};

/// Default bound on queued entries.
pub const DEFAULT_MAX_SIZE: usize = 100;
