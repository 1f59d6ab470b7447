//! Local replica handles.
//!
//! [`RangeState`] is the shared, consensus-owned state of one range: its
//! current descriptor and lease. Every store hosting the range sees the same
//! `RangeState`; a [`Replica`] pairs it with the local store and is what the
//! replication queue holds.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rangekeep_id::{RangeId, StoreId};
use rangekeep_queue::QueueItem;

use crate::types::{Lease, RangeDescriptor};

/// Descriptor and lease of a range.
#[derive(Debug)]
pub struct RangeState {
    range_id: RangeId,
    desc: ArcSwap<RangeDescriptor>,
    lease: ArcSwap<Option<Lease>>,
}

impl RangeState {
    pub fn new(desc: RangeDescriptor, lease: Option<Lease>) -> Self {
        Self {
            range_id: desc.range_id,
            desc: ArcSwap::from_pointee(desc),
            lease: ArcSwap::from_pointee(lease),
        }
    }

    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    /// Current descriptor snapshot.
    pub fn desc(&self) -> Arc<RangeDescriptor> {
        self.desc.load_full()
    }

    pub fn set_desc(&self, desc: RangeDescriptor) {
        self.desc.store(Arc::new(desc));
    }

    /// Current lease, if any.
    pub fn lease(&self) -> Option<Lease> {
        **self.lease.load()
    }

    pub fn set_lease(&self, lease: Option<Lease>) {
        self.lease.store(Arc::new(lease));
    }
}

/// A range as seen from one store.
#[derive(Clone)]
pub struct Replica {
    store_id: StoreId,
    range: Arc<RangeState>,
}

impl Replica {
    pub fn new(store_id: StoreId, range: Arc<RangeState>) -> Self {
        Self { store_id, range }
    }

    /// The local store.
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn range_id(&self) -> RangeId {
        self.range.range_id()
    }

    pub fn range(&self) -> &Arc<RangeState> {
        &self.range
    }

    pub fn desc(&self) -> Arc<RangeDescriptor> {
        self.range.desc()
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("store_id", &self.store_id)
            .field("range_id", &self.range.range_id())
            .finish()
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.range.range_id(), self.store_id)
    }
}

impl QueueItem for Replica {
    type Key = RangeId;

    fn key(&self) -> RangeId {
        self.range.range_id()
    }

    fn holds_lease(&self, now: DateTime<Utc>) -> bool {
        self.range
            .lease()
            .is_some_and(|lease| lease.is_held_by(self.store_id, now))
    }
}
