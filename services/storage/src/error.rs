//! Error types for replica placement.

use rangekeep_id::{RangeId, StoreId};
use thiserror::Error;

use crate::types::Attributes;

/// The allocator could not find a store to act on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    #[error("no suitable store for constraint {constraint} ({candidates} alive stores considered)")]
    NoSuitableStore {
        constraint: Attributes,
        candidates: usize,
    },

    #[error("no removable replica in an empty replica set")]
    NoRemovableReplica,
}

/// Zone lookup failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("no zone config covers key {key:?}")]
    NoZoneForKey { key: Vec<u8> },
}

/// A membership change was refused by the consensus layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeError {
    #[error("descriptor for range {range_id} changed concurrently")]
    StaleDescriptor { range_id: RangeId },

    #[error("change to range {range_id} rejected: {reason}")]
    Rejected { range_id: RangeId, reason: String },
}

/// Publishing to the cluster feed failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("no subscribers for update from store {store_id}")]
    NoSubscribers { store_id: StoreId },
}

/// Errors from processing a range in the replication queue.
///
/// None of these stop the queue worker; the range is retried when it is next
/// offered.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("range {range_id} lacks a quorum of live replicas ({live} live, {quorum} needed)")]
    QuorumViolation {
        range_id: RangeId,
        live: usize,
        quorum: usize,
    },

    #[error("Allocator error: {0}")]
    Allocator(#[from] AllocatorError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("descriptor for range {range_id} is stale")]
    StaleDescriptor { range_id: RangeId },

    #[error("change to range {range_id} rejected: {reason}")]
    ChangeRejected { range_id: RangeId, reason: String },
}

impl From<ChangeError> for ReplicationError {
    fn from(err: ChangeError) -> Self {
        match err {
            ChangeError::StaleDescriptor { range_id } => Self::StaleDescriptor { range_id },
            ChangeError::Rejected { range_id, reason } => Self::ChangeRejected { range_id, reason },
        }
    }
}

impl ReplicationError {
    /// True if the range lacked a live quorum.
    pub fn is_quorum_violation(&self) -> bool {
        matches!(self, Self::QuorumViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_error_maps_staleness() {
        let err: ReplicationError = ChangeError::StaleDescriptor {
            range_id: RangeId::new(7),
        }
        .into();
        assert!(matches!(
            err,
            ReplicationError::StaleDescriptor { range_id } if range_id == RangeId::new(7)
        ));
    }

    #[test]
    fn test_error_messages() {
        let err = ReplicationError::QuorumViolation {
            range_id: RangeId::new(3),
            live: 1,
            quorum: 2,
        };
        assert!(err.is_quorum_violation());
        assert_eq!(
            err.to_string(),
            "range r3 lacks a quorum of live replicas (1 live, 2 needed)"
        );

        let err: ReplicationError = AllocatorError::NoRemovableReplica.into();
        assert!(err.to_string().starts_with("Allocator error"));
    }
}
