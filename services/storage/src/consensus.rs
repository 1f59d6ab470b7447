//! Membership-change contract and an in-process implementation.
//!
//! The consensus layer owns range descriptors and leases. The replication
//! queue only submits a change together with the descriptor it based the
//! decision on; a concurrent change makes that descriptor stale and the
//! request fails.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::error::ChangeError;
use crate::replica::RangeState;
use crate::types::{ChangeRequest, ChangeType, Lease, RangeDescriptor};

/// Default lease duration granted on transfer.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(9);

/// Applies membership changes to a range.
#[async_trait]
pub trait ReplicaChanger: Send + Sync {
    /// Apply `request` if `current` still matches the range's descriptor.
    ///
    /// Returns the new descriptor.
    async fn change_replicas(
        &self,
        range: &RangeState,
        request: &ChangeRequest,
        current: &RangeDescriptor,
    ) -> Result<RangeDescriptor, ChangeError>;
}

/// Applies changes directly to the shared [`RangeState`].
///
/// Changes across all ranges are serialized so the staleness check and the
/// update are atomic. When the lease holder's replica is removed the lease
/// moves to the first remaining replica.
pub struct LocalReplicaChanger {
    apply_lock: Mutex<()>,
    lease_duration: Duration,
    latency: Duration,
    reject_remaining: AtomicU32,
    applied: AtomicU64,
}

impl LocalReplicaChanger {
    pub fn new() -> Self {
        Self {
            apply_lock: Mutex::new(()),
            lease_duration: DEFAULT_LEASE_DURATION,
            latency: Duration::ZERO,
            reject_remaining: AtomicU32::new(0),
            applied: AtomicU64::new(0),
        }
    }

    /// Lease duration granted when the lease moves.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Simulated round trip before each change is applied.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Reject the next `count` requests.
    pub fn reject_next(&self, count: u32) {
        self.reject_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of changes applied so far.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    fn take_rejection(&self) -> bool {
        self.reject_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for LocalReplicaChanger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicaChanger for LocalReplicaChanger {
    async fn change_replicas(
        &self,
        range: &RangeState,
        request: &ChangeRequest,
        current: &RangeDescriptor,
    ) -> Result<RangeDescriptor, ChangeError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let range_id = range.range_id();
        if self.take_rejection() {
            return Err(ChangeError::Rejected {
                range_id,
                reason: "injected failure".to_string(),
            });
        }

        let _guard = self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let desc = range.desc();
        if *desc != *current {
            return Err(ChangeError::StaleDescriptor { range_id });
        }

        let target = request.target;
        let mut next = desc.as_ref().clone();
        match request.change_type {
            ChangeType::AddReplica => {
                if next.has_store(target.store_id) {
                    return Err(ChangeError::Rejected {
                        range_id,
                        reason: format!("store {} already holds a replica", target.store_id),
                    });
                }
                next.replicas.push(target);
            }
            ChangeType::RemoveReplica => {
                let before = next.replicas.len();
                next.replicas.retain(|r| r.store_id != target.store_id);
                if next.replicas.len() == before {
                    return Err(ChangeError::Rejected {
                        range_id,
                        reason: format!("store {} holds no replica", target.store_id),
                    });
                }
            }
        }

        if request.change_type == ChangeType::RemoveReplica {
            let lost_holder = range
                .lease()
                .is_none_or(|lease| lease.holder == target.store_id);
            if lost_holder {
                let lease = next.replicas.first().map(|r| Lease {
                    holder: r.store_id,
                    expiration: Utc::now()
                        + chrono::Duration::from_std(self.lease_duration)
                            .unwrap_or(chrono::Duration::seconds(9)),
                });
                debug!(
                    range_id = %range_id,
                    holder = ?lease.map(|l| l.holder),
                    "lease transferred"
                );
                range.set_lease(lease);
            }
        }

        range.set_desc(next.clone());
        self.applied.fetch_add(1, Ordering::SeqCst);

        info!(
            change_id = %request.id,
            range_id = %range_id,
            change = %request.change_type,
            target = %target,
            replicas = next.replicas.len(),
            "membership change applied"
        );

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplicaDescriptor;
    use rangekeep_id::{NodeId, RangeId, StoreId};

    fn replica(id: i32) -> ReplicaDescriptor {
        ReplicaDescriptor::new(NodeId::new(id), StoreId::new(id))
    }

    fn range(ids: &[i32], holder: i32) -> RangeState {
        let desc = ids.iter().fold(
            RangeDescriptor::new(RangeId::new(1), b"a".to_vec(), b"z".to_vec()),
            |d, id| d.with_replica(replica(*id)),
        );
        RangeState::new(
            desc,
            Some(Lease {
                holder: StoreId::new(holder),
                expiration: Utc::now() + chrono::Duration::seconds(60),
            }),
        )
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let changer = LocalReplicaChanger::new();
        let state = range(&[1, 2], 1);

        let desc = state.desc();
        let added = changer
            .change_replicas(&state, &ChangeRequest::new(ChangeType::AddReplica, replica(3)), &desc)
            .await
            .unwrap();
        assert_eq!(added.replicas, vec![replica(1), replica(2), replica(3)]);

        let desc = state.desc();
        let removed = changer
            .change_replicas(
                &state,
                &ChangeRequest::new(ChangeType::RemoveReplica, replica(2)),
                &desc,
            )
            .await
            .unwrap();
        assert_eq!(removed.replicas, vec![replica(1), replica(3)]);
        assert_eq!(state.lease().map(|l| l.holder), Some(StoreId::new(1)));
        assert_eq!(changer.applied(), 2);
    }

    #[tokio::test]
    async fn test_stale_descriptor() {
        let changer = LocalReplicaChanger::new();
        let state = range(&[1, 2], 1);
        let stale = state.desc().as_ref().clone().with_replica(replica(9));

        let err = changer
            .change_replicas(
                &state,
                &ChangeRequest::new(ChangeType::AddReplica, replica(3)),
                &stale,
            )
            .await
            .unwrap_err();
        assert_eq!(err, ChangeError::StaleDescriptor { range_id: RangeId::new(1) });
        assert_eq!(state.desc().replicas.len(), 2);
    }

    #[tokio::test]
    async fn test_removing_holder_moves_lease() {
        let changer = LocalReplicaChanger::new();
        let state = range(&[1, 2, 3], 1);
        let desc = state.desc();

        changer
            .change_replicas(
                &state,
                &ChangeRequest::new(ChangeType::RemoveReplica, replica(1)),
                &desc,
            )
            .await
            .unwrap();
        assert_eq!(state.lease().map(|l| l.holder), Some(StoreId::new(2)));
    }

    #[tokio::test]
    async fn test_injected_rejection() {
        let changer = LocalReplicaChanger::new();
        changer.reject_next(1);
        let state = range(&[1], 1);
        let desc = state.desc();
        let request = ChangeRequest::new(ChangeType::AddReplica, replica(2));

        assert!(matches!(
            changer.change_replicas(&state, &request, &desc).await,
            Err(ChangeError::Rejected { .. })
        ));
        assert!(changer.change_replicas(&state, &request, &desc).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let changer = LocalReplicaChanger::new();
        let state = range(&[1, 2], 1);
        let desc = state.desc();

        let err = changer
            .change_replicas(&state, &ChangeRequest::new(ChangeType::AddReplica, replica(2)), &desc)
            .await
            .unwrap_err();
        assert!(matches!(err, ChangeError::Rejected { .. }));
    }
}
