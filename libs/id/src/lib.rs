//! # rangekeep-id
//!
//! Typed identifiers for the rangekeep replica-placement loop.
//!
//! ## Design Principles
//!
//! - Cluster-assigned identities (nodes, stores, ranges) are small integers,
//!   wrapped in newtypes so a `StoreId` can never be passed where a `NodeId`
//!   is expected
//! - Locally generated identities (membership change requests) are ULIDs,
//!   sortable by creation time
//! - Every ID has a canonical string form with strict parsing
//!
//! ## ID Format
//!
//! Numeric IDs render as `{prefix}{value}`:
//! - `n1` (node 1)
//! - `s12` (store 12)
//! - `r40` (range 40)
//!
//! ULID-based IDs render as `{prefix}_{ulid}`:
//! - `chg_01HV4Z2WQXKJNM8GPQY6VBKC3D`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
