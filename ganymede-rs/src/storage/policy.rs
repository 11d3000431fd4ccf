//! Determines what happens if a storage engine runs out of capacity.
//!
//! The policy is selected via **storage.policy**. Currently only **reject** is available, which
//! fails the write with [StorageError::InsufficientStorage](crate::storage::StorageError).
use std::sync::Arc;

use crate::storage::{Operation, StorageError};

/// Invoked by a storage engine once a write cannot be performed as the engine is full.
pub trait CapacityPolicy: Send + Sync {
    /// Returns the name used to select this policy in the config.
    fn name(&self) -> &'static str;

    /// Determines the outcome of a write which hit the capacity limit.
    fn on_capacity_exhausted(&self, service_id: &str, key: &str, operation: Operation)
        -> StorageError;
}

/// Rejects writes which would exceed the capacity.
pub struct Reject;

impl CapacityPolicy for Reject {
    fn name(&self) -> &'static str {
        "reject"
    }

    fn on_capacity_exhausted(
        &self,
        service_id: &str,
        key: &str,
        operation: Operation,
    ) -> StorageError {
        StorageError::InsufficientStorage {
            service_id: service_id.to_owned(),
            key: key.to_owned(),
            operation,
        }
    }
}

/// Resolves the policy with the given name.
///
/// Unknown names are reported and fall back to **reject**.
///
/// # Example
///
/// ```
/// # use ganymede::storage::policy::from_name;
/// assert_eq!(from_name("reject").name(), "reject");
/// assert_eq!(from_name("evict-oldest").name(), "reject");
/// ```
pub fn from_name(name: &str) -> Arc<dyn CapacityPolicy> {
    match name {
        "reject" => Arc::new(Reject),
        _ => {
            log::error!(
                "Unknown storage policy '{}' - falling back to 'reject'.",
                name
            );
            Arc::new(Reject)
        }
    }
}
