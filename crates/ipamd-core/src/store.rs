//! Allocation store contract consumed by the RPC service.
//!
//! The store owns the mapping from [`PodIdentity`] to [`Assignment`] and its
//! own concurrency discipline: `assign` and `unassign` must be atomic per
//! identity. Callers hold no locks across these calls.
//!
//! [`memory::MemoryStore`] is an in-process implementation backed by a fixed
//! address pool.

pub mod memory;

use crate::{Assignment, PodIdentity, Result};

/// Keyed store mapping pod identities to addresses and device numbers.
pub trait AllocationStore: Send + Sync {
    /// Assigns an address to `pod`, or returns the one it already holds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`](crate::Error::PoolExhausted) when no
    /// address is available, or another store error.
    fn assign(&self, pod: &PodIdentity) -> Result<Assignment>;

    /// Releases the address held by `pod` and returns it.
    ///
    /// Identities are matched on all three fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPod`](crate::Error::UnknownPod) when no record
    /// exists for `pod`.
    fn unassign(&self, pod: &PodIdentity) -> Result<Assignment>;
}
