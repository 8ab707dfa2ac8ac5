//! Error types for the address allocation collaborators.
//!
//! This module defines the central `Error` enum returned by
//! [`AllocationStore`](crate::AllocationStore) implementations. The RPC layer
//! never turns these into gRPC statuses: they are folded into the `success`
//! field of the reply, and only [`Error::UnknownPod`] is given special meaning
//! (it triggers the weaker-key retry on release and counts as a no-op).
//!
//! ## Error Cases
//! - `UnknownPod`: The store holds no record for the given identity.
//! - `PoolExhausted`: No free address is left to hand out.
//! - `AddressNotInPool`: A restored address is not owned by the pool.
//! - `AddressInUse`: A restored address is already held by another identity.
//! - `Store`: Any other internal store fault.

use std::net::Ipv4Addr;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for allocation store operations.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The store has no record for the requested pod identity.
    #[error("Unknown pod")]
    UnknownPod,

    /// Every address in the pool is assigned.
    #[error("No available IP addresses")]
    PoolExhausted,

    /// The address does not belong to any device in the pool.
    #[error("Address {0} is not in the pool")]
    AddressNotInPool(Ipv4Addr),

    /// The address is already assigned to a different identity.
    #[error("Address {0} is already assigned")]
    AddressInUse(Ipv4Addr),

    /// Internal store failure.
    #[error("Store error: {context}")]
    Store { context: String },
}

impl Error {
    /// Returns `true` if the store does not know the requested identity.
    pub const fn is_unknown_pod(&self) -> bool {
        matches!(self, Self::UnknownPod)
    }
}
