//! `CNIBackend` gRPC service and the state it shares with the rest of the
//! process.
//!
//! ## Structure
//!
//! - [`context`] - Collaborators and termination state handed to the service.
//! - [`handler`] - gRPC service entry point (`IpamService`).
//! - [`metrics`] - Per-call counters mirrored to the telemetry exporters.

pub mod context;
pub mod handler;
pub mod metrics;
