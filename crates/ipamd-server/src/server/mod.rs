//! Server-side components of the `ipamd` RPC front end.
//!
//! ## Submodules
//!
//! - [`config`] - CLI/environment configuration and validation.
//! - [`service`] - `CNIBackend` implementation and its shared context.
//! - [`shutdown`] - Termination state and the signal-driven coordinator.
//! - [`telemetry`] - Logging, tracing export and metric counters.

pub mod config;
pub mod service;
pub mod shutdown;
pub mod telemetry;
