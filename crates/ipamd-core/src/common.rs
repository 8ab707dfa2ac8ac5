//! Shared types and error definitions used by the ipamd RPC front end.
//!
//! ## Submodules
//!
//! - [`error`] - Error type returned by allocation collaborators.
//! - [`types`] - Pod identity and address assignment values.
//! - [`proto`] - Generated protobuf messages and `CNIBackend` service stubs.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Assignment, PodIdentity};

/// gRPC service and message definitions generated from `proto/ipamd.proto`.
///
/// ## Service
///
/// - `CNIBackend.AddNetwork` - assigns an address to a pod sandbox.
/// - `CNIBackend.DelNetwork` - releases the address held by a pod sandbox.
///
/// Both methods report allocation outcomes through the `success` field of the
/// reply rather than through a gRPC status.
pub mod proto {
    tonic::include_proto!("ipamd");

    /// Encoded file descriptor set for registration with gRPC reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("ipamd_descriptor");
}
