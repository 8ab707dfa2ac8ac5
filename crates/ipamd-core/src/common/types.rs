//! Pod identity and address assignment values.
//!
//! [`PodIdentity`] correlates RPC requests with allocation records. Stores
//! compare identities by all three fields; the two-field weakening produced by
//! [`PodIdentity::without_container`] carries an empty container id, which is
//! how records rebuilt after a restart are keyed.

use core::fmt;
use std::net::Ipv4Addr;

/// Identity of a pod sandbox as seen by the CNI plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodIdentity {
    pub name: String,
    pub namespace: String,
    /// Infra (sandbox) container id. Empty for identities restored from the
    /// kubelet's view, which only knows name and namespace.
    pub container: String,
}

impl PodIdentity {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            container: container.into(),
        }
    }

    /// Returns the `{name, namespace}` weakening of this identity.
    pub fn without_container(&self) -> Self {
        Self {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            container: String::new(),
        }
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.container.is_empty() {
            write!(f, "{}/{}", self.namespace, self.name)
        } else {
            write!(f, "{}/{} ({})", self.namespace, self.name, self.container)
        }
    }
}

/// An address held by a pod, together with the device (slot) it lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub address: Ipv4Addr,
    pub device_number: u32,
}

impl Assignment {
    pub const fn new(address: Ipv4Addr, device_number: u32) -> Self {
        Self {
            address,
            device_number,
        }
    }
}
