//! Network range provider contract and a static implementation.
//!
//! The provider supplies the VPC address ranges advertised to the CNI plugin
//! and, when source NAT is handled locally, the ranges excluded from it.
//! Order matters to consumers that read the combined list positionally, so
//! implementations return ranges in a stable order.

use ipnet::Ipv4Net;

/// Source of VPC ranges and SNAT policy.
pub trait NetworkRangeProvider: Send + Sync {
    /// Base VPC ranges, in provider order.
    fn vpc_cidrs(&self) -> Vec<String>;

    /// Whether outbound source NAT is managed outside this daemon.
    fn use_external_snat(&self) -> bool;

    /// Ranges excluded from local source NAT, in provider order.
    fn exclude_snat_cidrs(&self) -> Vec<String>;
}

/// Provider returning a fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticNetworkRanges {
    vpc_cidrs: Vec<Ipv4Net>,
    use_external_snat: bool,
    exclude_snat_cidrs: Vec<Ipv4Net>,
}

impl StaticNetworkRanges {
    pub const fn new(
        vpc_cidrs: Vec<Ipv4Net>,
        use_external_snat: bool,
        exclude_snat_cidrs: Vec<Ipv4Net>,
    ) -> Self {
        Self {
            vpc_cidrs,
            use_external_snat,
            exclude_snat_cidrs,
        }
    }
}

impl NetworkRangeProvider for StaticNetworkRanges {
    fn vpc_cidrs(&self) -> Vec<String> {
        self.vpc_cidrs.iter().map(ToString::to_string).collect()
    }

    fn use_external_snat(&self) -> bool {
        self.use_external_snat
    }

    fn exclude_snat_cidrs(&self) -> Vec<String> {
        self.exclude_snat_cidrs
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}
