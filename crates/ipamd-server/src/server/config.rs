use anyhow::{Context, bail};
use clap::Parser;
use ipamd_core::PodIdentity;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};

/// Runtime configuration for the `ipamd-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first when present). List-valued settings accept
/// comma separated values.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ipamd-server",
    version,
    about = "Node-local gRPC backend assigning pod addresses for the CNI plugin"
)]
pub struct CliArgs {
    /// Loopback address the CNI backend listens on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("127.0.0.1:50051"))]
    pub server_addr: String,

    /// Service name reported as `SERVING` by the gRPC health protocol.
    ///
    /// Environment variable: `HEALTH_SERVICE`
    #[arg(long, env = "HEALTH_SERVICE", default_value_t = String::from("grpc.health.v1.ipamd"))]
    pub health_service: String,

    /// VPC address ranges advertised to the plugin, in order.
    ///
    /// Environment variable: `VPC_CIDRS`
    #[arg(long, env = "VPC_CIDRS", value_delimiter = ',')]
    pub vpc_cidrs: Vec<String>,

    /// Outbound source NAT is handled outside this node.
    ///
    /// When unset, `EXCLUDE_SNAT_CIDRS` are appended to the advertised ranges.
    ///
    /// Environment variable: `EXTERNAL_SNAT`
    #[arg(long, env = "EXTERNAL_SNAT", default_value_t = false)]
    pub external_snat: bool,

    /// Ranges excluded from local source NAT, in order.
    ///
    /// Environment variable: `EXCLUDE_SNAT_CIDRS`
    #[arg(long, env = "EXCLUDE_SNAT_CIDRS", value_delimiter = ',')]
    pub exclude_snat_cidrs: Vec<String>,

    /// Addresses available for assignment, as `device=address` entries.
    ///
    /// Example: "1=10.0.1.5,1=10.0.1.6,2=10.0.2.10"
    ///
    /// Environment variable: `IP_POOL`
    #[arg(long = "pool", env = "IP_POOL", value_delimiter = ',')]
    pub pool: Vec<String>,

    /// Addresses still held by running pods, as `namespace/name=address`
    /// entries.
    ///
    /// Rebuilds allocation state after a restart. Restored pods carry no
    /// container id, so they are released through the `{name, namespace}`
    /// fallback. Every address must also appear in `IP_POOL`.
    ///
    /// Example: "ns1/pod-a=10.0.1.6"
    ///
    /// Environment variable: `IP_POOL_RESTORED`
    #[arg(long, env = "IP_POOL_RESTORED", value_delimiter = ',')]
    pub restored: Vec<String>,

    /// Report `NOT_SERVING` once a termination signal has been received.
    ///
    /// Off by default: the health status stays `SERVING` for the lifetime of
    /// the process.
    ///
    /// Environment variable: `HEALTH_TRACKS_TERMINATION`
    #[arg(long, env = "HEALTH_TRACKS_TERMINATION", default_value_t = false)]
    pub health_tracks_termination: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: SocketAddr,
    pub health_service: String,
    pub vpc_cidrs: Vec<Ipv4Net>,
    pub use_external_snat: bool,
    pub exclude_snat_cidrs: Vec<Ipv4Net>,
    /// device number -> addresses
    pub pool: BTreeMap<u32, Vec<Ipv4Addr>>,
    /// Pods holding an address at startup, keyed without a container id.
    pub restored: Vec<(PodIdentity, Ipv4Addr)>,
    pub health_tracks_termination: bool,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let server_addr: SocketAddr = args
            .server_addr
            .parse()
            .with_context(|| format!("invalid SERVER_ADDR `{}`", args.server_addr))?;

        if !server_addr.ip().is_loopback() {
            bail!("SERVER_ADDR ({server_addr}) must be a loopback address");
        }

        if args.health_service.trim().is_empty() {
            bail!("HEALTH_SERVICE must not be empty");
        }

        let pool = parse_pool(&args.pool)?;
        let restored = parse_restored(&args.restored, &pool)?;

        Ok(Self {
            server_addr,
            health_service: args.health_service,
            vpc_cidrs: parse_cidrs("VPC_CIDRS", &args.vpc_cidrs)?,
            use_external_snat: args.external_snat,
            exclude_snat_cidrs: parse_cidrs("EXCLUDE_SNAT_CIDRS", &args.exclude_snat_cidrs)?,
            pool,
            restored,
            health_tracks_termination: args.health_tracks_termination,
        })
    }
}

fn parse_cidrs(name: &str, raw: &[String]) -> anyhow::Result<Vec<Ipv4Net>> {
    raw.iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Ipv4Net>()
                .with_context(|| format!("invalid CIDR `{s}` in {name}"))
        })
        .collect()
}

fn parse_pool(raw: &[String]) -> anyhow::Result<BTreeMap<u32, Vec<Ipv4Addr>>> {
    let mut pool: BTreeMap<u32, Vec<Ipv4Addr>> = BTreeMap::new();
    let mut seen = HashSet::new();

    for entry in raw.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let Some((device, address)) = entry.split_once('=') else {
            bail!("invalid IP_POOL entry `{entry}`, expected `device=address`");
        };
        let device: u32 = device
            .trim()
            .parse()
            .with_context(|| format!("invalid device number in IP_POOL entry `{entry}`"))?;
        let address: Ipv4Addr = address
            .trim()
            .parse()
            .with_context(|| format!("invalid address in IP_POOL entry `{entry}`"))?;

        if !seen.insert(address) {
            bail!("IP_POOL lists {address} more than once");
        }
        pool.entry(device).or_default().push(address);
    }

    Ok(pool)
}

fn parse_restored(
    raw: &[String],
    pool: &BTreeMap<u32, Vec<Ipv4Addr>>,
) -> anyhow::Result<Vec<(PodIdentity, Ipv4Addr)>> {
    let mut restored = Vec::new();
    let mut pods = HashSet::new();
    let mut addresses = HashSet::new();

    for entry in raw.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let Some((pod, address)) = entry.split_once('=') else {
            bail!("invalid IP_POOL_RESTORED entry `{entry}`, expected `namespace/name=address`");
        };
        let Some((namespace, name)) = pod.trim().split_once('/') else {
            bail!("invalid pod in IP_POOL_RESTORED entry `{entry}`, expected `namespace/name`");
        };
        let (namespace, name) = (namespace.trim(), name.trim());
        if namespace.is_empty() || name.is_empty() {
            bail!("empty namespace or name in IP_POOL_RESTORED entry `{entry}`");
        }
        let address: Ipv4Addr = address
            .trim()
            .parse()
            .with_context(|| format!("invalid address in IP_POOL_RESTORED entry `{entry}`"))?;

        if !pool.values().any(|addrs| addrs.contains(&address)) {
            bail!("IP_POOL_RESTORED address {address} is not listed in IP_POOL");
        }
        if !addresses.insert(address) {
            bail!("IP_POOL_RESTORED lists {address} more than once");
        }
        let pod = PodIdentity::new(name, namespace, "");
        if !pods.insert(pod.clone()) {
            bail!("IP_POOL_RESTORED lists {pod} more than once");
        }
        restored.push((pod, address));
    }

    Ok(restored)
}
