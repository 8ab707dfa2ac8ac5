//! gRPC service implementation for pod address assignment.
//!
//! This module defines [`IpamService`], the concrete implementation of the
//! [`CniBackend`] gRPC service. The CNI plugin calls `AddNetwork` when a pod
//! sandbox is created and `DelNetwork` when it is torn down.
//!
//! ## Responsibilities
//!
//! - Forward assign/release requests to the [`AllocationStore`].
//! - Build the ordered list of network ranges returned on `AddNetwork`.
//! - Retry releases with the `{name, namespace}` identity when the full
//!   identity is unknown (state rebuilt after a restart has no container id).
//! - Fold allocation errors into the `success` field. These handlers never
//!   return a non-OK status.
//!
//! [`AllocationStore`]: ipamd_core::AllocationStore

use crate::server::service::{context::IpamContext, metrics::RpcMetrics};
use ipamd_core::{
    Assignment, PodIdentity,
    proto::{
        AddNetworkReply, AddNetworkRequest, DelNetworkReply, DelNetworkRequest,
        cni_backend_server::CniBackend,
    },
};
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// `CNIBackend` service backed by an [`IpamContext`].
///
/// Cheap to clone; clones share the context and counters.
#[derive(Clone)]
pub struct IpamService {
    context: IpamContext,
    metrics: Arc<RpcMetrics>,
}

impl IpamService {
    pub fn new(context: IpamContext) -> Self {
        Self {
            context,
            metrics: Arc::new(RpcMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &RpcMetrics {
        &self.metrics
    }

    /// Assigns an address and reports it with the advertised network ranges.
    ///
    /// The reply is always well formed: `success` mirrors whether the store
    /// returned an assignment. The request counter is bumped either way.
    pub fn handle_add_network(&self, req: &AddNetworkRequest) -> AddNetworkReply {
        tracing::info!(
            "Received AddNetwork for NS {}, Pod {}, NameSpace {}, Container {}, ifname {}",
            req.netns,
            req.pod_name,
            req.pod_namespace,
            req.container_id,
            req.if_name
        );
        self.warn_if_terminating("AddNetwork");

        let pod = PodIdentity::new(&req.pod_name, &req.pod_namespace, &req.container_id);
        let result = self.context.store().assign(&pod);
        let (use_external_snat, vpc_cidrs) = self.network_ranges();

        let reply = match &result {
            Ok(assignment) => AddNetworkReply {
                success: true,
                ipv4_addr: assignment.address.to_string(),
                ipv4_subnet: String::new(),
                device_number: device_number(assignment),
                use_external_snat,
                vpc_cidrs,
            },
            Err(_) => AddNetworkReply {
                success: false,
                use_external_snat,
                vpc_cidrs,
                ..Default::default()
            },
        };

        tracing::info!(
            "Send AddNetworkReply: IPv4Addr {}, DeviceNumber: {}, err: {:?}",
            reply.ipv4_addr,
            reply.device_number,
            result.err()
        );
        self.metrics.record_add();
        reply
    }

    /// Releases the address held by the pod.
    ///
    /// An unknown identity is a successful no-op: teardown must not be blocked
    /// by a resource that no longer exists. Any other store error reports
    /// `success = false`.
    pub fn handle_del_network(&self, req: &DelNetworkRequest) -> DelNetworkReply {
        tracing::info!(
            "Received DelNetwork for IP {}, Pod {}, Namespace {}, Container {}",
            req.ipv4_addr,
            req.pod_name,
            req.pod_namespace,
            req.container_id
        );
        self.metrics.record_del(&req.reason);
        self.warn_if_terminating("DelNetwork");

        let pod = PodIdentity::new(&req.pod_name, &req.pod_namespace, &req.container_id);
        let result = self.unassign_with_fallback(&pod);

        let reply = match &result {
            Ok(assignment) => DelNetworkReply {
                success: true,
                ipv4_addr: assignment.address.to_string(),
                device_number: device_number(assignment),
            },
            Err(e) => DelNetworkReply {
                success: e.is_unknown_pod(),
                ..Default::default()
            },
        };

        tracing::info!(
            "Send DelNetworkReply: IPv4Addr {}, DeviceNumber: {}, err: {:?}",
            reply.ipv4_addr,
            reply.device_number,
            result.err()
        );
        reply
    }

    /// Unassigns by the full identity, then once by `{name, namespace}` if the
    /// store did not know the full identity. Other errors are not retried.
    fn unassign_with_fallback(&self, pod: &PodIdentity) -> ipamd_core::Result<Assignment> {
        let store = self.context.store();
        match store.unassign(pod) {
            Err(e) if e.is_unknown_pod() => {
                tracing::debug!(%pod, "Unknown pod, retrying release without container id");
                store.unassign(&pod.without_container())
            }
            result => result,
        }
    }

    /// Base VPC ranges, followed by SNAT exclusions when SNAT is handled on
    /// this node.
    fn network_ranges(&self) -> (bool, Vec<String>) {
        let ranges = self.context.ranges();

        let mut cidrs = ranges.vpc_cidrs();
        for cidr in &cidrs {
            tracing::debug!("VPC CIDR {cidr}");
        }

        let use_external_snat = ranges.use_external_snat();
        if !use_external_snat {
            for cidr in ranges.exclude_snat_cidrs() {
                tracing::debug!("CIDR SNAT Exclusion {cidr}");
                cidrs.push(cidr);
            }
        }

        (use_external_snat, cidrs)
    }

    fn warn_if_terminating(&self, method: &str) {
        if self.context.is_terminating() {
            tracing::warn!("Received {method} while terminating");
        }
    }
}

fn device_number(assignment: &Assignment) -> i32 {
    i32::try_from(assignment.device_number).unwrap_or(i32::MAX)
}

#[tonic::async_trait]
impl CniBackend for IpamService {
    #[tracing::instrument(skip_all, fields(pod = %req.get_ref().pod_name, namespace = %req.get_ref().pod_namespace))]
    async fn add_network(
        &self,
        req: Request<AddNetworkRequest>,
    ) -> Result<Response<AddNetworkReply>, Status> {
        Ok(Response::new(self.handle_add_network(req.get_ref())))
    }

    #[tracing::instrument(skip_all, fields(pod = %req.get_ref().pod_name, namespace = %req.get_ref().pod_namespace, reason = %req.get_ref().reason))]
    async fn del_network(
        &self,
        req: Request<DelNetworkRequest>,
    ) -> Result<Response<DelNetworkReply>, Status> {
        Ok(Response::new(self.handle_del_network(req.get_ref())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipamd_core::{
        AllocationStore, Error, MemoryStore, NetworkRangeProvider, Result, StaticNetworkRanges,
    };
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;

    /// Store that replays scripted results and records every identity it was
    /// asked about.
    #[derive(Default)]
    struct ScriptedStore {
        assign: Mutex<Vec<Result<Assignment>>>,
        unassign: Mutex<Vec<Result<Assignment>>>,
        unassign_calls: Mutex<Vec<PodIdentity>>,
    }

    impl ScriptedStore {
        fn with_unassign(results: Vec<Result<Assignment>>) -> Self {
            Self {
                unassign: Mutex::new(results.into_iter().rev().collect()),
                ..Default::default()
            }
        }

        fn with_assign(result: Result<Assignment>) -> Self {
            Self {
                assign: Mutex::new(vec![result]),
                ..Default::default()
            }
        }
    }

    impl AllocationStore for ScriptedStore {
        fn assign(&self, _pod: &PodIdentity) -> Result<Assignment> {
            self.assign.lock().pop().unwrap_or(Err(Error::PoolExhausted))
        }

        fn unassign(&self, pod: &PodIdentity) -> Result<Assignment> {
            self.unassign_calls.lock().push(pod.clone());
            self.unassign.lock().pop().unwrap_or(Err(Error::UnknownPod))
        }
    }

    fn ranges(external_snat: bool) -> StaticNetworkRanges {
        StaticNetworkRanges::new(
            vec!["10.0.0.0/16".parse().unwrap(), "100.64.0.0/10".parse().unwrap()],
            external_snat,
            vec![
                "192.168.0.0/16".parse().unwrap(),
                "172.16.0.0/12".parse().unwrap(),
            ],
        )
    }

    fn service_with<S>(store: Arc<S>, ranges: impl NetworkRangeProvider + 'static) -> IpamService
    where
        S: AllocationStore + 'static,
    {
        IpamService::new(IpamContext::new(store, Arc::new(ranges)))
    }

    fn add_req(name: &str, ns: &str, container: &str) -> AddNetworkRequest {
        AddNetworkRequest {
            pod_name: name.into(),
            pod_namespace: ns.into(),
            container_id: container.into(),
            netns: "/var/run/netns/cni-1".into(),
            if_name: "eth0".into(),
        }
    }

    fn del_req(name: &str, ns: &str, container: &str, reason: &str) -> DelNetworkRequest {
        DelNetworkRequest {
            pod_name: name.into(),
            pod_namespace: ns.into(),
            container_id: container.into(),
            ipv4_addr: String::new(),
            reason: reason.into(),
        }
    }

    #[test]
    fn add_network_reports_assignment_and_ranges() {
        let store = Arc::new(ScriptedStore::with_assign(Ok(Assignment::new(
            Ipv4Addr::new(10, 0, 1, 5),
            1,
        ))));
        let service = service_with(
            store,
            StaticNetworkRanges::new(
                vec!["10.0.0.0/16".parse().unwrap()],
                false,
                vec!["192.168.0.0/16".parse().unwrap()],
            ),
        );

        let reply = service.handle_add_network(&add_req("pod-a", "ns1", "c1"));

        assert_eq!(
            reply,
            AddNetworkReply {
                success: true,
                ipv4_addr: "10.0.1.5".into(),
                ipv4_subnet: String::new(),
                device_number: 1,
                use_external_snat: false,
                vpc_cidrs: vec!["10.0.0.0/16".into(), "192.168.0.0/16".into()],
            }
        );
    }

    #[test]
    fn exclusions_follow_base_ranges_in_provider_order() {
        let store = Arc::new(MemoryStore::new());
        store.add_addresses(1, [Ipv4Addr::new(10, 0, 1, 5)]).unwrap();
        let service = service_with(store, ranges(false));

        let reply = service.handle_add_network(&add_req("pod-a", "ns1", "c1"));

        assert_eq!(
            reply.vpc_cidrs,
            ["10.0.0.0/16", "100.64.0.0/10", "192.168.0.0/16", "172.16.0.0/12"]
        );
    }

    #[test]
    fn external_snat_omits_exclusions() {
        let store = Arc::new(MemoryStore::new());
        store.add_addresses(1, [Ipv4Addr::new(10, 0, 1, 5)]).unwrap();
        let service = service_with(store, ranges(true));

        let reply = service.handle_add_network(&add_req("pod-a", "ns1", "c1"));

        assert!(reply.success);
        assert!(reply.use_external_snat);
        assert_eq!(reply.vpc_cidrs, ["10.0.0.0/16", "100.64.0.0/10"]);
    }

    #[test]
    fn failed_add_still_returns_reply_and_counts() {
        let store = Arc::new(ScriptedStore::with_assign(Err(Error::PoolExhausted)));
        let service = service_with(store, ranges(false));

        let reply = service.handle_add_network(&add_req("pod-a", "ns1", "c1"));

        assert!(!reply.success);
        assert!(reply.ipv4_addr.is_empty());
        assert!(reply.ipv4_subnet.is_empty());
        assert_eq!(reply.device_number, 0);
        assert_eq!(reply.vpc_cidrs.len(), 4);
        assert_eq!(service.metrics().add_ip_requests(), 1);
    }

    #[test]
    fn unknown_pod_on_add_is_a_failure() {
        let store = Arc::new(ScriptedStore::with_assign(Err(Error::UnknownPod)));
        let service = service_with(store, ranges(false));

        assert!(!service.handle_add_network(&add_req("pod-a", "ns1", "c1")).success);
    }

    #[test]
    fn add_counter_increments_once_per_call() {
        let store = Arc::new(MemoryStore::new());
        store.add_addresses(1, [Ipv4Addr::new(10, 0, 1, 5)]).unwrap();
        let service = service_with(store, ranges(false));

        assert!(service.handle_add_network(&add_req("a", "ns", "c1")).success);
        assert!(!service.handle_add_network(&add_req("b", "ns", "c2")).success);
        assert!(service.handle_add_network(&add_req("a", "ns", "c1")).success);

        assert_eq!(service.metrics().add_ip_requests(), 3);
        assert_eq!(service.metrics().del_ip_requests_total(), 0);
    }

    #[test]
    fn del_network_of_never_added_pod_succeeds() {
        let store = Arc::new(MemoryStore::new());
        store.add_addresses(1, [Ipv4Addr::new(10, 0, 1, 5)]).unwrap();
        let service = service_with(store, ranges(false));

        let reply = service.handle_del_network(&del_req("ghost", "ns", "c9", "PodDeleted"));

        assert_eq!(
            reply,
            DelNetworkReply {
                success: true,
                ipv4_addr: String::new(),
                device_number: 0,
            }
        );
    }

    #[test]
    fn del_network_releases_by_full_identity() {
        let store = Arc::new(MemoryStore::new());
        store.add_addresses(2, [Ipv4Addr::new(10, 0, 2, 7)]).unwrap();
        let service = service_with(Arc::clone(&store), ranges(false));
        assert!(service.handle_add_network(&add_req("pod-a", "ns1", "c1")).success);

        let reply = service.handle_del_network(&del_req("pod-a", "ns1", "c1", "PodDeleted"));

        assert!(reply.success);
        assert_eq!(reply.ipv4_addr, "10.0.2.7");
        assert_eq!(reply.device_number, 2);
        assert_eq!(store.assigned(), 0);
    }

    #[test]
    fn del_network_after_restart_falls_back_to_name_and_namespace() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_addresses(1, [Ipv4Addr::new(10, 0, 1, 5), Ipv4Addr::new(10, 0, 1, 6)])
            .unwrap();
        store
            .restore(&PodIdentity::new("pod-a", "ns1", ""), Ipv4Addr::new(10, 0, 1, 6))
            .unwrap();
        let service = service_with(Arc::clone(&store), ranges(false));

        let reply = service.handle_del_network(&del_req("pod-a", "ns1", "c1", "PodDeleted"));

        assert!(reply.success);
        assert_eq!(reply.ipv4_addr, "10.0.1.6");
        assert_eq!(reply.device_number, 1);
        assert_eq!(store.assigned(), 0);
    }

    #[test]
    fn fallback_is_tried_exactly_once_with_weak_identity() {
        let store = Arc::new(ScriptedStore::with_unassign(vec![
            Err(Error::UnknownPod),
            Err(Error::UnknownPod),
        ]));
        let service = service_with(Arc::clone(&store), ranges(false));

        let reply = service.handle_del_network(&del_req("pod-a", "ns1", "c1", "PodDeleted"));

        assert!(reply.success);
        assert_eq!(
            *store.unassign_calls.lock(),
            vec![
                PodIdentity::new("pod-a", "ns1", "c1"),
                PodIdentity::new("pod-a", "ns1", ""),
            ]
        );
    }

    #[test]
    fn other_errors_are_not_retried_and_fail() {
        let store = Arc::new(ScriptedStore::with_unassign(vec![Err(Error::Store {
            context: "datastore unavailable".into(),
        })]));
        let service = service_with(Arc::clone(&store), ranges(false));

        let reply = service.handle_del_network(&del_req("pod-a", "ns1", "c1", "PodDeleted"));

        assert!(!reply.success);
        assert_eq!(store.unassign_calls.lock().len(), 1);
    }

    #[test]
    fn fallback_failure_other_than_unknown_pod_fails() {
        let store = Arc::new(ScriptedStore::with_unassign(vec![
            Err(Error::UnknownPod),
            Err(Error::Store {
                context: "datastore unavailable".into(),
            }),
        ]));
        let service = service_with(Arc::clone(&store), ranges(false));

        let reply = service.handle_del_network(&del_req("pod-a", "ns1", "c1", "PodDeleted"));

        assert!(!reply.success);
        assert_eq!(store.unassign_calls.lock().len(), 2);
    }

    #[test]
    fn del_counter_is_labeled_by_reason_regardless_of_outcome() {
        let store = Arc::new(ScriptedStore::with_unassign(vec![
            Err(Error::Store {
                context: "boom".into(),
            }),
            Ok(Assignment::new(Ipv4Addr::new(10, 0, 1, 5), 1)),
        ]));
        let service = service_with(store, ranges(false));

        assert!(!service.handle_del_network(&del_req("a", "ns", "c1", "PodDeleted")).success);
        assert!(service.handle_del_network(&del_req("b", "ns", "c2", "SetupFailed")).success);
        assert!(service.handle_del_network(&del_req("c", "ns", "c3", "PodDeleted")).success);

        let metrics = service.metrics();
        assert_eq!(metrics.del_ip_requests("PodDeleted"), 2);
        assert_eq!(metrics.del_ip_requests("SetupFailed"), 1);
        assert_eq!(metrics.del_ip_requests("unknown"), 0);
        assert_eq!(metrics.del_ip_requests_total(), 3);
        assert_eq!(metrics.add_ip_requests(), 0);
    }

    #[test]
    fn termination_does_not_change_replies() {
        let store = Arc::new(MemoryStore::new());
        store.add_addresses(1, [Ipv4Addr::new(10, 0, 1, 5)]).unwrap();
        let context = IpamContext::new(store, Arc::new(ranges(true)));
        assert!(context.termination().set_terminating());
        let service = IpamService::new(context);

        assert!(service.handle_add_network(&add_req("a", "ns", "c1")).success);
        assert!(service.handle_del_network(&del_req("a", "ns", "c1", "PodDeleted")).success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_for_distinct_pods() {
        const PODS: u8 = 32;
        let store = Arc::new(MemoryStore::new());
        store
            .add_addresses(1, (1..=PODS).map(|i| Ipv4Addr::new(10, 0, 1, i)))
            .unwrap();
        let service = service_with(Arc::clone(&store), ranges(true));

        let adds = (0..PODS).map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                CniBackend::add_network(
                    &service,
                    Request::new(add_req(&format!("pod-{i}"), "ns", "c")),
                )
                .await
                .map(Response::into_inner)
            })
        });
        let replies = futures::future::join_all(adds).await;

        let mut addrs = std::collections::HashSet::new();
        for reply in replies {
            let reply = reply.unwrap().unwrap();
            assert!(reply.success);
            assert!(addrs.insert(reply.ipv4_addr));
        }
        assert_eq!(store.assigned(), PODS as usize);

        let dels = (0..PODS).map(|i| {
            let service = service.clone();
            tokio::spawn(async move {
                CniBackend::del_network(
                    &service,
                    Request::new(del_req(&format!("pod-{i}"), "ns", "c", "PodDeleted")),
                )
                .await
                .map(Response::into_inner)
            })
        });
        for reply in futures::future::join_all(dels).await {
            assert!(reply.unwrap().unwrap().success);
        }

        assert_eq!(store.assigned(), 0);
        assert_eq!(service.metrics().add_ip_requests(), PODS as u64);
        assert_eq!(service.metrics().del_ip_requests("PodDeleted"), PODS as u64);
    }
}
