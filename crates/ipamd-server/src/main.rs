#![doc = include_str!("../README.md")]

mod server;

use anyhow::Context;
use clap::Parser;
use core::future::Future;
use ipamd_core::{
    MemoryStore, StaticNetworkRanges,
    proto::{FILE_DESCRIPTOR_SET, cni_backend_server::CniBackendServer},
};
use server::config::{CliArgs, ServerConfig};
use server::service::{context::IpamContext, handler::IpamService};
use server::shutdown::{Outcome, ShutdownCoordinator, os_signal};
use server::telemetry::init_telemetry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic_health::{
    ServingStatus,
    pb::health_server::{Health, HealthServer},
};
use tonic_reflection::server::Builder;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let store = Arc::new(seed_store(&config)?);
    let ranges = StaticNetworkRanges::new(
        config.vpc_cidrs.clone(),
        config.use_external_snat,
        config.exclude_snat_cidrs.clone(),
    );
    let context = IpamContext::new(store.clone(), Arc::new(ranges));
    let service = IpamService::new(context.clone());

    tracing::info!("Serving RPC Handler on {}", config.server_addr);
    if cfg!(debug_assertions) {
        tracing::debug!("Full config: {:#?}", config);
    }
    tracing::info!(
        "Address pool has {} addresses on {} devices, {} restored",
        store.capacity(),
        config.pool.len(),
        config.restored.len()
    );

    let listener = TcpListener::bind(config.server_addr)
        .await
        .inspect_err(|e| tracing::error!("Failed to listen gRPC port: {e}"))
        .with_context(|| format!("ipamd: failed to listen to gRPC port {}", config.server_addr))?;

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_service_status(&config.health_service, ServingStatus::Serving)
        .await;

    // Add shutdown hook. Serving continues after the transition: stopping the
    // process is up to the supervisor.
    let coordinator = ShutdownCoordinator::new(context.termination().clone());
    let stop_hook = coordinator.cancellation_token();
    let signal = os_signal().context("failed to install signal handlers")?;
    let health_tracks_termination = config
        .health_tracks_termination
        .then(|| (health_reporter.clone(), config.health_service.clone()));
    let served = service.clone();
    tokio::spawn(async move {
        if coordinator.run(signal).await == Outcome::Terminated {
            tracing::info!(
                "Served {} AddNetwork and {} DelNetwork requests",
                served.metrics().add_ip_requests(),
                served.metrics().del_ip_requests_total()
            );
            if let Some((reporter, name)) = health_tracks_termination {
                reporter
                    .set_service_status(&name, ServingStatus::NotServing)
                    .await;
            }
            providers.flush();
        }
    });

    let result = serve(
        listener,
        service,
        health_service,
        std::future::pending::<()>(),
    )
    .await
    .inspect_err(|e| tracing::error!("Failed to start server on gRPC port: {e:#}"));

    stop_hook.cancel();
    result
}

/// Builds the address pool from `config` and replays restored assignments.
fn seed_store(config: &ServerConfig) -> anyhow::Result<MemoryStore> {
    let store = MemoryStore::new();
    for (device, addresses) in &config.pool {
        store.add_addresses(*device, addresses.iter().copied())?;
    }
    for (pod, address) in &config.restored {
        store
            .restore(pod, *address)
            .with_context(|| format!("failed to restore {address} for {pod}"))?;
    }
    Ok(store)
}

/// Serves the `CNIBackend`, health and reflection services on `listener`
/// until `shutdown` resolves.
async fn serve<F>(
    listener: TcpListener,
    service: IpamService,
    health_service: HealthServer<impl Health>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    Server::builder()
        .add_service(health_service)
        .add_service(reflection)
        .add_service(CniBackendServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .context("ipamd: failed to start server on gRPC port")?;

    tracing::info!("Service shut down successfully");
    Ok(())
}
