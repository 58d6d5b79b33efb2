//! App Runtime Store - cluster watch cache for platform services
//!
//! Watches the workload objects of every platform service, keeps one
//! aggregate per service and serves health, readiness and metrics.

use anyhow::{Context, Result};
use kube::ResourceExt;
use std::sync::Arc;
use store_lib::{
    health::{components, HealthRegistry},
    AppRuntimeStore, KubeCluster, Listers, LoggingApplier, MemoryPersistence, ProbeEvent,
    StoreDeps, StoreError, StructuredLogger, WatchMultiplexer,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting app-runtime-store");

    let config = config::AppConfig::load()?;
    info!(instance = %config.instance, api_port = config.api_port, "Store configured");
    let logger = StructuredLogger::new(&config.instance);

    let health_registry = HealthRegistry::new();
    health_registry.register(components::WATCHERS).await;
    health_registry.register(components::STORE).await;
    health_registry.register(components::PERSISTENCE).await;
    health_registry.set_ready(false).await;

    // an empty declared state would mark every platform object as orphaned
    let persistence = match MemoryPersistence::from_file(&config.declared_state_path) {
        Ok(persistence) => Arc::new(persistence),
        Err(e) => {
            error!(path = %config.declared_state_path, error = %e, "Failed to load declared state");
            return Err(e).context("Declared state is required to start the store");
        }
    };

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let listers = Arc::new(Listers::new());
    let (store, receivers) = AppRuntimeStore::new(
        StoreDeps {
            persistence,
            cluster: Arc::new(KubeCluster::new(client.clone())),
            applier: Arc::new(LoggingApplier),
            listers: listers.clone(),
        },
        config.store_config(),
    );

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), store.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    spawn_consumers(&store, receivers, config.pod_listener_buffer);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = signal_tx.send(());
        }
    });
    let mut shutdown_rx = shutdown_tx.subscribe();

    let multiplexer = WatchMultiplexer::new(client, listers);
    let watch_handles = match store.start(&multiplexer, &shutdown_tx).await {
        Ok(handles) => handles,
        Err(StoreError::NotReady(reason)) => {
            logger.log_shutdown(&reason);
            api_handle.abort();
            return Ok(());
        }
        Err(e) => {
            health_registry
                .set_unhealthy(components::STORE, e.to_string())
                .await;
            let _ = shutdown_tx.send(());
            api_handle.abort();
            return Err(e).context("Failed to start store");
        }
    };
    health_registry.set_ready(true).await;

    // Wait for shutdown signal
    let _ = shutdown_rx.recv().await;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");

    for handle in watch_handles {
        let _ = handle.await;
    }
    api_handle.abort();

    Ok(())
}

/// Drain the store's outbound channels into the log
fn spawn_consumers(
    store: &Arc<AppRuntimeStore>,
    receivers: store_lib::StoreReceivers,
    pod_listener_buffer: usize,
) {
    let mut probes = receivers.probes;
    tokio::spawn(async move {
        while let Some(event) = probes.recv().await {
            match event {
                ProbeEvent::Create(infos) => {
                    for p in infos {
                        info!(sid = %p.sid, uuid = %p.uuid, ip = %p.ip, port = p.port, "Probe added");
                    }
                }
                ProbeEvent::Delete(p) => {
                    info!(sid = %p.sid, uuid = %p.uuid, ip = %p.ip, port = p.port, "Probe removed");
                }
            }
        }
    });

    let mut starts = receivers.starts;
    tokio::spawn(async move {
        while let Some(notice) = starts.recv().await {
            info!(service_id = %notice.service_id, "Start requested for third-party service");
        }
    });

    let (pod_tx, mut pod_rx) = mpsc::channel(pod_listener_buffer.max(1));
    store.register_pod_update_listener("log", pod_tx);
    tokio::spawn(async move {
        while let Some(pod) = pod_rx.recv().await {
            debug!(
                namespace = %pod.namespace().unwrap_or_default(),
                pod = %pod.name_any(),
                "Pod updated"
            );
        }
    });
}
