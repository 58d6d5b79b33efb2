//! The application runtime store
//!
//! Maps platform service ids to [`AppService`] aggregates kept current by
//! the watch multiplexer. Aggregates are created lazily from declared state
//! when the first owned object shows up and evicted once nothing of the
//! service is left in the cluster.

mod handlers;
mod resources;


pub use resources::{cpu_millis, memory_bytes, parse_quantity, tenant_resource};

use crate::abnormal::{AbnormalDetector, IncidentTracker};
use crate::appservice::{AppService, Controller};
use crate::cluster::{Applier, ClusterClient, ClusterObject};
use crate::error::{Result, StoreError};
use crate::identity::ServiceIdentity;
use crate::models::{ServiceStatus, TenantResource};
use crate::observability::{StoreMetrics, StructuredLogger};
use crate::persistence::Persistence;
use crate::probe::{ProbeEvent, ProbeNotifier};
use crate::watch::{ClusterEvent, EventSink, Listers, ObjectKind, WatchMultiplexer};
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Creator id used when the store initializes aggregates itself
pub const PLATFORM_CREATOR: &str = "Rainbond";

/// Configuration for the runtime store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Creator id recorded on aggregates built by the store (default: "Rainbond")
    pub creator_id: String,
    /// Capacity of the probe notification channel
    pub probe_channel_buffer: usize,
    /// Capacity of the service start notification channel
    pub start_channel_buffer: usize,
    /// How often `start` polls for watch readiness
    pub ready_poll_interval: Duration,
    /// Instance name used in structured logs
    pub instance: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            creator_id: PLATFORM_CREATOR.to_string(),
            probe_channel_buffer: 1024,
            start_channel_buffer: 256,
            ready_poll_interval: Duration::from_millis(200),
            instance: "app-runtime-store".to_string(),
        }
    }
}

/// Request to start a freshly initialized service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartNotice {
    pub service_id: String,
}

/// Receiving ends of the store's outbound channels
pub struct StoreReceivers {
    pub probes: mpsc::Receiver<ProbeEvent>,
    pub starts: mpsc::Receiver<StartNotice>,
}

/// External collaborators of the store
pub struct StoreDeps {
    pub persistence: Arc<dyn Persistence>,
    pub cluster: Arc<dyn ClusterClient>,
    pub applier: Arc<dyn Applier>,
    pub listers: Arc<Listers>,
}

/// In-memory view of every platform service running in the cluster
pub struct AppRuntimeStore {
    apps: DashMap<String, Arc<AppService>>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    generation: AtomicU64,

    listers: Arc<Listers>,
    persistence: Arc<dyn Persistence>,
    cluster: Arc<dyn ClusterClient>,
    applier: Arc<dyn Applier>,

    probes: ProbeNotifier,
    detector: AbnormalDetector,
    incidents: IncidentTracker,
    pod_listeners: RwLock<HashMap<String, mpsc::Sender<Arc<Pod>>>>,
    start_tx: mpsc::Sender<StartNotice>,

    config: StoreConfig,
    metrics: StoreMetrics,
    logger: StructuredLogger,
}

impl AppRuntimeStore {
    pub fn new(deps: StoreDeps, config: StoreConfig) -> (Arc<Self>, StoreReceivers) {
        let (probes, probe_rx) = ProbeNotifier::channel(config.probe_channel_buffer);
        let (start_tx, start_rx) = mpsc::channel(config.start_channel_buffer.max(1));
        let logger = StructuredLogger::new(config.instance.clone());

        let store = Self {
            apps: DashMap::new(),
            key_locks: DashMap::new(),
            generation: AtomicU64::new(0),
            detector: AbnormalDetector::new(deps.persistence.clone(), logger.clone()),
            incidents: IncidentTracker::new(deps.persistence.clone(), deps.cluster.clone()),
            listers: deps.listers,
            persistence: deps.persistence,
            cluster: deps.cluster,
            applier: deps.applier,
            probes,
            pod_listeners: RwLock::new(HashMap::new()),
            start_tx,
            config,
            metrics: StoreMetrics::new(),
            logger,
        };

        let receivers = StoreReceivers {
            probes: probe_rx,
            starts: start_rx,
        };
        (Arc::new(store), receivers)
    }

    pub fn listers(&self) -> &Arc<Listers> {
        &self.listers
    }

    /// Start watching, wait for every kind to sync, then bring up third-party services
    pub async fn start(
        self: &Arc<Self>,
        multiplexer: &WatchMultiplexer,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Vec<JoinHandle<()>>> {
        self.logger
            .log_startup(env!("CARGO_PKG_VERSION"), ObjectKind::ALL.len());

        let sink: Arc<dyn EventSink> = self.clone();
        let handles = multiplexer.spawn(sink, shutdown);

        let mut stop = shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.ready_poll_interval);
        while !self.ready() {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!(pending = ?self.pending_kinds(), "Waiting for watch caches to sync");
                }
                _ = stop.recv() => {
                    return Err(StoreError::NotReady("shutdown before watch caches synced".to_string()));
                }
            }
        }
        self.logger.log_synced(self.apps.len());

        self.initialize_third_party_services().await?;
        Ok(handles)
    }

    /// Whether every watched kind has completed its initial listing
    pub fn ready(&self) -> bool {
        self.listers.is_synced()
    }

    /// Kinds still waiting for their initial listing
    pub fn pending_kinds(&self) -> Vec<String> {
        self.listers
            .unsynced_kinds()
            .into_iter()
            .map(|k| k.to_string())
            .collect()
    }

    fn key_lock(&self, service_id: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Insert or replace an aggregate, assigning it the next generation
    pub fn register_app_service(&self, app: AppService) -> Arc<AppService> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        app.set_generation(generation);
        let app = Arc::new(app);
        self.apps.insert(app.service_id.clone(), app.clone());
        self.metrics.set_cached_services(self.apps.len());
        debug!(service_id = %app.service_id, generation, "Registered app service");
        app
    }

    pub fn get_app_service(&self, service_id: &str) -> Option<Arc<AppService>> {
        self.apps.get(service_id).map(|entry| entry.value().clone())
    }

    pub fn get_all_app_services(&self) -> Vec<Arc<AppService>> {
        self.apps.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Return the cached aggregate, building it from declared state if allowed
    ///
    /// A service unknown to the platform gets the triggering object deleted.
    /// The caller holds the key lock of the service.
    async fn get_or_create(
        &self,
        identity: &ServiceIdentity,
        create: bool,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Option<Arc<AppService>> {
        if let Some(app) = self.get_app_service(&identity.service_id) {
            return Some(app);
        }
        if !create {
            debug!(service_id = %identity.service_id, kind = %kind, name = %name,
                "Object is terminating, not creating aggregate");
            return None;
        }

        match self
            .persistence
            .init_app_service(&identity.service_id, &identity.creator_id)
            .await
        {
            Ok(declared) => {
                let mut app = AppService::from_declared(declared, identity.creator_id.clone());
                if app.tenant_id.is_empty() {
                    app.tenant_id = identity
                        .tenant_id
                        .clone()
                        .unwrap_or_else(|| namespace.to_string());
                }
                Some(self.register_app_service(app))
            }
            Err(StoreError::ServiceNotFound(_)) => {
                self.delete_orphan(kind, namespace, name, &identity.service_id)
                    .await;
                None
            }
            Err(e) => {
                warn!(service_id = %identity.service_id, kind = %kind, name = %name, error = %e,
                    "Failed to initialize app service, dropping event");
                None
            }
        }
    }

    async fn delete_orphan(&self, kind: ObjectKind, namespace: &str, name: &str, service_id: &str) {
        match self.cluster.delete(kind, namespace, name).await {
            Ok(()) => {
                self.metrics.inc_orphan_deleted(kind.as_str());
                self.logger
                    .log_orphan_deleted(kind.as_str(), namespace, name, service_id);
            }
            Err(e) => {
                warn!(kind = %kind, namespace = %namespace, name = %name, error = %e,
                    "Failed to delete orphaned object");
            }
        }
    }

    /// Evict the aggregate if it holds nothing; returns true when evicted
    async fn evict_if_closed(&self, app: &Arc<AppService>) -> bool {
        if !app.is_closed() {
            return false;
        }
        let lock = self.key_lock(&app.service_id);
        let guard = lock.lock().await;

        // a newer registration under the same id must survive
        let removed = self
            .apps
            .remove_if(&app.service_id, |_, current| {
                current.generation() == app.generation() && current.is_closed()
            })
            .is_some();
        drop(guard);
        if !removed {
            return false;
        }

        // only this call and the map hold the lock: nobody is waiting on it
        self.key_locks
            .remove_if(&app.service_id, |_, l| Arc::strong_count(l) == 2);
        self.metrics.inc_eviction();
        self.metrics.set_cached_services(self.apps.len());
        self.logger.log_eviction(&app.service_id, app.generation());
        true
    }

    /// Re-read every object of the aggregate from the API server
    ///
    /// Objects that no longer exist are detached; an aggregate left closed
    /// is evicted and None is returned.
    pub async fn refresh_app_service(&self, service_id: &str) -> Option<Arc<AppService>> {
        let app = self.get_app_service(service_id)?;
        self.metrics.inc_status_refresh();

        let mut targets = Vec::new();
        match app.controller() {
            Some(Controller::Deployment(d)) => targets.push(target(ObjectKind::Deployment, d.as_ref())),
            Some(Controller::StatefulSet(s)) => targets.push(target(ObjectKind::StatefulSet, s.as_ref())),
            None => {}
        }
        targets.extend(app.get_pods().iter().map(|o| target(ObjectKind::Pod, o.as_ref())));
        targets.extend(app.get_services().iter().map(|o| target(ObjectKind::Service, o.as_ref())));
        targets.extend(app.get_ingresses().iter().map(|o| target(ObjectKind::Ingress, o.as_ref())));
        targets.extend(app.get_secrets().iter().map(|o| target(ObjectKind::Secret, o.as_ref())));
        targets.extend(app.get_configmaps().iter().map(|o| target(ObjectKind::ConfigMap, o.as_ref())));
        targets.extend(app.get_claims().iter().map(|o| target(ObjectKind::Claim, o.as_ref())));
        targets.extend(app.get_endpoints().iter().map(|o| target(ObjectKind::Endpoints, o.as_ref())));

        for (kind, namespace, name) in targets {
            match self.cluster.get(kind, &namespace, &name).await {
                Ok(Some(obj)) => attach_object(&app, obj),
                Ok(None) => {
                    detach_object(&app, kind, &name);
                }
                Err(e) => {
                    warn!(service_id = %service_id, kind = %kind, name = %name, error = %e,
                        "Failed to refresh object, keeping cached copy");
                }
            }
        }

        if self.evict_if_closed(&app).await {
            return None;
        }
        Some(app)
    }

    /// Lifecycle status of one service
    pub async fn get_service_status(&self, service_id: &str) -> Result<ServiceStatus> {
        let started = Instant::now();
        let status = match self.get_app_service(service_id) {
            Some(app) => match app.status() {
                ServiceStatus::Unknown => match self.refresh_app_service(service_id).await {
                    Some(app) => Ok(app.status()),
                    None => self.historical_status(service_id).await,
                },
                status => Ok(status),
            },
            None => self.historical_status(service_id).await,
        };
        self.metrics
            .observe_status_latency(started.elapsed().as_secs_f64());
        status
    }

    /// Status of a service with no cached aggregate, from its version history
    async fn historical_status(&self, service_id: &str) -> Result<ServiceStatus> {
        match self.persistence.list_versions(service_id).await {
            Ok(versions) if versions.is_empty() => Ok(ServiceStatus::Undeployed),
            Ok(_) => Ok(ServiceStatus::Closed),
            Err(e) if e.is_not_found() => Ok(ServiceStatus::Undeployed),
            Err(e) => Err(e),
        }
    }

    /// Status of each listed service, or of every cached service for an empty list
    pub async fn get_services_status(&self, service_ids: &[String]) -> HashMap<String, ServiceStatus> {
        let ids: Vec<String> = if service_ids.is_empty() {
            self.apps.iter().map(|entry| entry.key().clone()).collect()
        } else {
            service_ids.to_vec()
        };

        let mut statuses = HashMap::with_capacity(ids.len());
        for id in ids {
            let status = match self.get_service_status(&id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(service_id = %id, error = %e, "Failed to get service status");
                    ServiceStatus::Unknown
                }
            };
            statuses.insert(id, status);
        }
        statuses
    }

    /// Like [`get_services_status`](Self::get_services_status), keeping only billable statuses
    pub async fn get_billable_services_status(
        &self,
        service_ids: &[String],
    ) -> HashMap<String, ServiceStatus> {
        let mut statuses = self.get_services_status(service_ids).await;
        statuses.retain(|_, status| status.is_billable());
        statuses
    }

    pub fn get_tenant_resource_usage(&self, tenant_id: &str) -> TenantResource {
        let pods = self.listers.pods.list_namespaced(tenant_id);
        let nodes = self.listers.nodes.list();
        tenant_resource(&pods, &nodes)
    }

    /// Open aggregates of a tenant; an empty tenant id matches every tenant
    pub fn get_running_services_for_tenant(&self, tenant_id: &str) -> Vec<Arc<AppService>> {
        self.apps
            .iter()
            .filter(|entry| tenant_id.is_empty() || entry.tenant_id == tenant_id)
            .filter(|entry| !entry.is_closed())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Subscribe to pod updates; a slow listener misses updates instead of blocking watches
    pub fn register_pod_update_listener(&self, name: impl Into<String>, tx: mpsc::Sender<Arc<Pod>>) {
        let name = name.into();
        debug!(listener = %name, "Registered pod update listener");
        self.pod_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, tx);
    }

    pub fn unregister_pod_update_listener(&self, name: &str) {
        self.pod_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    fn notify_pod_listeners(&self, pod: &Arc<Pod>) {
        let listeners = self
            .pod_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for (name, tx) in listeners.iter() {
            match tx.try_send(pod.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.metrics.inc_pod_listener_drop(name);
                    debug!(listener = %name, pod = %pod.name_any(), "Pod listener full, dropping update");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(listener = %name, "Pod listener closed");
                }
            }
        }
    }

    /// Initialize every third-party service known to the platform
    pub async fn initialize_third_party_services(&self) -> Result<()> {
        let services = self.persistence.list_third_party_services().await?;
        info!(count = services.len(), "Initializing third-party services");
        for service in services {
            self.initialize_third_party_service(&service.service_id).await?;
        }
        Ok(())
    }

    /// Register, apply and start a third-party service that has an open port
    pub async fn initialize_third_party_service(&self, service_id: &str) -> Result<()> {
        if !self.persistence.has_open_port(service_id).await? {
            debug!(service_id = %service_id, "Third-party service has no open port, skipping");
            return Ok(());
        }

        let declared = self
            .persistence
            .init_app_service(service_id, &self.config.creator_id)
            .await?;
        let app = self.register_app_service(AppService::from_declared(
            declared,
            self.config.creator_id.clone(),
        ));
        self.applier.apply(&app).await?;

        let notice = StartNotice {
            service_id: service_id.to_string(),
        };
        if let Err(e) = self.start_tx.try_send(notice) {
            warn!(service_id = %service_id, error = %e, "Failed to send start notice");
        }
        info!(service_id = %service_id, "Third-party service initialized");
        Ok(())
    }
}

#[async_trait]
impl EventSink for AppRuntimeStore {
    async fn handle(&self, event: ClusterEvent) {
        self.handle_event(event).await;
    }
}

fn target<K: Resource<DynamicType = ()>>(kind: ObjectKind, obj: &K) -> (ObjectKind, String, String) {
    (kind, obj.namespace().unwrap_or_default(), obj.name_any())
}

fn attach_object(app: &AppService, obj: ClusterObject) {
    match obj {
        ClusterObject::Deployment(o) => app.set_deployment(Arc::new(o)),
        ClusterObject::StatefulSet(o) => app.set_statefulset(Arc::new(o)),
        ClusterObject::Service(o) => app.set_service(Arc::new(o)),
        ClusterObject::Ingress(o) => app.set_ingress(Arc::new(o)),
        ClusterObject::Secret(o) => app.set_secret(Arc::new(o)),
        ClusterObject::ConfigMap(o) => app.set_configmap(Arc::new(o)),
        ClusterObject::Claim(o) => app.set_claim(Arc::new(o)),
        ClusterObject::Pod(o) => app.set_pod(Arc::new(o)),
        ClusterObject::Endpoints(o) => app.set_endpoints(Arc::new(o)),
    }
}

fn detach_object(app: &AppService, kind: ObjectKind, name: &str) -> bool {
    match kind {
        ObjectKind::Deployment => app.delete_deployment(name),
        ObjectKind::StatefulSet => app.delete_statefulset(name),
        ObjectKind::ReplicaSet => app.delete_replicaset(name),
        ObjectKind::Service => app.delete_service(name),
        ObjectKind::Ingress => app.delete_ingress(name),
        ObjectKind::Secret => app.delete_secret(name),
        ObjectKind::ConfigMap => app.delete_configmap(name),
        ObjectKind::Claim => app.delete_claim(name),
        ObjectKind::Hpa => app.delete_hpa(name),
        ObjectKind::Pod => app.delete_pod(name),
        ObjectKind::Endpoints => app.delete_endpoints(name),
        ObjectKind::Node | ObjectKind::StorageClass | ObjectKind::Event => false,
    }
}
