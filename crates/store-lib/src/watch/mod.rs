//! Watch multiplexer
//!
//! One watch stream per tracked kind, each feeding its own [`ObjectCache`]
//! and forwarding the resulting notifications to a shared [`EventSink`].
//! Ordering holds per object within a kind; nothing is ordered across kinds.

mod cache;

pub use cache::{object_key, ObjectCache};

use crate::observability::StoreMetrics;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, Event, Node, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A change to one watched object
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    Create(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete(Arc<K>),
}

impl<K> ResourceEvent<K> {
    pub fn event_type(&self) -> &'static str {
        match self {
            ResourceEvent::Create(_) => "create",
            ResourceEvent::Update { .. } => "update",
            ResourceEvent::Delete(_) => "delete",
        }
    }

    /// The object as it is now (or was, for a delete)
    pub fn object(&self) -> &Arc<K> {
        match self {
            ResourceEvent::Create(obj) | ResourceEvent::Delete(obj) => obj,
            ResourceEvent::Update { new, .. } => new,
        }
    }
}

/// Every kind the store watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Deployment,
    StatefulSet,
    ReplicaSet,
    Service,
    Ingress,
    Secret,
    ConfigMap,
    Claim,
    Hpa,
    Pod,
    Endpoints,
    Node,
    StorageClass,
    Event,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 14] = [
        ObjectKind::Deployment,
        ObjectKind::StatefulSet,
        ObjectKind::ReplicaSet,
        ObjectKind::Service,
        ObjectKind::Ingress,
        ObjectKind::Secret,
        ObjectKind::ConfigMap,
        ObjectKind::Claim,
        ObjectKind::Hpa,
        ObjectKind::Pod,
        ObjectKind::Endpoints,
        ObjectKind::Node,
        ObjectKind::StorageClass,
        ObjectKind::Event,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Deployment => "Deployment",
            ObjectKind::StatefulSet => "StatefulSet",
            ObjectKind::ReplicaSet => "ReplicaSet",
            ObjectKind::Service => "Service",
            ObjectKind::Ingress => "Ingress",
            ObjectKind::Secret => "Secret",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::Claim => "PersistentVolumeClaim",
            ObjectKind::Hpa => "HorizontalPodAutoscaler",
            ObjectKind::Pod => "Pod",
            ObjectKind::Endpoints => "Endpoints",
            ObjectKind::Node => "Node",
            ObjectKind::StorageClass => "StorageClass",
            ObjectKind::Event => "Event",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification tagged with its kind
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    Deployment(ResourceEvent<Deployment>),
    StatefulSet(ResourceEvent<StatefulSet>),
    ReplicaSet(ResourceEvent<ReplicaSet>),
    Service(ResourceEvent<Service>),
    Ingress(ResourceEvent<Ingress>),
    Secret(ResourceEvent<Secret>),
    ConfigMap(ResourceEvent<ConfigMap>),
    Claim(ResourceEvent<PersistentVolumeClaim>),
    Hpa(ResourceEvent<HorizontalPodAutoscaler>),
    Pod(ResourceEvent<Pod>),
    Endpoints(ResourceEvent<Endpoints>),
    Node(ResourceEvent<Node>),
    StorageClass(ResourceEvent<StorageClass>),
    Event(ResourceEvent<Event>),
}

impl ClusterEvent {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ClusterEvent::Deployment(_) => ObjectKind::Deployment,
            ClusterEvent::StatefulSet(_) => ObjectKind::StatefulSet,
            ClusterEvent::ReplicaSet(_) => ObjectKind::ReplicaSet,
            ClusterEvent::Service(_) => ObjectKind::Service,
            ClusterEvent::Ingress(_) => ObjectKind::Ingress,
            ClusterEvent::Secret(_) => ObjectKind::Secret,
            ClusterEvent::ConfigMap(_) => ObjectKind::ConfigMap,
            ClusterEvent::Claim(_) => ObjectKind::Claim,
            ClusterEvent::Hpa(_) => ObjectKind::Hpa,
            ClusterEvent::Pod(_) => ObjectKind::Pod,
            ClusterEvent::Endpoints(_) => ObjectKind::Endpoints,
            ClusterEvent::Node(_) => ObjectKind::Node,
            ClusterEvent::StorageClass(_) => ObjectKind::StorageClass,
            ClusterEvent::Event(_) => ObjectKind::Event,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ClusterEvent::Deployment(e) => e.event_type(),
            ClusterEvent::StatefulSet(e) => e.event_type(),
            ClusterEvent::ReplicaSet(e) => e.event_type(),
            ClusterEvent::Service(e) => e.event_type(),
            ClusterEvent::Ingress(e) => e.event_type(),
            ClusterEvent::Secret(e) => e.event_type(),
            ClusterEvent::ConfigMap(e) => e.event_type(),
            ClusterEvent::Claim(e) => e.event_type(),
            ClusterEvent::Hpa(e) => e.event_type(),
            ClusterEvent::Pod(e) => e.event_type(),
            ClusterEvent::Endpoints(e) => e.event_type(),
            ClusterEvent::Node(e) => e.event_type(),
            ClusterEvent::StorageClass(e) => e.event_type(),
            ClusterEvent::Event(e) => e.event_type(),
        }
    }
}

/// Consumer of change notifications from every watch task
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, event: ClusterEvent);
}

/// Read-only listers over every watched kind
#[derive(Debug)]
pub struct Listers {
    pub deployments: Arc<ObjectCache<Deployment>>,
    pub statefulsets: Arc<ObjectCache<StatefulSet>>,
    pub replicasets: Arc<ObjectCache<ReplicaSet>>,
    pub services: Arc<ObjectCache<Service>>,
    pub ingresses: Arc<ObjectCache<Ingress>>,
    pub secrets: Arc<ObjectCache<Secret>>,
    pub configmaps: Arc<ObjectCache<ConfigMap>>,
    pub claims: Arc<ObjectCache<PersistentVolumeClaim>>,
    pub hpas: Arc<ObjectCache<HorizontalPodAutoscaler>>,
    pub pods: Arc<ObjectCache<Pod>>,
    pub endpoints: Arc<ObjectCache<Endpoints>>,
    pub nodes: Arc<ObjectCache<Node>>,
    pub storage_classes: Arc<ObjectCache<StorageClass>>,
    pub events: Arc<ObjectCache<Event>>,
}

impl Default for Listers {
    fn default() -> Self {
        Self::new()
    }
}

impl Listers {
    pub fn new() -> Self {
        Self {
            deployments: Arc::new(ObjectCache::new(ObjectKind::Deployment)),
            statefulsets: Arc::new(ObjectCache::new(ObjectKind::StatefulSet)),
            replicasets: Arc::new(ObjectCache::new(ObjectKind::ReplicaSet)),
            services: Arc::new(ObjectCache::new(ObjectKind::Service)),
            ingresses: Arc::new(ObjectCache::new(ObjectKind::Ingress)),
            secrets: Arc::new(ObjectCache::new(ObjectKind::Secret)),
            configmaps: Arc::new(ObjectCache::new(ObjectKind::ConfigMap)),
            claims: Arc::new(ObjectCache::new(ObjectKind::Claim)),
            hpas: Arc::new(ObjectCache::new(ObjectKind::Hpa)),
            pods: Arc::new(ObjectCache::new(ObjectKind::Pod)),
            endpoints: Arc::new(ObjectCache::new(ObjectKind::Endpoints)),
            nodes: Arc::new(ObjectCache::new(ObjectKind::Node)),
            storage_classes: Arc::new(ObjectCache::new(ObjectKind::StorageClass)),
            events: Arc::new(ObjectCache::new(ObjectKind::Event)),
        }
    }

    fn sync_flags(&self) -> [(ObjectKind, bool); 14] {
        [
            (ObjectKind::Deployment, self.deployments.is_synced()),
            (ObjectKind::StatefulSet, self.statefulsets.is_synced()),
            (ObjectKind::ReplicaSet, self.replicasets.is_synced()),
            (ObjectKind::Service, self.services.is_synced()),
            (ObjectKind::Ingress, self.ingresses.is_synced()),
            (ObjectKind::Secret, self.secrets.is_synced()),
            (ObjectKind::ConfigMap, self.configmaps.is_synced()),
            (ObjectKind::Claim, self.claims.is_synced()),
            (ObjectKind::Hpa, self.hpas.is_synced()),
            (ObjectKind::Pod, self.pods.is_synced()),
            (ObjectKind::Endpoints, self.endpoints.is_synced()),
            (ObjectKind::Node, self.nodes.is_synced()),
            (ObjectKind::StorageClass, self.storage_classes.is_synced()),
            (ObjectKind::Event, self.events.is_synced()),
        ]
    }

    /// Kinds that have not completed their initial listing
    pub fn unsynced_kinds(&self) -> Vec<ObjectKind> {
        self.sync_flags()
            .into_iter()
            .filter(|(_, synced)| !synced)
            .map(|(kind, _)| kind)
            .collect()
    }

    pub fn is_synced(&self) -> bool {
        self.sync_flags().iter().all(|(_, synced)| *synced)
    }

    /// Mark every kind synced without a cluster (tests, offline runs)
    pub fn mark_all_synced(&self) {
        self.deployments.mark_synced();
        self.statefulsets.mark_synced();
        self.replicasets.mark_synced();
        self.services.mark_synced();
        self.ingresses.mark_synced();
        self.secrets.mark_synced();
        self.configmaps.mark_synced();
        self.claims.mark_synced();
        self.hpas.mark_synced();
        self.pods.mark_synced();
        self.endpoints.mark_synced();
        self.nodes.mark_synced();
        self.storage_classes.mark_synced();
        self.events.mark_synced();
    }
}

/// Spawns and owns one watch task per kind
pub struct WatchMultiplexer {
    client: Client,
    listers: Arc<Listers>,
}

impl WatchMultiplexer {
    pub fn new(client: Client, listers: Arc<Listers>) -> Self {
        Self { client, listers }
    }

    /// Start every watch task; all of them stop on the shutdown signal
    pub fn spawn(
        &self,
        sink: Arc<dyn EventSink>,
        shutdown: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        let l = &self.listers;
        vec![
            self.spawn_kind(l.deployments.clone(), ClusterEvent::Deployment, &sink, shutdown),
            self.spawn_kind(l.statefulsets.clone(), ClusterEvent::StatefulSet, &sink, shutdown),
            self.spawn_kind(l.replicasets.clone(), ClusterEvent::ReplicaSet, &sink, shutdown),
            self.spawn_kind(l.services.clone(), ClusterEvent::Service, &sink, shutdown),
            self.spawn_kind(l.ingresses.clone(), ClusterEvent::Ingress, &sink, shutdown),
            self.spawn_kind(l.secrets.clone(), ClusterEvent::Secret, &sink, shutdown),
            self.spawn_kind(l.configmaps.clone(), ClusterEvent::ConfigMap, &sink, shutdown),
            self.spawn_kind(l.claims.clone(), ClusterEvent::Claim, &sink, shutdown),
            self.spawn_kind(l.hpas.clone(), ClusterEvent::Hpa, &sink, shutdown),
            self.spawn_kind(l.pods.clone(), ClusterEvent::Pod, &sink, shutdown),
            self.spawn_kind(l.endpoints.clone(), ClusterEvent::Endpoints, &sink, shutdown),
            self.spawn_kind(l.nodes.clone(), ClusterEvent::Node, &sink, shutdown),
            self.spawn_kind(l.storage_classes.clone(), ClusterEvent::StorageClass, &sink, shutdown),
            self.spawn_kind(l.events.clone(), ClusterEvent::Event, &sink, shutdown),
        ]
    }

    fn spawn_kind<K>(
        &self,
        cache: Arc<ObjectCache<K>>,
        wrap: fn(ResourceEvent<K>) -> ClusterEvent,
        sink: &Arc<dyn EventSink>,
        shutdown: &broadcast::Sender<()>,
    ) -> JoinHandle<()>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    {
        let api: Api<K> = Api::all(self.client.clone());
        tokio::spawn(run_watch(api, cache, wrap, sink.clone(), shutdown.subscribe()))
    }
}

async fn run_watch<K>(
    api: Api<K>,
    cache: Arc<ObjectCache<K>>,
    wrap: fn(ResourceEvent<K>) -> ClusterEvent,
    sink: Arc<dyn EventSink>,
    mut shutdown: broadcast::Receiver<()>,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    let kind = cache.kind();
    let metrics = StoreMetrics::new();
    info!(kind = %kind, "Starting watch");

    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    let was_synced = cache.is_synced();
                    for change in cache.apply(event) {
                        sink.handle(wrap(change)).await;
                    }
                    if !was_synced && cache.is_synced() {
                        info!(kind = %kind, objects = cache.len(), "Initial listing complete");
                    }
                }
                Some(Err(e)) => {
                    metrics.inc_watch_error(kind.as_str());
                    warn!(kind = %kind, error = %e, "Watch stream error, retrying with backoff");
                }
                None => {
                    warn!(kind = %kind, "Watch stream ended");
                    break;
                }
            },
            _ = shutdown.recv() => {
                debug!(kind = %kind, "Stopping watch");
                break;
            }
        }
    }
}
