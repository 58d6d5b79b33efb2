//! The AppService aggregate
//!
//! Holds every cached Kubernetes object belonging to one platform service.
//! Each kind lives behind its own lock so watchers for different kinds never
//! contend; status is derived lazily and memoized until the next mutation.

mod status;

pub use status::{derive_status, pod_condition, pod_is_abnormal, pod_is_ready, PodCondition};

use crate::models::{BuildState, DeclaredService, ServiceKind, ServiceStatus};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Annotation carrying the rollout revision of deployments and replica sets
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// The single workload controller of a service
#[derive(Debug, Clone)]
pub enum Controller {
    Deployment(Arc<Deployment>),
    StatefulSet(Arc<StatefulSet>),
}

impl Controller {
    pub fn name(&self) -> String {
        match self {
            Controller::Deployment(d) => d.name_any(),
            Controller::StatefulSet(s) => s.name_any(),
        }
    }

    /// Desired replicas, defaulting to 1 like the API server does
    pub fn desired_replicas(&self) -> i32 {
        match self {
            Controller::Deployment(d) => d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            Controller::StatefulSet(s) => s.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
        }
    }

    pub fn ready_replicas(&self) -> i32 {
        match self {
            Controller::Deployment(d) => d.status.as_ref().and_then(|s| s.ready_replicas),
            Controller::StatefulSet(s) => s.status.as_ref().and_then(|s| s.ready_replicas),
        }
        .unwrap_or(0)
    }

    /// Replicas already running the latest template
    pub fn updated_replicas(&self) -> Option<i32> {
        match self {
            Controller::Deployment(d) => d.status.as_ref().and_then(|s| s.updated_replicas),
            Controller::StatefulSet(s) => s.status.as_ref().and_then(|s| s.updated_replicas),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

type NamedSet<K> = RwLock<BTreeMap<String, Arc<K>>>;

macro_rules! named_set_accessors {
    ($field:ident, $ty:ty, $set:ident, $delete:ident, $get:ident) => {
        pub fn $set(&self, obj: Arc<$ty>) {
            write(&self.$field).insert(obj.name_any(), obj);
            self.mark_changed();
        }

        /// Returns true if an object with this name was cached
        pub fn $delete(&self, name: &str) -> bool {
            let removed = write(&self.$field).remove(name).is_some();
            if removed {
                self.mark_changed();
            }
            removed
        }

        pub fn $get(&self) -> Vec<Arc<$ty>> {
            read(&self.$field).values().cloned().collect()
        }
    };
}

/// Cached composite of all cluster objects of one platform service
#[derive(Debug)]
pub struct AppService {
    pub service_id: String,
    pub tenant_id: String,
    pub service_alias: String,
    pub kind: ServiceKind,
    pub creator_id: String,
    build_state: Option<BuildState>,
    generation: AtomicU64,

    controller: RwLock<Option<Controller>>,
    hpa: RwLock<Option<Arc<HorizontalPodAutoscaler>>>,
    replicasets: NamedSet<ReplicaSet>,
    pods: NamedSet<Pod>,
    services: NamedSet<Service>,
    ingresses: NamedSet<Ingress>,
    secrets: NamedSet<Secret>,
    configmaps: NamedSet<ConfigMap>,
    claims: NamedSet<PersistentVolumeClaim>,
    endpoints: NamedSet<Endpoints>,

    revision: AtomicU64,
    status_memo: Mutex<Option<(u64, ServiceStatus)>>,
}

impl AppService {
    pub fn new(service_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            tenant_id: tenant_id.into(),
            service_alias: String::new(),
            kind: ServiceKind::Internal,
            creator_id: String::new(),
            build_state: None,
            generation: AtomicU64::new(0),
            controller: RwLock::new(None),
            hpa: RwLock::new(None),
            replicasets: RwLock::default(),
            pods: RwLock::default(),
            services: RwLock::default(),
            ingresses: RwLock::default(),
            secrets: RwLock::default(),
            configmaps: RwLock::default(),
            claims: RwLock::default(),
            endpoints: RwLock::default(),
            revision: AtomicU64::new(0),
            status_memo: Mutex::new(None),
        }
    }

    /// Build an empty aggregate from the declared state of a service
    pub fn from_declared(declared: DeclaredService, creator_id: impl Into<String>) -> Self {
        let mut app = Self::new(declared.service_id, declared.tenant_id);
        app.service_alias = declared.service_alias;
        app.kind = declared.kind;
        app.build_state = declared.build_state;
        app.creator_id = creator_id.into();
        app
    }

    pub fn is_third_party(&self) -> bool {
        self.kind == ServiceKind::ThirdParty
    }

    pub fn build_state(&self) -> Option<BuildState> {
        self.build_state
    }

    /// Registration generation assigned by the store
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    fn mark_changed(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    // --- workload controller ---

    pub fn controller(&self) -> Option<Controller> {
        read(&self.controller).clone()
    }

    /// Replaces any statefulset: a service runs one controller type at a time
    pub fn set_deployment(&self, deployment: Arc<Deployment>) {
        *write(&self.controller) = Some(Controller::Deployment(deployment));
        self.mark_changed();
    }

    pub fn set_statefulset(&self, statefulset: Arc<StatefulSet>) {
        *write(&self.controller) = Some(Controller::StatefulSet(statefulset));
        self.mark_changed();
    }

    pub fn get_deployment(&self) -> Option<Arc<Deployment>> {
        match read(&self.controller).as_ref() {
            Some(Controller::Deployment(d)) => Some(d.clone()),
            _ => None,
        }
    }

    pub fn get_statefulset(&self) -> Option<Arc<StatefulSet>> {
        match read(&self.controller).as_ref() {
            Some(Controller::StatefulSet(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Only clears the slot if it still holds a deployment of that name
    pub fn delete_deployment(&self, name: &str) -> bool {
        let mut slot = write(&self.controller);
        let matches = matches!(slot.as_ref(), Some(Controller::Deployment(d)) if d.name_any() == name);
        if matches {
            *slot = None;
            drop(slot);
            self.mark_changed();
        }
        matches
    }

    pub fn delete_statefulset(&self, name: &str) -> bool {
        let mut slot = write(&self.controller);
        let matches =
            matches!(slot.as_ref(), Some(Controller::StatefulSet(s)) if s.name_any() == name);
        if matches {
            *slot = None;
            drop(slot);
            self.mark_changed();
        }
        matches
    }

    // --- hpa ---

    pub fn set_hpa(&self, hpa: Arc<HorizontalPodAutoscaler>) {
        *write(&self.hpa) = Some(hpa);
        self.mark_changed();
    }

    pub fn get_hpa(&self) -> Option<Arc<HorizontalPodAutoscaler>> {
        read(&self.hpa).clone()
    }

    pub fn delete_hpa(&self, name: &str) -> bool {
        let mut slot = write(&self.hpa);
        let matches = slot.as_ref().map(|h| h.name_any() == name).unwrap_or(false);
        if matches {
            *slot = None;
            drop(slot);
            self.mark_changed();
        }
        matches
    }

    // --- named sets ---

    named_set_accessors!(replicasets, ReplicaSet, set_replicaset, delete_replicaset, get_replicasets);
    named_set_accessors!(pods, Pod, set_pod, delete_pod, get_pods);
    named_set_accessors!(services, Service, set_service, delete_service, get_services);
    named_set_accessors!(ingresses, Ingress, set_ingress, delete_ingress, get_ingresses);
    named_set_accessors!(secrets, Secret, set_secret, delete_secret, get_secrets);
    named_set_accessors!(configmaps, ConfigMap, set_configmap, delete_configmap, get_configmaps);
    named_set_accessors!(claims, PersistentVolumeClaim, set_claim, delete_claim, get_claims);
    named_set_accessors!(endpoints, Endpoints, set_endpoints, delete_endpoints, get_endpoints);

    pub fn pod_count(&self) -> usize {
        read(&self.pods).len()
    }

    /// The replica set of the deployment's current rollout revision
    pub fn current_replicaset(&self) -> Option<Arc<ReplicaSet>> {
        let deployment = self.get_deployment()?;
        let replicasets = read(&self.replicasets);
        match revision_of(deployment.annotations()) {
            Some(rev) => replicasets
                .values()
                .find(|rs| revision_of(rs.annotations()) == Some(rev))
                .cloned(),
            None => replicasets
                .values()
                .filter(|rs| revision_of(rs.annotations()).is_some())
                .max_by_key(|rs| revision_of(rs.annotations()))
                .cloned(),
        }
    }

    /// Closed aggregates hold nothing worth caching and may be evicted
    pub fn is_closed(&self) -> bool {
        if self.is_third_party() {
            return read(&self.endpoints).is_empty();
        }
        read(&self.controller).is_none() && read(&self.pods).is_empty()
    }

    /// Current lifecycle status, memoized until the next mutation
    pub fn status(&self) -> ServiceStatus {
        let revision = self.revision.load(Ordering::Acquire);
        let mut memo = self.status_memo.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((rev, status)) = *memo {
            if rev == revision {
                return status;
            }
        }
        let status = derive_status(self);
        *memo = Some((revision, status));
        status
    }
}

/// Parse the rollout revision annotation
pub fn revision_of(annotations: &BTreeMap<String, String>) -> Option<i64> {
    annotations
        .get(REVISION_ANNOTATION)
        .and_then(|v| v.trim().parse().ok())
}

/// A replica set with no replicas desired, ready or available
pub fn replicaset_drained(rs: &ReplicaSet) -> bool {
    match rs.status.as_ref() {
        Some(s) => {
            s.replicas == 0
                && s.ready_replicas.unwrap_or(0) == 0
                && s.available_replicas.unwrap_or(0) == 0
        }
        None => true,
    }
}
