//! Per-kind reconciliation of watch notifications into aggregates

use super::AppRuntimeStore;
use crate::appservice::{replicaset_drained, revision_of, AppService};
use crate::identity::{self, ServiceIdentity, VersionRule};
use crate::scaling::{scaling_record, volume_type_from, SYSTEM_OPERATOR};
use crate::watch::{ClusterEvent, ObjectKind, ResourceEvent};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, Event, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// Kinds that attach to a single aggregate slot
trait Owned: Resource + Send + Sync + Sized {
    const KIND: ObjectKind;
    const RULE: VersionRule;

    fn attach(app: &AppService, obj: Arc<Self>);
    fn detach(app: &AppService, name: &str) -> bool;
}

macro_rules! owned {
    ($ty:ty, $kind:ident, $rule:ident, $set:ident, $delete:ident) => {
        impl Owned for $ty {
            const KIND: ObjectKind = ObjectKind::$kind;
            const RULE: VersionRule = VersionRule::$rule;

            fn attach(app: &AppService, obj: Arc<Self>) {
                app.$set(obj)
            }

            fn detach(app: &AppService, name: &str) -> bool {
                app.$delete(name)
            }
        }
    };
}

owned!(Deployment, Deployment, Required, set_deployment, delete_deployment);
owned!(StatefulSet, StatefulSet, Required, set_statefulset, delete_statefulset);
owned!(ReplicaSet, ReplicaSet, Required, set_replicaset, delete_replicaset);
owned!(HorizontalPodAutoscaler, Hpa, Required, set_hpa, delete_hpa);
owned!(Pod, Pod, Required, set_pod, delete_pod);
owned!(Service, Service, Optional, set_service, delete_service);
owned!(Ingress, Ingress, Optional, set_ingress, delete_ingress);
owned!(Secret, Secret, Optional, set_secret, delete_secret);
owned!(ConfigMap, ConfigMap, Optional, set_configmap, delete_configmap);
owned!(PersistentVolumeClaim, Claim, Optional, set_claim, delete_claim);
owned!(Endpoints, Endpoints, Optional, set_endpoints, delete_endpoints);

impl AppRuntimeStore {
    pub(crate) async fn handle_event(&self, event: ClusterEvent) {
        self.metrics
            .inc_watch_event(event.kind().as_str(), event.event_type());

        match event {
            ClusterEvent::Deployment(e) => self.on_deployment(e).await,
            ClusterEvent::StatefulSet(e) => self.track(e).await,
            ClusterEvent::ReplicaSet(e) => self.on_replicaset(e).await,
            ClusterEvent::Service(e) => self.track(e).await,
            ClusterEvent::Ingress(e) => self.track(e).await,
            ClusterEvent::Secret(e) => self.track(e).await,
            ClusterEvent::ConfigMap(e) => self.track(e).await,
            ClusterEvent::Claim(e) => self.track(e).await,
            ClusterEvent::Hpa(e) => self.track(e).await,
            ClusterEvent::Pod(e) => self.on_pod(e).await,
            ClusterEvent::Endpoints(e) => self.on_endpoints(e).await,
            // the lister is all nodes need
            ClusterEvent::Node(_) => {}
            ClusterEvent::StorageClass(e) => self.on_storage_class(e).await,
            ClusterEvent::Event(e) => self.on_event(e).await,
        }
    }

    async fn track<K: Owned>(&self, event: ResourceEvent<K>) {
        self.reconcile(event).await;
    }

    /// Attach or detach one object and return the aggregate it belongs to
    async fn reconcile<K: Owned>(&self, event: ResourceEvent<K>) -> Option<Arc<AppService>> {
        match event {
            ResourceEvent::Create(obj) | ResourceEvent::Update { new: obj, .. } => {
                let identity = identity::resolve(obj.labels(), K::RULE)?;
                let creatable = obj.meta().deletion_timestamp.is_none();
                let namespace = obj.namespace().unwrap_or_default();

                // held across lookup and attach; eviction takes the same lock
                let lock = self.key_lock(&identity.service_id);
                let _guard = lock.lock().await;
                let app = self
                    .get_or_create(&identity, creatable, K::KIND, &namespace, &obj.name_any())
                    .await?;
                K::attach(&app, obj);
                Some(app)
            }
            ResourceEvent::Delete(obj) => {
                let identity = identity::resolve(obj.labels(), K::RULE)?;
                let app = self.get_app_service(&identity.service_id)?;
                if K::detach(&app, &obj.name_any()) {
                    debug!(service_id = %app.service_id, kind = %K::KIND, name = %obj.name_any(),
                        "Detached object");
                }
                self.evict_if_closed(&app).await;
                Some(app)
            }
        }
    }

    async fn on_deployment(&self, event: ResourceEvent<Deployment>) {
        let removed = matches!(event, ResourceEvent::Delete(_));
        let app = self.reconcile(event).await;
        let Some(app) = app.filter(|_| !removed) else {
            return;
        };
        // replica sets listed before their deployment were skipped on arrival
        for rs in app.get_replicasets() {
            self.cleanup_stale_replicaset(&app, &rs).await;
        }
    }

    async fn on_replicaset(&self, event: ResourceEvent<ReplicaSet>) {
        let rs = match &event {
            ResourceEvent::Delete(_) => None,
            other => Some(other.object().clone()),
        };
        let app = self.reconcile(event).await;
        if let (Some(app), Some(rs)) = (app, rs) {
            self.cleanup_stale_replicaset(&app, &rs).await;
        }
    }

    /// Delete a drained replica set from a rollout older than the deployment's
    async fn cleanup_stale_replicaset(&self, app: &AppService, rs: &ReplicaSet) {
        let Some(deployment) = app.get_deployment() else {
            return;
        };
        let (Some(current), Some(revision)) =
            (revision_of(deployment.annotations()), revision_of(rs.annotations()))
        else {
            return;
        };
        if revision >= current || !replicaset_drained(rs) {
            return;
        }

        let namespace = rs.namespace().unwrap_or_default();
        let name = rs.name_any();
        match self.cluster.delete(ObjectKind::ReplicaSet, &namespace, &name).await {
            Ok(()) => {
                app.delete_replicaset(&name);
                self.metrics.inc_stale_replicaset_deleted();
                self.logger
                    .log_stale_replicaset(&namespace, &name, &app.service_id);
            }
            Err(e) => {
                warn!(namespace = %namespace, name = %name, error = %e,
                    "Failed to delete stale replica set");
            }
        }
    }

    async fn on_pod(&self, event: ResourceEvent<Pod>) {
        match event {
            ResourceEvent::Create(pod) => {
                self.reconcile(ResourceEvent::Create(pod)).await;
            }
            ResourceEvent::Update { old, new } => {
                self.reconcile(ResourceEvent::Update {
                    old,
                    new: new.clone(),
                })
                .await;

                self.notify_pod_listeners(&new);
                self.detector.on_pod_update(&new).await;
                if let Err(e) = self.incidents.on_pod_update(&new).await {
                    warn!(pod = %new.name_any(), error = %e, "Failed to track pod incident");
                }
            }
            ResourceEvent::Delete(pod) => {
                self.reconcile(ResourceEvent::Delete(pod.clone())).await;

                let service_closed = pod
                    .labels()
                    .get(identity::labels::SERVICE_ID)
                    .and_then(|sid| self.get_app_service(sid))
                    .map(|app| app.is_closed())
                    .unwrap_or(true);
                if let Err(e) = self.incidents.on_pod_delete(&pod, service_closed).await {
                    warn!(pod = %pod.name_any(), error = %e, "Failed to record pod shutdown");
                }
            }
        }
    }

    async fn on_endpoints(&self, event: ResourceEvent<Endpoints>) {
        let third_party = identity::is_third_party(event.object().labels());
        let probe_event = third_party.then(|| event.clone());
        let is_delete = matches!(event, ResourceEvent::Delete(_));
        let resolved = identity::resolve(event.object().labels(), VersionRule::Optional)
            .map(|id| (self.get_app_service(&id.service_id).is_some(), id));

        // orphaned endpoints are left alone: the service controller owns them
        let app = match resolved {
            None => None,
            Some((true, _)) => self.reconcile(event).await,
            Some((false, _)) if is_delete => None,
            Some((false, id)) => self.adopt_endpoints(&id, event.object()).await,
        };

        let (Some(app), Some(probe_event)) = (app, probe_event) else {
            return;
        };
        match probe_event {
            ResourceEvent::Create(ep) => self.probes.on_create(&ep, &app.service_id),
            ResourceEvent::Update { old, new } => self.probes.on_update(&old, &new, &app.service_id),
            ResourceEvent::Delete(ep) => self.probes.on_delete(&ep, &app.service_id),
        }
    }

    /// Build an aggregate for endpoints without deleting them when the service is unknown
    async fn adopt_endpoints(
        &self,
        identity: &ServiceIdentity,
        ep: &Arc<Endpoints>,
    ) -> Option<Arc<AppService>> {
        if ep.meta().deletion_timestamp.is_some() {
            return None;
        }
        let service_id = identity.service_id.as_str();
        let lock = self.key_lock(service_id);
        let _guard = lock.lock().await;
        if let Some(app) = self.get_app_service(service_id) {
            app.set_endpoints(ep.clone());
            return Some(app);
        }
        match self
            .persistence
            .init_app_service(service_id, &identity.creator_id)
            .await
        {
            Ok(declared) => {
                let mut app = AppService::from_declared(declared, identity.creator_id.clone());
                if app.tenant_id.is_empty() {
                    app.tenant_id = ep.namespace().unwrap_or_default();
                }
                app.set_endpoints(ep.clone());
                Some(self.register_app_service(app))
            }
            Err(e) => {
                debug!(service_id = %service_id, endpoints = %ep.name_any(), error = %e,
                    "Endpoints of an unknown service, ignoring");
                None
            }
        }
    }

    async fn on_storage_class(&self, event: ResourceEvent<StorageClass>) {
        let result = match &event {
            ResourceEvent::Create(sc) | ResourceEvent::Update { new: sc, .. } => {
                self.persistence.upsert_volume_type(volume_type_from(sc)).await
            }
            ResourceEvent::Delete(sc) => self.persistence.delete_volume_type(&sc.name_any()).await,
        };
        if let Err(e) = result {
            warn!(storage_class = %event.object().name_any(), error = %e,
                "Failed to sync volume type");
        }
    }

    async fn on_event(&self, event: ResourceEvent<Event>) {
        let record = match &event {
            ResourceEvent::Create(evt) => scaling_record(evt, &self.listers, Some(SYSTEM_OPERATOR)),
            ResourceEvent::Update { old, new } => {
                if old.resource_version() == new.resource_version() {
                    return;
                }
                scaling_record(new, &self.listers, None)
            }
            ResourceEvent::Delete(_) => None,
        };
        let Some(record) = record else {
            return;
        };
        if let Err(e) = self.persistence.upsert_scaling_record(record).await {
            warn!(event = %event.object().name_any(), error = %e, "Failed to upsert scaling record");
        }
    }
}
