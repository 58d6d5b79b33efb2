//! Kubernetes API collaborators
//!
//! The store talks to the API server only to delete objects it does not
//! want, to refresh an aggregate that looks stale and to read pod events.
//! Everything else comes from the watch caches.

use crate::appservice::AppService;
use crate::error::{is_kube_not_found, Result};
use crate::watch::ObjectKind;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, Event, Node, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, ListParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::{debug, info};

/// A freshly read object of one of the kinds an aggregate is refreshed from
#[derive(Debug, Clone)]
pub enum ClusterObject {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    Service(Service),
    Ingress(Ingress),
    Secret(Secret),
    ConfigMap(ConfigMap),
    Claim(PersistentVolumeClaim),
    Pod(Pod),
    Endpoints(Endpoints),
}

/// Direct API server access used outside the watch path
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Delete an object; an object that is already gone counts as deleted
    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()>;

    /// Read an object bypassing the watch caches
    async fn get(&self, kind: ObjectKind, namespace: &str, name: &str)
        -> Result<Option<ClusterObject>>;

    /// Events whose involved object is the given pod
    async fn list_pod_events(&self, namespace: &str, pod_name: &str) -> Result<Vec<Event>>;
}

/// Applies the cluster objects of a newly initialized aggregate
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, app: &AppService) -> Result<()>;
}

/// Applier for deployments where rendering lives in another component
#[derive(Debug, Default, Clone)]
pub struct LoggingApplier;

#[async_trait]
impl Applier for LoggingApplier {
    async fn apply(&self, app: &AppService) -> Result<()> {
        info!(
            service_id = %app.service_id,
            tenant_id = %app.tenant_id,
            endpoints = app.get_endpoints().len(),
            "Third-party service ready to apply"
        );
        Ok(())
    }
}

/// [`ClusterClient`] backed by a kube client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn delete_namespaced<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_kube_not_found(&e) => {
                debug!(namespace = %namespace, name = %name, "Object already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_cluster_scoped<K>(&self, name: &str) -> Result<()>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_kube_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_namespaced<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> Result<()> {
        match kind {
            ObjectKind::Deployment => self.delete_namespaced::<Deployment>(namespace, name).await,
            ObjectKind::StatefulSet => self.delete_namespaced::<StatefulSet>(namespace, name).await,
            ObjectKind::ReplicaSet => self.delete_namespaced::<ReplicaSet>(namespace, name).await,
            ObjectKind::Service => self.delete_namespaced::<Service>(namespace, name).await,
            ObjectKind::Ingress => self.delete_namespaced::<Ingress>(namespace, name).await,
            ObjectKind::Secret => self.delete_namespaced::<Secret>(namespace, name).await,
            ObjectKind::ConfigMap => self.delete_namespaced::<ConfigMap>(namespace, name).await,
            ObjectKind::Claim => {
                self.delete_namespaced::<PersistentVolumeClaim>(namespace, name)
                    .await
            }
            ObjectKind::Hpa => {
                self.delete_namespaced::<HorizontalPodAutoscaler>(namespace, name)
                    .await
            }
            ObjectKind::Pod => self.delete_namespaced::<Pod>(namespace, name).await,
            ObjectKind::Endpoints => self.delete_namespaced::<Endpoints>(namespace, name).await,
            ObjectKind::Event => self.delete_namespaced::<Event>(namespace, name).await,
            ObjectKind::Node => self.delete_cluster_scoped::<Node>(name).await,
            ObjectKind::StorageClass => self.delete_cluster_scoped::<StorageClass>(name).await,
        }
    }

    async fn get(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterObject>> {
        let obj = match kind {
            ObjectKind::Deployment => self
                .get_namespaced(namespace, name)
                .await?
                .map(ClusterObject::Deployment),
            ObjectKind::StatefulSet => self
                .get_namespaced(namespace, name)
                .await?
                .map(ClusterObject::StatefulSet),
            ObjectKind::Service => self
                .get_namespaced(namespace, name)
                .await?
                .map(ClusterObject::Service),
            ObjectKind::Ingress => self
                .get_namespaced(namespace, name)
                .await?
                .map(ClusterObject::Ingress),
            ObjectKind::Secret => self
                .get_namespaced(namespace, name)
                .await?
                .map(ClusterObject::Secret),
            ObjectKind::ConfigMap => self
                .get_namespaced(namespace, name)
                .await?
                .map(ClusterObject::ConfigMap),
            ObjectKind::Claim => self
                .get_namespaced(namespace, name)
                .await?
                .map(ClusterObject::Claim),
            ObjectKind::Pod => self
                .get_namespaced(namespace, name)
                .await?
                .map(ClusterObject::Pod),
            ObjectKind::Endpoints => self
                .get_namespaced(namespace, name)
                .await?
                .map(ClusterObject::Endpoints),
            other => {
                debug!(kind = %other, "Direct reads not supported for kind");
                None
            }
        };
        Ok(obj)
    }

    async fn list_pod_events(&self, namespace: &str, pod_name: &str) -> Result<Vec<Event>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!(
            "involvedObject.kind=Pod,involvedObject.name={},involvedObject.namespace={}",
            pod_name, namespace
        );
        let events = api.list(&ListParams::default().fields(&selector)).await?;
        Ok(events.items)
    }
}
