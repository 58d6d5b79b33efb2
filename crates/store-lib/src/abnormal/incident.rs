//! Pod incident tracking
//!
//! Opens a failure event when a pod turns abnormal or not ready, closes it
//! once the pod has been running again for long enough, and records pods
//! that vanish from a running service. User-initiated actions (restarts,
//! upgrades, scaling) produce all of these transitions on purpose, so
//! nothing is recorded while one is in flight.

use crate::appservice::{pod_condition, PodCondition};
use crate::cluster::ClusterClient;
use crate::error::Result;
use crate::identity::labels;
use crate::models::{EventStatus, ServiceEvent};
use crate::persistence::{targets, Persistence};
use chrono::{Duration, Utc};
use k8s_openapi::api::core::v1::{ContainerState, Event, Pod};
use kube::ResourceExt;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Seconds a container must run before an incident counts as recovered
pub const RECOVERY_GRACE_SECS: i64 = 120;

const SYSTEM_USER: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentType {
    OomKilled,
    LivenessProbeFailed,
    ReadinessProbeFailed,
    AbnormalRecovery,
    AbnormalShutdown,
}

impl IncidentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::OomKilled => "OOMKilled",
            IncidentType::LivenessProbeFailed => "LivenessProbeFailed",
            IncidentType::ReadinessProbeFailed => "ReadinessProbeFailed",
            IncidentType::AbnormalRecovery => "AbnormalRecovery",
            IncidentType::AbnormalShutdown => "AbnormalShutdown",
        }
    }
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide why a container is failing, if it can be told from its state and the pod's events
pub fn classify_container(state: &ContainerState, events: &[Event]) -> Option<(IncidentType, String)> {
    if let Some(terminated) = state.terminated.as_ref() {
        if terminated.reason.as_deref() == Some("OOMKilled") {
            return Some((IncidentType::OomKilled, "OOMKilled".to_string()));
        }
    }
    for evt in events {
        let message = evt.message.as_deref().unwrap_or_default();
        if message.contains("Liveness probe failed") && state.waiting.is_some() {
            return Some((IncidentType::LivenessProbeFailed, message.to_string()));
        }
        if message.contains("Readiness probe failed") {
            return Some((IncidentType::ReadinessProbeFailed, message.to_string()));
        }
    }
    None
}

fn pod_identity(pod: &Pod) -> Option<(String, String)> {
    let pod_labels = pod.labels();
    let service_id = pod_labels
        .get(labels::SERVICE_ID)
        .filter(|v| !v.is_empty())?
        .clone();
    let tenant_id = pod_labels
        .get(labels::TENANT_ID)
        .filter(|v| !v.is_empty())
        .cloned()
        .or_else(|| pod.namespace())
        .unwrap_or_default();
    Some((tenant_id, service_id))
}

fn system_event(
    tenant_id: &str,
    service_id: &str,
    pod_name: &str,
    kind: IncidentType,
    status: EventStatus,
    message: String,
) -> ServiceEvent {
    let now = Utc::now();
    ServiceEvent {
        event_id: uuid::Uuid::new_v4().simple().to_string(),
        tenant_id: tenant_id.to_string(),
        service_id: service_id.to_string(),
        target: targets::POD.to_string(),
        target_id: pod_name.to_string(),
        user_name: SYSTEM_USER.to_string(),
        opt_type: kind.to_string(),
        status,
        message,
        start_time: now,
        end_time: match status {
            EventStatus::Success => Some(now),
            EventStatus::Failure => None,
        },
    }
}

/// Tracks failure and recovery of pods as service events
pub struct IncidentTracker {
    persistence: Arc<dyn Persistence>,
    cluster: Arc<dyn ClusterClient>,
}

impl IncidentTracker {
    pub fn new(persistence: Arc<dyn Persistence>, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            persistence,
            cluster,
        }
    }

    pub async fn on_pod_update(&self, pod: &Pod) -> Result<()> {
        let Some((tenant_id, service_id)) = pod_identity(pod) else {
            return Ok(());
        };
        if self.persistence.has_unfinished_user_actions(&service_id).await? {
            debug!(service_id = %service_id, "User action in flight, skipping incident tracking");
            return Ok(());
        }

        let pod_name = pod.name_any();
        let open = self.persistence.latest_failure_pod_event(&pod_name).await?;
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or(&[]);

        match pod_condition(pod) {
            PodCondition::Abnormal | PodCondition::NotReady => {
                if open.is_some() {
                    debug!(pod = %pod_name, "Incident already open");
                    return Ok(());
                }
                // pod events are only fetched when a state alone does not explain the failure
                let mut events: Option<Vec<Event>> = None;
                for cs in statuses {
                    let Some(state) = cs.state.as_ref() else {
                        continue;
                    };
                    let mut found = classify_container(state, &[]);
                    if found.is_none() {
                        if events.is_none() {
                            let namespace = pod.namespace().unwrap_or_default();
                            events = Some(self.cluster.list_pod_events(&namespace, &pod_name).await?);
                        }
                        found = classify_container(state, events.as_deref().unwrap_or(&[]));
                    }
                    if let Some((kind, message)) = found {
                        let msg = format!("container: {}; state: {}; message: {}", cs.name, kind, message);
                        self.persistence
                            .add_service_event(system_event(
                                &tenant_id,
                                &service_id,
                                &pod_name,
                                kind,
                                EventStatus::Failure,
                                msg,
                            ))
                            .await?;
                        debug!(pod = %pod_name, incident = %kind, "Opened pod incident");
                        return Ok(());
                    }
                }
                Ok(())
            }
            PodCondition::Running => {
                let Some(open) = open else {
                    return Ok(());
                };
                let now = Utc::now();
                let recovered = statuses.iter().find_map(|cs| {
                    let started = cs.state.as_ref()?.running.as_ref()?.started_at.as_ref()?;
                    let grace = Duration::seconds(RECOVERY_GRACE_SECS);
                    (now - started.0 > grace).then(|| (cs.name.clone(), started.0))
                });
                if let Some((container, started_at)) = recovered {
                    let msg = format!(
                        "container: {}; state: running; started at: {}",
                        container,
                        started_at.to_rfc3339()
                    );
                    self.persistence.close_service_event(&open.event_id, &msg).await?;
                    self.persistence
                        .add_service_event(system_event(
                            &tenant_id,
                            &service_id,
                            &pod_name,
                            IncidentType::AbnormalRecovery,
                            EventStatus::Success,
                            msg,
                        ))
                        .await?;
                    debug!(pod = %pod_name, "Pod incident recovered");
                }
                Ok(())
            }
            PodCondition::Pending => Ok(()),
        }
    }

    /// Record a pod that went away while its service was still meant to run
    pub async fn on_pod_delete(&self, pod: &Pod, service_closed: bool) -> Result<()> {
        let Some((tenant_id, service_id)) = pod_identity(pod) else {
            return Ok(());
        };
        if service_closed {
            return Ok(());
        }
        if self.persistence.has_unfinished_user_actions(&service_id).await? {
            return Ok(());
        }
        self.persistence
            .add_service_event(system_event(
                &tenant_id,
                &service_id,
                &pod.name_any(),
                IncidentType::AbnormalShutdown,
                EventStatus::Success,
                String::new(),
            ))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterObject;
    use crate::persistence::MemoryPersistence;
    use crate::watch::ObjectKind;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
        PodCondition as K8sPodCondition, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    struct EventsOnly(Vec<Event>);

    #[async_trait]
    impl ClusterClient for EventsOnly {
        async fn delete(&self, _: ObjectKind, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn get(&self, _: ObjectKind, _: &str, _: &str) -> Result<Option<ClusterObject>> {
            Ok(None)
        }
        async fn list_pod_events(&self, _: &str, _: &str) -> Result<Vec<Event>> {
            Ok(self.0.clone())
        }
    }

    fn probe_event(message: &str) -> Event {
        Event {
            message: Some(message.to_string()),
            ..Default::default()
        }
    }

    fn pod(ready: bool, state: ContainerState) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("svc-a-0".to_string()),
                namespace: Some("t1".to_string()),
                labels: Some(BTreeMap::from([
                    ("service_id".to_string(), "svc-a".to_string()),
                    ("tenant_id".to_string(), "t1".to_string()),
                ])),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                conditions: Some(vec![K8sPodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    ready,
                    state: Some(state),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn waiting() -> ContainerState {
        ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("ContainerCreating".to_string()),
                message: None,
            }),
            ..Default::default()
        }
    }

    fn running_since(minutes: i64) -> ContainerState {
        ContainerState {
            running: Some(ContainerStateRunning {
                started_at: Some(Time(Utc::now() - Duration::minutes(minutes))),
            }),
            ..Default::default()
        }
    }

    fn tracker(db: Arc<MemoryPersistence>, events: Vec<Event>) -> IncidentTracker {
        IncidentTracker::new(db, Arc::new(EventsOnly(events)))
    }

    #[test]
    fn test_classify_prefers_oom() {
        let oom = ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 137,
                reason: Some("OOMKilled".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let events = vec![probe_event("Readiness probe failed: 503")];
        assert_eq!(classify_container(&oom, &events).unwrap().0, IncidentType::OomKilled);
        assert_eq!(
            classify_container(&waiting(), &events).unwrap().0,
            IncidentType::ReadinessProbeFailed
        );
        assert_eq!(
            classify_container(&waiting(), &[probe_event("Liveness probe failed: timeout")])
                .unwrap()
                .0,
            IncidentType::LivenessProbeFailed
        );
        assert!(classify_container(&running_since(0), &[probe_event("Liveness probe failed")]).is_none());
    }

    #[tokio::test]
    async fn test_incident_opens_once_then_recovers() {
        let db = Arc::new(MemoryPersistence::new());
        let t = tracker(db.clone(), vec![probe_event("Readiness probe failed: 503")]);

        t.on_pod_update(&pod(false, waiting())).await.unwrap();
        t.on_pod_update(&pod(false, waiting())).await.unwrap();
        let events = db.service_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].opt_type, "ReadinessProbeFailed");
        assert!(events[0].is_open());

        // running, but not long enough
        t.on_pod_update(&pod(true, running_since(1))).await.unwrap();
        assert!(db.latest_failure_pod_event("svc-a-0").await.unwrap().is_some());

        t.on_pod_update(&pod(true, running_since(5))).await.unwrap();
        assert!(db.latest_failure_pod_event("svc-a-0").await.unwrap().is_none());
        let events = db.service_events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].opt_type, "AbnormalRecovery");
        assert_eq!(events[1].status, EventStatus::Success);
    }

    #[tokio::test]
    async fn test_user_action_suppresses_incidents() {
        let db = Arc::new(MemoryPersistence::new());
        db.add_service_event(ServiceEvent {
            event_id: "user-1".to_string(),
            tenant_id: "t1".to_string(),
            service_id: "svc-a".to_string(),
            target: targets::SERVICE.to_string(),
            target_id: "svc-a".to_string(),
            user_name: "admin".to_string(),
            opt_type: "restart-service".to_string(),
            status: EventStatus::Success,
            message: String::new(),
            start_time: Utc::now(),
            end_time: None,
        })
        .await
        .unwrap();
        let t = tracker(db.clone(), vec![probe_event("Readiness probe failed")]);

        t.on_pod_update(&pod(false, waiting())).await.unwrap();
        t.on_pod_delete(&pod(false, waiting()), false).await.unwrap();
        assert_eq!(db.service_events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_recorded_only_for_open_services() {
        let db = Arc::new(MemoryPersistence::new());
        let t = tracker(db.clone(), Vec::new());

        t.on_pod_delete(&pod(true, running_since(10)), true).await.unwrap();
        assert!(db.service_events().await.is_empty());

        t.on_pod_delete(&pod(true, running_since(10)), false).await.unwrap();
        let events = db.service_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].opt_type, "AbnormalShutdown");
    }
}
