//! Lifecycle status derivation

use super::{AppService, Controller};
use crate::models::{BuildState, ServiceStatus};
use k8s_openapi::api::core::v1::{ContainerStatus, Endpoints, Pod};

/// Waiting reasons that mean the container cannot make progress on its own
const ABNORMAL_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "RunContainerError",
];

/// Coarse pod state used by the incident tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodCondition {
    /// Scheduled but containers not started yet
    Pending,
    Running,
    NotReady,
    Abnormal,
}

fn container_statuses(pod: &Pod) -> &[ContainerStatus] {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or(&[])
}

/// True when the pod reports condition Ready=True
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn container_is_abnormal(cs: &ContainerStatus) -> bool {
    let Some(state) = cs.state.as_ref() else {
        return false;
    };
    if let Some(waiting) = state.waiting.as_ref() {
        let reason = waiting.reason.as_deref().unwrap_or_default();
        if ABNORMAL_WAITING_REASONS.contains(&reason) {
            return true;
        }
    }
    if let Some(terminated) = state.terminated.as_ref() {
        return terminated.exit_code != 0
            || terminated.reason.as_deref() == Some("OOMKilled");
    }
    false
}

/// True when any container is crash looping, failing to pull or was killed
pub fn pod_is_abnormal(pod: &Pod) -> bool {
    if pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed") {
        return true;
    }
    container_statuses(pod).iter().any(container_is_abnormal)
}

pub fn pod_condition(pod: &Pod) -> PodCondition {
    if pod_is_abnormal(pod) {
        return PodCondition::Abnormal;
    }
    if container_statuses(pod).is_empty() {
        return PodCondition::Pending;
    }
    if pod_is_ready(pod) {
        PodCondition::Running
    } else {
        PodCondition::NotReady
    }
}

fn endpoints_have_ready_address(ep: &Endpoints) -> bool {
    ep.subsets
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .any(|s| s.addresses.as_ref().map(|a| !a.is_empty()).unwrap_or(false))
}

fn third_party_status(app: &AppService) -> ServiceStatus {
    let endpoints = app.get_endpoints();
    if endpoints.is_empty() {
        return ServiceStatus::Closed;
    }
    if endpoints.iter().any(|ep| endpoints_have_ready_address(ep)) {
        ServiceStatus::Running
    } else {
        ServiceStatus::Abnormal
    }
}

/// Derive the lifecycle status of an aggregate from its cached objects
pub fn derive_status(app: &AppService) -> ServiceStatus {
    if app.is_third_party() {
        return third_party_status(app);
    }

    let pods = app.get_pods();
    let controller: Option<Controller> = app.controller();

    let Some(controller) = controller else {
        if !pods.is_empty() {
            return ServiceStatus::Stopping;
        }
        return match app.build_state() {
            Some(BuildState::Building) => ServiceStatus::Building,
            Some(BuildState::Failed) => ServiceStatus::BuildFailure,
            None => ServiceStatus::Closed,
        };
    };

    let desired = controller.desired_replicas();
    if desired == 0 {
        return if pods.is_empty() {
            ServiceStatus::Closed
        } else {
            ServiceStatus::Stopping
        };
    }

    if pods.is_empty() && controller.ready_replicas() > 0 {
        // the controller has seen pods the cache has not
        return ServiceStatus::Unknown;
    }

    let ready = pods.iter().filter(|p| pod_is_ready(p)).count() as i32;
    if pods.iter().any(|p| pod_is_abnormal(p)) {
        return if ready > 0 {
            ServiceStatus::SomeAbnormal
        } else {
            ServiceStatus::Abnormal
        };
    }

    if ready >= desired {
        let rolling = controller
            .updated_replicas()
            .map(|updated| updated < desired)
            .unwrap_or(false);
        if rolling {
            return ServiceStatus::Upgrading;
        }
        return ServiceStatus::Running;
    }

    ServiceStatus::Starting
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeclaredService, ServiceKind};
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, EndpointAddress,
        EndpointSubset, PodCondition as K8sPodCondition, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    fn named(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn deployment(replicas: i32, ready: i32, updated: Option<i32>) -> Arc<Deployment> {
        Arc::new(Deployment {
            metadata: named("svc-a"),
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                ready_replicas: Some(ready),
                updated_replicas: updated,
                ..Default::default()
            }),
        })
    }

    fn pod(name: &str, ready: bool, state: Option<ContainerState>) -> Arc<Pod> {
        Arc::new(Pod {
            metadata: named(name),
            spec: None,
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![K8sPodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                container_statuses: Some(vec![ContainerStatus {
                    name: "app".to_string(),
                    ready,
                    state,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        })
    }

    fn crash_loop() -> Option<ContainerState> {
        Some(ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("CrashLoopBackOff".to_string()),
                message: None,
            }),
            ..Default::default()
        })
    }

    #[test]
    fn test_running_when_all_replicas_ready() {
        let app = AppService::new("svc-a", "t1");
        app.set_deployment(deployment(1, 1, Some(1)));
        app.set_pod(pod("p1", true, None));
        assert_eq!(derive_status(&app), ServiceStatus::Running);
    }

    #[test]
    fn test_starting_until_desired_ready() {
        let app = AppService::new("svc-a", "t1");
        app.set_deployment(deployment(2, 1, Some(2)));
        app.set_pod(pod("p1", true, None));
        app.set_pod(pod("p2", false, None));
        assert_eq!(derive_status(&app), ServiceStatus::Starting);
    }

    #[test]
    fn test_upgrading_while_rolling() {
        let app = AppService::new("svc-a", "t1");
        app.set_deployment(deployment(1, 1, Some(0)));
        app.set_pod(pod("p1", true, None));
        assert_eq!(derive_status(&app), ServiceStatus::Upgrading);
    }

    #[test]
    fn test_abnormal_and_some_abnormal() {
        let app = AppService::new("svc-a", "t1");
        app.set_deployment(deployment(2, 0, None));
        app.set_pod(pod("p1", false, crash_loop()));
        assert_eq!(derive_status(&app), ServiceStatus::Abnormal);

        app.set_pod(pod("p2", true, None));
        assert_eq!(derive_status(&app), ServiceStatus::SomeAbnormal);
    }

    #[test]
    fn test_oom_killed_pod_is_abnormal() {
        let oom = Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 137,
                reason: Some("OOMKilled".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(pod_is_abnormal(&pod("p1", false, oom)));
        assert_eq!(pod_condition(&pod("p1", true, None)), PodCondition::Running);
        assert_eq!(pod_condition(&pod("p1", false, None)), PodCondition::NotReady);
    }

    #[test]
    fn test_unknown_when_pod_cache_lags() {
        let app = AppService::new("svc-a", "t1");
        app.set_deployment(deployment(1, 1, Some(1)));
        assert_eq!(derive_status(&app), ServiceStatus::Unknown);
    }

    #[test]
    fn test_stopping_and_closed() {
        let app = AppService::new("svc-a", "t1");
        app.set_pod(pod("p1", true, None));
        assert_eq!(derive_status(&app), ServiceStatus::Stopping);

        app.delete_pod("p1");
        assert_eq!(derive_status(&app), ServiceStatus::Closed);

        app.set_deployment(deployment(0, 0, None));
        assert_eq!(derive_status(&app), ServiceStatus::Closed);
    }

    #[test]
    fn test_build_states_without_workload() {
        let app = AppService::from_declared(
            DeclaredService {
                service_id: "svc-a".to_string(),
                tenant_id: "t1".to_string(),
                service_alias: String::new(),
                kind: ServiceKind::Internal,
                build_state: Some(BuildState::Failed),
            },
            "Rainbond",
        );
        assert_eq!(derive_status(&app), ServiceStatus::BuildFailure);
    }

    #[test]
    fn test_third_party_status_from_endpoints() {
        let mut app = AppService::new("svc-tp", "t1");
        app.kind = ServiceKind::ThirdParty;
        assert_eq!(derive_status(&app), ServiceStatus::Closed);

        app.set_endpoints(Arc::new(Endpoints {
            metadata: named("ep"),
            subsets: Some(vec![EndpointSubset {
                not_ready_addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.1".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        }));
        assert_eq!(derive_status(&app), ServiceStatus::Abnormal);

        app.set_endpoints(Arc::new(Endpoints {
            metadata: named("ep"),
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.1".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        }));
        assert_eq!(derive_status(&app), ServiceStatus::Running);
    }
}
