//! Container termination records
//!
//! Every pod update is scanned for containers whose last termination is
//! recorded. Each one becomes a notification keyed by a content hash, so a
//! container that keeps failing for the same reason folds into one record
//! with a growing count.

use crate::models::{AbnormalInfo, NotificationEvent};
use crate::observability::{StoreMetrics, StructuredLogger};
use crate::persistence::Persistence;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::warn;

const OOM_KILLED: &str = "OOMKilled";

/// Service identity carried in the first container's environment
fn service_info_from_pod(pod: &Pod) -> AbnormalInfo {
    let mut service_id = String::new();
    let mut service_alias = String::new();

    let env = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.env.as_deref())
        .unwrap_or(&[]);
    for var in env {
        match var.name.as_str() {
            "SERVICE_ID" => service_id = var.value.clone().unwrap_or_default(),
            "SERVICE_NAME" => service_alias = var.value.clone().unwrap_or_default(),
            _ => {}
        }
        if !service_id.is_empty() && !service_alias.is_empty() {
            break;
        }
    }

    AbnormalInfo {
        service_id,
        service_alias,
        pod_name: pod.name_any(),
        tenant_id: pod.namespace().unwrap_or_default(),
        container_name: String::new(),
        reason: String::new(),
        message: String::new(),
        create_time: Utc::now(),
        count: 1,
    }
}

/// One record per container with a recorded last termination
pub fn analyze_pod_status(pod: &Pod) -> Vec<AbnormalInfo> {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or(&[]);

    statuses
        .iter()
        .filter_map(|cs| {
            let terminated = cs.last_state.as_ref()?.terminated.as_ref()?;
            let mut info = service_info_from_pod(pod);
            info.container_name = cs.name.clone();
            info.reason = terminated.reason.clone().unwrap_or_default();
            info.message = terminated.message.clone().unwrap_or_default();
            Some(info)
        })
        .collect()
}

/// Notification persisted for an abnormality
pub fn notification_for(info: &AbnormalInfo) -> NotificationEvent {
    let (message, reason) = if info.reason == OOM_KILLED {
        (
            format!("Container {} OOMKilled {}", info.container_name, info.message),
            OOM_KILLED.to_string(),
        )
    } else {
        (
            format!("Container {} restart {}", info.container_name, info.message),
            info.reason.clone(),
        )
    };

    NotificationEvent {
        kind: "service".to_string(),
        kind_id: info.service_id.clone(),
        hash: info.hash(),
        event_type: "UnNormal".to_string(),
        message: message.trim_end().to_string(),
        reason,
        count: info.count,
        service_name: info.service_alias.clone(),
        tenant_name: info.tenant_id.clone(),
        last_time: info.create_time,
    }
}

/// Writes termination records for pod updates
pub struct AbnormalDetector {
    persistence: Arc<dyn Persistence>,
    metrics: StoreMetrics,
    logger: StructuredLogger,
}

impl AbnormalDetector {
    pub fn new(persistence: Arc<dyn Persistence>, logger: StructuredLogger) -> Self {
        Self {
            persistence,
            metrics: StoreMetrics::new(),
            logger,
        }
    }

    /// Record every terminated container of the pod; returns records written
    pub async fn on_pod_update(&self, pod: &Pod) -> usize {
        let mut written = 0;
        for info in analyze_pod_status(pod) {
            let event = notification_for(&info);
            match self.persistence.add_notification_event(event).await {
                Ok(()) => {
                    written += 1;
                    self.metrics.inc_abnormal_record(&info.reason);
                    self.logger.log_abnormal(
                        &info.service_id,
                        &info.pod_name,
                        &info.container_name,
                        &info.reason,
                        info.count,
                    );
                }
                Err(e) => warn!(
                    pod = %info.pod_name,
                    container = %info.container_name,
                    error = %e,
                    "Failed to record container abnormality"
                ),
            }
        }
        written
    }
}
