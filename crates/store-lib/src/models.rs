//! Core data models for the runtime store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle status of a platform service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceStatus {
    Undeployed,
    Closed,
    Building,
    BuildFailure,
    Starting,
    Running,
    Upgrading,
    Stopping,
    Abnormal,
    SomeAbnormal,
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Undeployed => "undeployed",
            ServiceStatus::Closed => "closed",
            ServiceStatus::Building => "building",
            ServiceStatus::BuildFailure => "build-failure",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Upgrading => "upgrading",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Abnormal => "abnormal",
            ServiceStatus::SomeAbnormal => "some-abnormal",
            ServiceStatus::Unknown => "unknown",
        }
    }

    /// Statuses that do not accrue resource charges
    pub fn is_billable(&self) -> bool {
        !matches!(
            self,
            ServiceStatus::BuildFailure
                | ServiceStatus::Closed
                | ServiceStatus::Undeployed
                | ServiceStatus::Building
                | ServiceStatus::Unknown
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a service is backed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    #[default]
    Internal,
    /// Externally running process tracked through Endpoints
    ThirdParty,
}

/// Build progress recorded for a service that has nothing running yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Building,
    Failed,
}

/// Declared state of a service, as known to the persistence layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredService {
    pub service_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub service_alias: String,
    #[serde(default)]
    pub kind: ServiceKind,
    #[serde(default)]
    pub build_state: Option<BuildState>,
}

/// A deployed version of a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub service_id: String,
    pub build_version: String,
    pub created_at: DateTime<Utc>,
}

/// Endpoint probe descriptor for third-party services
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeInfo {
    pub sid: String,
    pub uuid: String,
    pub ip: String,
    pub port: i32,
}

/// A container termination observed on a pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbnormalInfo {
    pub service_id: String,
    pub service_alias: String,
    pub pod_name: String,
    pub tenant_id: String,
    pub container_name: String,
    pub reason: String,
    pub message: String,
    pub create_time: DateTime<Utc>,
    pub count: u32,
}

impl AbnormalInfo {
    /// Content hash used to fold repeated failures into one record
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for field in ["service", self.service_id.as_str(), self.reason.as_str()] {
            hasher.update(field.as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}

/// Persisted abnormality notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: String,
    pub kind_id: String,
    pub hash: String,
    pub event_type: String,
    pub message: String,
    pub reason: String,
    pub count: u32,
    pub service_name: String,
    pub tenant_name: String,
    pub last_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Failure,
}

/// User-visible service event (incidents, recoveries)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub event_id: String,
    pub tenant_id: String,
    pub service_id: String,
    /// Target kind, always "pod" for incidents
    pub target: String,
    pub target_id: String,
    pub user_name: String,
    pub opt_type: String,
    pub status: EventStatus,
    pub message: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ServiceEvent {
    pub fn is_open(&self) -> bool {
        self.status == EventStatus::Failure && self.end_time.is_none()
    }
}

/// Autoscaling record derived from a Kubernetes event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingRecord {
    pub service_id: String,
    pub rule_id: String,
    pub event_name: String,
    pub record_type: String,
    pub count: i32,
    pub reason: String,
    pub description: String,
    pub operator: Option<String>,
    pub last_time: Option<DateTime<Utc>>,
}

/// Volume type mirrored from a StorageClass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeType {
    pub name: String,
    pub provisioner: String,
    pub reclaim_policy: String,
    pub binding_mode: String,
    pub allow_expansion: bool,
    pub parameters: BTreeMap<String, String>,
}

/// CPU in millicores, memory in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTotals {
    pub cpu_limit: i64,
    pub cpu_request: i64,
    pub memory_limit: i64,
    pub memory_request: i64,
}

/// Resource usage of a tenant split by node schedulability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantResource {
    pub schedulable: ResourceTotals,
    pub unschedulable: ResourceTotals,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abnormal(reason: &str, container: &str) -> AbnormalInfo {
        AbnormalInfo {
            service_id: "svc-a".to_string(),
            service_alias: "gr1234".to_string(),
            pod_name: "pod-1".to_string(),
            tenant_id: "tenant".to_string(),
            container_name: container.to_string(),
            reason: reason.to_string(),
            message: String::new(),
            create_time: Utc::now(),
            count: 1,
        }
    }

    #[test]
    fn test_abnormal_hash_ignores_container_and_message() {
        let a = abnormal("OOMKilled", "app");
        let mut b = abnormal("OOMKilled", "sidecar");
        b.message = "different".to_string();
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), abnormal("Error", "app").hash());
    }

    #[test]
    fn test_abnormal_hash_separates_fields() {
        let a = abnormal("Error", "app");
        let mut b = abnormal("rror", "app");
        b.service_id = "svc-aE".to_string();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ServiceStatus::BuildFailure.to_string(), "build-failure");
        assert_eq!(
            serde_json::to_string(&ServiceStatus::SomeAbnormal).unwrap(),
            "\"some-abnormal\""
        );
        assert!(ServiceStatus::Running.is_billable());
        assert!(!ServiceStatus::Unknown.is_billable());
    }
}
