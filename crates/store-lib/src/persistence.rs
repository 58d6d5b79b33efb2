//! Declared-state persistence collaborator
//!
//! The relational store of the platform lives elsewhere; the runtime store
//! only needs the narrow set of calls in [`Persistence`]. [`MemoryPersistence`]
//! is an in-process implementation seeded from a JSON document, used by the
//! binary when no database is wired in and by the tests.

use crate::error::{Result, StoreError};
use crate::models::{
    DeclaredService, NotificationEvent, ScalingRecord, ServiceEvent, ServiceKind, VersionInfo,
    VolumeType,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Operation types of user actions that are still in flight while unfinished
pub const USER_ACTION_TYPES: &[&str] = &[
    "rollback-service",
    "build-service",
    "update-service",
    "start-service",
    "stop-service",
    "restart-service",
    "vertical-service",
    "horizontal-service",
    "upgrade-service",
];

/// Event target kinds
pub mod targets {
    pub const SERVICE: &str = "service";
    pub const POD: &str = "pod";
}

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Declared state used to build a new aggregate; `ServiceNotFound` when absent
    async fn init_app_service(&self, service_id: &str, creator_id: &str)
        -> Result<DeclaredService>;

    /// Deployed versions of a service, empty if it was never deployed
    async fn list_versions(&self, service_id: &str) -> Result<Vec<VersionInfo>>;

    async fn list_third_party_services(&self) -> Result<Vec<DeclaredService>>;

    async fn has_open_port(&self, service_id: &str) -> Result<bool>;

    /// Upsert keyed by the event hash; a repeat increments the count
    async fn add_notification_event(&self, event: NotificationEvent) -> Result<()>;

    async fn add_service_event(&self, event: ServiceEvent) -> Result<()>;

    /// Set the end time of an open event
    async fn close_service_event(&self, event_id: &str, message: &str) -> Result<()>;

    /// Most recent open failure event targeting the pod
    async fn latest_failure_pod_event(&self, pod_name: &str) -> Result<Option<ServiceEvent>>;

    /// Whether any of [`USER_ACTION_TYPES`] is still running for the service
    async fn has_unfinished_user_actions(&self, service_id: &str) -> Result<bool>;

    /// Upsert keyed by the Kubernetes event name
    async fn upsert_scaling_record(&self, record: ScalingRecord) -> Result<()>;

    async fn upsert_volume_type(&self, volume_type: VolumeType) -> Result<()>;

    async fn delete_volume_type(&self, name: &str) -> Result<()>;
}

/// Seed document for [`MemoryPersistence`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeclaredState {
    #[serde(default)]
    pub services: Vec<DeclaredService>,
    #[serde(default)]
    pub versions: Vec<VersionInfo>,
    /// Services with at least one open port
    #[serde(default)]
    pub open_ports: Vec<String>,
    #[serde(default)]
    pub service_events: Vec<ServiceEvent>,
}

#[derive(Debug, Default)]
struct MemoryState {
    services: HashMap<String, DeclaredService>,
    versions: HashMap<String, Vec<VersionInfo>>,
    open_ports: HashSet<String>,
    notifications: HashMap<String, NotificationEvent>,
    service_events: Vec<ServiceEvent>,
    scaling_records: BTreeMap<String, ScalingRecord>,
    volume_types: BTreeMap<String, VolumeType>,
}

/// In-memory [`Persistence`]
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(seed: DeclaredState) -> Self {
        let mut state = MemoryState::default();
        for svc in seed.services {
            state.services.insert(svc.service_id.clone(), svc);
        }
        for version in seed.versions {
            state
                .versions
                .entry(version.service_id.clone())
                .or_default()
                .push(version);
        }
        state.open_ports = seed.open_ports.into_iter().collect();
        state.service_events = seed.service_events;

        Self {
            state: RwLock::new(state),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Load a seed document from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read declared state {}", path.display()))
            .map_err(StoreError::Persistence)?;
        let seed: DeclaredState = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse declared state {}", path.display()))
            .map_err(StoreError::Persistence)?;
        info!(
            path = %path.display(),
            services = seed.services.len(),
            versions = seed.versions.len(),
            "Loaded declared state"
        );
        Ok(Self::from_state(seed))
    }

    /// Make every call fail, simulating a lost database connection
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Persistence(anyhow!("declared state unavailable")));
        }
        Ok(())
    }

    pub async fn insert_service(&self, service: DeclaredService) {
        let mut state = self.state.write().await;
        state.services.insert(service.service_id.clone(), service);
    }

    pub async fn insert_version(&self, version: VersionInfo) {
        let mut state = self.state.write().await;
        state
            .versions
            .entry(version.service_id.clone())
            .or_default()
            .push(version);
    }

    pub async fn set_open_port(&self, service_id: &str) {
        self.state
            .write()
            .await
            .open_ports
            .insert(service_id.to_string());
    }

    pub async fn notifications(&self) -> Vec<NotificationEvent> {
        self.state.read().await.notifications.values().cloned().collect()
    }

    pub async fn service_events(&self) -> Vec<ServiceEvent> {
        self.state.read().await.service_events.clone()
    }

    pub async fn scaling_records(&self) -> Vec<ScalingRecord> {
        self.state.read().await.scaling_records.values().cloned().collect()
    }

    pub async fn volume_types(&self) -> Vec<VolumeType> {
        self.state.read().await.volume_types.values().cloned().collect()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn init_app_service(
        &self,
        service_id: &str,
        creator_id: &str,
    ) -> Result<DeclaredService> {
        self.check_available()?;
        let state = self.state.read().await;
        match state.services.get(service_id) {
            Some(svc) => {
                debug!(service_id = %service_id, creator_id = %creator_id, "Declared service found");
                Ok(svc.clone())
            }
            None => Err(StoreError::ServiceNotFound(service_id.to_string())),
        }
    }

    async fn list_versions(&self, service_id: &str) -> Result<Vec<VersionInfo>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.versions.get(service_id).cloned().unwrap_or_default())
    }

    async fn list_third_party_services(&self) -> Result<Vec<DeclaredService>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .services
            .values()
            .filter(|s| s.kind == ServiceKind::ThirdParty)
            .cloned()
            .collect())
    }

    async fn has_open_port(&self, service_id: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.state.read().await.open_ports.contains(service_id))
    }

    async fn add_notification_event(&self, event: NotificationEvent) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        match state.notifications.get_mut(&event.hash) {
            Some(existing) => {
                existing.count += 1;
                existing.message = event.message;
                existing.last_time = event.last_time;
            }
            None => {
                let mut event = event;
                event.count = event.count.max(1);
                state.notifications.insert(event.hash.clone(), event);
            }
        }
        Ok(())
    }

    async fn add_service_event(&self, event: ServiceEvent) -> Result<()> {
        self.check_available()?;
        self.state.write().await.service_events.push(event);
        Ok(())
    }

    async fn close_service_event(&self, event_id: &str, message: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let event = state
            .service_events
            .iter_mut()
            .find(|e| e.event_id == event_id)
            .ok_or_else(|| StoreError::NotFound(format!("service event {}", event_id)))?;
        event.end_time = Some(Utc::now());
        event.message = message.to_string();
        Ok(())
    }

    async fn latest_failure_pod_event(&self, pod_name: &str) -> Result<Option<ServiceEvent>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .service_events
            .iter()
            .filter(|e| e.target == targets::POD && e.target_id == pod_name && e.is_open())
            .max_by_key(|e| e.start_time)
            .cloned())
    }

    async fn has_unfinished_user_actions(&self, service_id: &str) -> Result<bool> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.service_events.iter().any(|e| {
            e.target == targets::SERVICE
                && e.target_id == service_id
                && e.end_time.is_none()
                && USER_ACTION_TYPES.contains(&e.opt_type.as_str())
        }))
    }

    async fn upsert_scaling_record(&self, record: ScalingRecord) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        match state.scaling_records.get_mut(&record.event_name) {
            Some(existing) => {
                existing.count = record.count;
                existing.reason = record.reason;
                existing.description = record.description;
                existing.last_time = record.last_time;
                if record.operator.is_some() {
                    existing.operator = record.operator;
                }
            }
            None => {
                state
                    .scaling_records
                    .insert(record.event_name.clone(), record);
            }
        }
        Ok(())
    }

    async fn upsert_volume_type(&self, volume_type: VolumeType) -> Result<()> {
        self.check_available()?;
        self.state
            .write()
            .await
            .volume_types
            .insert(volume_type.name.clone(), volume_type);
        Ok(())
    }

    async fn delete_volume_type(&self, name: &str) -> Result<()> {
        self.check_available()?;
        self.state.write().await.volume_types.remove(name);
        Ok(())
    }
}
