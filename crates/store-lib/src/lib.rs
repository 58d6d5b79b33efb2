//! Runtime store library for platform applications on Kubernetes
//!
//! This crate provides the core functionality for:
//! - Watching the cluster and caching objects per platform service
//! - Deriving service lifecycle status from the cached objects
//! - Recording abnormal container terminations and pod incidents
//! - Probe notifications for third-party services
//! - Health checks and observability

pub mod abnormal;
pub mod appservice;
pub mod cluster;
pub mod error;
pub mod health;
pub mod identity;
pub mod models;
pub mod observability;
pub mod persistence;
pub mod probe;
pub mod scaling;
pub mod store;
pub mod watch;

pub use appservice::AppService;
pub use cluster::{Applier, ClusterClient, KubeCluster, LoggingApplier};
pub use error::{Result, StoreError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StoreMetrics, StructuredLogger};
pub use persistence::{DeclaredState, MemoryPersistence, Persistence};
pub use probe::{ProbeEvent, ProbeNotifier};
pub use store::{AppRuntimeStore, StartNotice, StoreConfig, StoreDeps, StoreReceivers};
pub use watch::{ClusterEvent, EventSink, Listers, ObjectKind, WatchMultiplexer};
