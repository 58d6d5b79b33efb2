//! Abnormal application behavior
//!
//! This module provides:
//! - Termination records for containers that restarted or were OOM killed
//! - Incident tracking of pods that fail, recover or disappear

mod detector;
mod incident;

pub use detector::{analyze_pod_status, notification_for, AbnormalDetector};
pub use incident::{classify_container, IncidentTracker, IncidentType, RECOVERY_GRACE_SECS};
