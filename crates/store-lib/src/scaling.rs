//! Records derived from cluster-scoped and auxiliary kinds
//!
//! Kubernetes events about workload controllers and autoscalers become
//! scaling records of the owning service; storage classes are mirrored as
//! volume types.

use crate::identity::labels;
use crate::models::{ScalingRecord, VolumeType};
use crate::watch::Listers;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::warn;

/// Operator recorded for records created from the event stream
pub const SYSTEM_OPERATOR: &str = "system";

/// Record type for the involved object kind, or None for kinds that are not tracked
pub fn record_type_for(kind: &str) -> Option<&'static str> {
    match kind {
        "Deployment" | "StatefulSet" => Some("manual"),
        "HorizontalPodAutoscaler" => Some("hpa"),
        _ => None,
    }
}

/// Service and rule id of the object an event refers to, looked up in the listers
pub fn scaling_target(evt: &Event, listers: &Listers) -> Option<(String, String)> {
    let involved = &evt.involved_object;
    let kind = involved.kind.as_deref().unwrap_or_default();
    let namespace = involved.namespace.as_deref();
    let name = involved.name.as_deref().unwrap_or_default();

    let object_labels: BTreeMap<String, String> = match kind {
        "Deployment" => listers
            .deployments
            .get(namespace, name)
            .map(|d| d.labels().clone()),
        "StatefulSet" => listers
            .statefulsets
            .get(namespace, name)
            .map(|s| s.labels().clone()),
        "HorizontalPodAutoscaler" => listers.hpas.get(namespace, name).map(|h| h.labels().clone()),
        _ => None,
    }
    .or_else(|| {
        warn!(kind = %kind, name = %name, "Scaling event for an object not in cache");
        None
    })?;

    let service_id = object_labels.get(labels::SERVICE_ID).filter(|v| !v.is_empty())?;
    let rule_id = object_labels.get(labels::RULE_ID).filter(|v| !v.is_empty())?;
    Some((service_id.clone(), rule_id.clone()))
}

/// Scaling record for an event, None when the event is not about a tracked
/// kind or its service and rule cannot be resolved
pub fn scaling_record(evt: &Event, listers: &Listers, operator: Option<&str>) -> Option<ScalingRecord> {
    let record_type = record_type_for(evt.involved_object.kind.as_deref().unwrap_or_default())?;
    let Some((service_id, rule_id)) = scaling_target(evt, listers) else {
        warn!(event = %evt.name_any(), "Empty service id or rule id");
        return None;
    };

    Some(ScalingRecord {
        service_id,
        rule_id,
        event_name: evt.name_any(),
        record_type: record_type.to_string(),
        count: evt.count.unwrap_or(0),
        reason: evt.reason.clone().unwrap_or_default(),
        description: evt.message.clone().unwrap_or_default(),
        operator: operator.map(str::to_string),
        last_time: evt.last_timestamp.as_ref().map(|t| t.0),
    })
}

/// Volume type mirrored from a storage class, with API server defaults filled in
pub fn volume_type_from(sc: &StorageClass) -> VolumeType {
    VolumeType {
        name: sc.name_any(),
        provisioner: sc.provisioner.clone(),
        reclaim_policy: sc
            .reclaim_policy
            .clone()
            .unwrap_or_else(|| "Delete".to_string()),
        binding_mode: sc
            .volume_binding_mode
            .clone()
            .unwrap_or_else(|| "Immediate".to_string()),
        allow_expansion: sc.allow_volume_expansion.unwrap_or(false),
        parameters: sc.parameters.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::watcher;

    fn event(kind: &str, name: &str) -> Event {
        Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.17a2", name)),
                namespace: Some("t1".to_string()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                kind: Some(kind.to_string()),
                name: Some(name.to_string()),
                namespace: Some("t1".to_string()),
                ..Default::default()
            },
            count: Some(3),
            reason: Some("ScalingReplicaSet".to_string()),
            message: Some("Scaled up replica set svc-a-1 to 2".to_string()),
            ..Default::default()
        }
    }

    fn listers_with_deployment(rule_id: Option<&str>) -> Listers {
        let listers = Listers::new();
        let mut l = BTreeMap::from([("service_id".to_string(), "svc-a".to_string())]);
        if let Some(rule) = rule_id {
            l.insert("rule_id".to_string(), rule.to_string());
        }
        listers.deployments.apply(watcher::Event::Applied(Deployment {
            metadata: ObjectMeta {
                name: Some("svc-a".to_string()),
                namespace: Some("t1".to_string()),
                labels: Some(l),
                ..Default::default()
            },
            ..Default::default()
        }));
        listers
    }

    #[test]
    fn test_record_from_deployment_event() {
        let listers = listers_with_deployment(Some("rule-1"));
        let record = scaling_record(&event("Deployment", "svc-a"), &listers, Some(SYSTEM_OPERATOR))
            .unwrap();

        assert_eq!(record.service_id, "svc-a");
        assert_eq!(record.rule_id, "rule-1");
        assert_eq!(record.record_type, "manual");
        assert_eq!(record.count, 3);
        assert_eq!(record.operator.as_deref(), Some("system"));
    }

    #[test]
    fn test_record_dropped_without_rule_or_kind() {
        let listers = listers_with_deployment(None);
        assert!(scaling_record(&event("Deployment", "svc-a"), &listers, None).is_none());
        assert!(scaling_record(&event("Pod", "svc-a-0"), &listers, None).is_none());
        assert!(scaling_record(&event("Deployment", "missing"), &listers, None).is_none());
    }

    #[test]
    fn test_volume_type_defaults() {
        let sc = StorageClass {
            metadata: ObjectMeta {
                name: Some("local-path".to_string()),
                ..Default::default()
            },
            provisioner: "rancher.io/local-path".to_string(),
            volume_binding_mode: Some("WaitForFirstConsumer".to_string()),
            ..Default::default()
        };
        let vt = volume_type_from(&sc);
        assert_eq!(vt.name, "local-path");
        assert_eq!(vt.reclaim_policy, "Delete");
        assert_eq!(vt.binding_mode, "WaitForFirstConsumer");
        assert!(!vt.allow_expansion);
    }
}
