//! Platform identity extraction from Kubernetes labels
//!
//! Objects created by the platform carry `service_id`, `version` and
//! `creater_id` labels. Anything without them is foreign and left alone.

use std::collections::BTreeMap;

pub mod labels {
    pub const SERVICE_ID: &str = "service_id";
    pub const VERSION: &str = "version";
    pub const CREATOR_ID: &str = "creater_id";
    pub const TENANT_ID: &str = "tenant_id";
    pub const RULE_ID: &str = "rule_id";
    pub const SERVICE_KIND: &str = "service-kind";

    /// Value of `service-kind` marking a third-party service
    pub const THIRD_PARTY: &str = "third_party";
}

/// Identity of the platform service owning an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub service_id: String,
    pub version: String,
    pub creator_id: String,
    pub tenant_id: Option<String>,
}

/// Whether the object kind must carry a version label to be adopted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRule {
    /// Workload controllers, replica sets, HPAs and pods
    Required,
    /// Auxiliary objects attach by service id alone
    Optional,
}

/// Resolve the service identity from a label set
pub fn resolve(labels: &BTreeMap<String, String>, rule: VersionRule) -> Option<ServiceIdentity> {
    let get = |key: &str| {
        labels
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let service_id = get(labels::SERVICE_ID)?;
    let creator_id = get(labels::CREATOR_ID)?;
    let version = get(labels::VERSION);
    if rule == VersionRule::Required && version.is_none() {
        return None;
    }

    Some(ServiceIdentity {
        service_id,
        version: version.unwrap_or_default(),
        creator_id,
        tenant_id: get(labels::TENANT_ID),
    })
}

/// True if the labels mark a third-party service object
pub fn is_third_party(labels: &BTreeMap<String, String>) -> bool {
    labels.get(labels::SERVICE_KIND).map(String::as_str) == Some(labels::THIRD_PARTY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label_set(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolve_full_identity() {
        let l = label_set(&[
            ("service_id", "svc-a"),
            ("version", "v1"),
            ("creater_id", "Rainbond"),
            ("tenant_id", "t1"),
        ]);
        let id = resolve(&l, VersionRule::Required).unwrap();
        assert_eq!(id.service_id, "svc-a");
        assert_eq!(id.version, "v1");
        assert_eq!(id.creator_id, "Rainbond");
        assert_eq!(id.tenant_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_version_required_for_workloads_only() {
        let l = label_set(&[("service_id", "svc-a"), ("creater_id", "Rainbond")]);
        assert!(resolve(&l, VersionRule::Required).is_none());

        let id = resolve(&l, VersionRule::Optional).unwrap();
        assert_eq!(id.version, "");
    }

    #[test]
    fn test_missing_creator_is_foreign() {
        let l = label_set(&[("service_id", "svc-a"), ("version", "v1"), ("creater_id", "")]);
        assert!(resolve(&l, VersionRule::Optional).is_none());
        assert!(resolve(&BTreeMap::new(), VersionRule::Optional).is_none());
    }

    #[test]
    fn test_third_party_marker() {
        assert!(is_third_party(&label_set(&[("service-kind", "third_party")])));
        assert!(!is_third_party(&label_set(&[("service-kind", "internal")])));
    }
}
