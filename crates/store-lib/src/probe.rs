//! Probe notifications for third-party services
//!
//! Third-party services run outside the cluster and are represented by
//! Endpoints objects. Each (port, address) pair becomes a probe descriptor
//! that the health prober downstream keeps checking; this module turns
//! Endpoints changes into descriptor deltas on a bounded channel.

use crate::models::ProbeInfo;
use crate::observability::StoreMetrics;
use k8s_openapi::api::core::v1::Endpoints;
use kube::ResourceExt;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Annotation replacing every address with a single domain
pub const DOMAIN_ANNOTATION: &str = "domain";

/// Descriptor delta sent to the prober
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    Create(Vec<ProbeInfo>),
    Delete(ProbeInfo),
}

/// Probe descriptors of one Endpoints object, not-ready addresses first
pub fn list_probe_infos(ep: &Endpoints, sid: &str) -> Vec<ProbeInfo> {
    let domain = ep
        .annotations()
        .get(DOMAIN_ANNOTATION)
        .filter(|d| !d.is_empty());

    let mut infos = Vec::new();
    for subset in ep.subsets.as_deref().unwrap_or(&[]) {
        let Some(first_port) = subset.ports.as_ref().and_then(|p| p.first()) else {
            continue;
        };
        let uuid = first_port.name.clone().unwrap_or_default();
        let port = first_port.port;

        if let Some(domain) = domain {
            debug!(sid = %sid, domain = %domain, "Using domain probe for third-party endpoints");
            return vec![ProbeInfo {
                sid: sid.to_string(),
                uuid,
                ip: domain.clone(),
                port,
            }];
        }

        let not_ready = subset.not_ready_addresses.as_deref().unwrap_or(&[]);
        let ready = subset.addresses.as_deref().unwrap_or(&[]);
        infos.extend(not_ready.iter().chain(ready).map(|address| ProbeInfo {
            sid: sid.to_string(),
            uuid: uuid.clone(),
            ip: address.ip.clone(),
            port,
        }));
    }
    infos
}

/// Edge-triggered diff of two descriptor sets keyed by (uuid, ip, port)
pub fn diff_probes(old: &[ProbeInfo], new: &[ProbeInfo]) -> Vec<ProbeEvent> {
    let key = |p: &ProbeInfo| (p.uuid.clone(), p.ip.clone(), p.port);
    let old_keys: HashSet<_> = old.iter().map(key).collect();
    let new_keys: HashSet<_> = new.iter().map(key).collect();

    let created = new
        .iter()
        .filter(|p| !old_keys.contains(&key(p)))
        .map(|p| ProbeEvent::Create(vec![p.clone()]));
    let deleted = old
        .iter()
        .filter(|p| !new_keys.contains(&key(p)))
        .map(|p| ProbeEvent::Delete(p.clone()));
    created.chain(deleted).collect()
}

/// Non-blocking sender of probe deltas
#[derive(Clone)]
pub struct ProbeNotifier {
    tx: mpsc::Sender<ProbeEvent>,
    metrics: StoreMetrics,
}

impl ProbeNotifier {
    pub fn new(tx: mpsc::Sender<ProbeEvent>) -> Self {
        Self {
            tx,
            metrics: StoreMetrics::new(),
        }
    }

    /// Channel of the given capacity with its notifier
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProbeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    fn send(&self, event: ProbeEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.metrics.inc_probe_dropped();
                warn!(event = ?event, "Probe channel full, dropping notification");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Probe channel closed");
            }
        }
    }

    pub fn on_create(&self, ep: &Endpoints, sid: &str) {
        let infos = list_probe_infos(ep, sid);
        if !infos.is_empty() {
            self.send(ProbeEvent::Create(infos));
        }
    }

    pub fn on_update(&self, old: &Endpoints, new: &Endpoints, sid: &str) {
        let changes = diff_probes(&list_probe_infos(old, sid), &list_probe_infos(new, sid));
        for change in changes {
            self.send(change);
        }
    }

    pub fn on_delete(&self, ep: &Endpoints, sid: &str) {
        for info in list_probe_infos(ep, sid) {
            self.send(ProbeEvent::Delete(info));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn address(ip: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.to_string(),
            ..Default::default()
        }
    }

    fn endpoints(ready: &[&str], not_ready: &[&str], domain: Option<&str>) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some("svc-tp-ep".to_string()),
                namespace: Some("t1".to_string()),
                annotations: domain.map(|d| {
                    BTreeMap::from([(DOMAIN_ANNOTATION.to_string(), d.to_string())])
                }),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(ready.iter().map(|ip| address(ip)).collect()),
                not_ready_addresses: Some(not_ready.iter().map(|ip| address(ip)).collect()),
                ports: Some(vec![EndpointPort {
                    name: Some("uuid-1".to_string()),
                    port: 8080,
                    ..Default::default()
                }]),
            }]),
        }
    }

    #[test]
    fn test_list_includes_not_ready_addresses() {
        let infos = list_probe_infos(&endpoints(&["10.0.0.1"], &["10.0.0.2"], None), "svc-tp");
        let ips: Vec<_> = infos.iter().map(|i| i.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.2", "10.0.0.1"]);
        assert!(infos.iter().all(|i| i.uuid == "uuid-1" && i.port == 8080));
    }

    #[test]
    fn test_domain_annotation_replaces_addresses() {
        let infos = list_probe_infos(
            &endpoints(&["10.0.0.1", "10.0.0.2"], &[], Some("api.example.com")),
            "svc-tp",
        );
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].ip, "api.example.com");
    }

    #[test]
    fn test_diff_emits_one_create_and_one_delete() {
        let old = list_probe_infos(&endpoints(&["10.0.0.1", "10.0.0.2"], &[], None), "svc-tp");
        let new = list_probe_infos(&endpoints(&["10.0.0.1", "10.0.0.3"], &[], None), "svc-tp");

        let changes = diff_probes(&old, &new);
        assert_eq!(changes.len(), 2);
        assert!(matches!(&changes[0], ProbeEvent::Create(v) if v.len() == 1 && v[0].ip == "10.0.0.3"));
        assert!(matches!(&changes[1], ProbeEvent::Delete(p) if p.ip == "10.0.0.2"));
        assert!(diff_probes(&new, &new).is_empty());
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (notifier, mut rx) = ProbeNotifier::channel(1);
        let ep = endpoints(&["10.0.0.1"], &[], None);

        notifier.on_create(&ep, "svc-tp");
        notifier.on_delete(&ep, "svc-tp");

        assert!(matches!(rx.recv().await, Some(ProbeEvent::Create(_))));
        assert!(rx.try_recv().is_err());
    }
}
