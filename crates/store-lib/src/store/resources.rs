//! Tenant resource accounting from the pod and node listers

use crate::models::{ResourceTotals, TenantResource};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Parse a Kubernetes quantity into its value in base units
///
/// Supports plain and decimal numbers, binary suffixes (`Ki`..`Ei`),
/// decimal suffixes (`n`, `u`, `m`, `k`..`E`) and exponents (`1e3`).
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            10f64.powi(exp[1..].parse::<i32>().ok()?)
        }
        _ => return None,
    };
    Some(value * multiplier)
}

/// CPU quantity in millicores, rounded up
pub fn cpu_millis(q: &Quantity) -> i64 {
    parse_quantity(&q.0)
        .map(|v| (v * 1000.0).ceil() as i64)
        .unwrap_or(0)
}

/// Memory quantity in bytes, rounded up
pub fn memory_bytes(q: &Quantity) -> i64 {
    parse_quantity(&q.0).map(|v| v.ceil() as i64).unwrap_or(0)
}

fn add_resources(totals: &mut ResourceTotals, limits: &BTreeMap<String, Quantity>, requests: &BTreeMap<String, Quantity>) {
    totals.cpu_limit += limits.get("cpu").map(cpu_millis).unwrap_or(0);
    totals.memory_limit += limits.get("memory").map(memory_bytes).unwrap_or(0);
    totals.cpu_request += requests.get("cpu").map(cpu_millis).unwrap_or(0);
    totals.memory_request += requests.get("memory").map(memory_bytes).unwrap_or(0);
}

/// Sum limits and requests of every container that has a status entry
fn add_pod(totals: &mut ResourceTotals, pod: &Pod) {
    let status = pod.status.as_ref();
    let started: HashSet<&str> = status
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or(&[])
        .iter()
        .chain(
            status
                .and_then(|s| s.init_container_statuses.as_deref())
                .unwrap_or(&[]),
        )
        .map(|cs| cs.name.as_str())
        .collect();

    let empty = BTreeMap::new();
    for container in pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or(&[]) {
        if !started.contains(container.name.as_str()) {
            continue;
        }
        let resources = container.resources.as_ref();
        let limits = resources.and_then(|r| r.limits.as_ref()).unwrap_or(&empty);
        let requests = resources.and_then(|r| r.requests.as_ref()).unwrap_or(&empty);
        add_resources(totals, limits, requests);
    }
}

/// Resource usage of a tenant's pods, split by whether their node is cordoned
pub fn tenant_resource(pods: &[Arc<Pod>], nodes: &[Arc<Node>]) -> TenantResource {
    let cordoned: HashSet<String> = nodes
        .iter()
        .filter(|n| n.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false))
        .map(|n| n.name_any())
        .collect();

    let mut resource = TenantResource::default();
    for pod in pods {
        let node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
        match node {
            Some(node) if cordoned.contains(node) => add_pod(&mut resource.unschedulable, pod),
            _ => add_pod(&mut resource.schedulable, pod),
        }
    }
    resource
}
