//! Per-kind object cache
//!
//! Mirrors the latest observed object per namespace/name and turns raw
//! watcher events into create/update/delete notifications. The cache is
//! also the lister read paths use.

use super::{ObjectKind, ResourceEvent};
use dashmap::DashMap;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cache key of an object: `namespace/name`, or `name` for cluster-scoped kinds
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

fn lookup_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

/// Latest-object cache for one watched kind
#[derive(Debug)]
pub struct ObjectCache<K> {
    kind: ObjectKind,
    objects: DashMap<String, Arc<K>>,
    synced: AtomicBool,
}

impl<K: Resource> ObjectCache<K> {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            objects: DashMap::new(),
            synced: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Whether the initial listing has been observed
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        self.objects
            .get(&lookup_key(namespace, name))
            .map(|r| r.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.objects.iter().map(|r| r.value().clone()).collect()
    }

    pub fn list_namespaced(&self, namespace: &str) -> Vec<Arc<K>> {
        self.objects
            .iter()
            .filter(|r| r.value().namespace().as_deref() == Some(namespace))
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Insert or replace an object, reporting it as a create or an update
    pub fn upsert(&self, obj: K) -> ResourceEvent<K> {
        let obj = Arc::new(obj);
        match self.objects.insert(object_key(obj.as_ref()), obj.clone()) {
            Some(old) => ResourceEvent::Update { old, new: obj },
            None => ResourceEvent::Create(obj),
        }
    }

    /// Remove an object; the delete is reported even if it was never cached
    pub fn remove(&self, obj: K) -> ResourceEvent<K> {
        let key = object_key(&obj);
        self.objects.remove(&key);
        ResourceEvent::Delete(Arc::new(obj))
    }

    /// Apply one watcher event and return the resulting notifications
    ///
    /// A restart (initial list or relist after a dropped watch) is diffed
    /// against the cache: listed objects become creates or updates, cached
    /// objects missing from the list become deletes. The cache counts as
    /// synced after its first restart.
    pub fn apply(&self, event: watcher::Event<K>) -> Vec<ResourceEvent<K>> {
        match event {
            watcher::Event::Applied(obj) => vec![self.upsert(obj)],
            watcher::Event::Deleted(obj) => vec![self.remove(obj)],
            watcher::Event::Restarted(objs) => {
                let listed: HashSet<String> = objs.iter().map(object_key).collect();
                let mut changes: Vec<ResourceEvent<K>> =
                    objs.into_iter().map(|obj| self.upsert(obj)).collect();

                let vanished: Vec<String> = self
                    .objects
                    .iter()
                    .filter(|r| !listed.contains(r.key()))
                    .map(|r| r.key().clone())
                    .collect();
                for key in vanished {
                    if let Some((_, old)) = self.objects.remove(&key) {
                        changes.push(ResourceEvent::Delete(old));
                    }
                }

                self.mark_synced();
                changes
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(ns: &str, name: &str, rv: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_applied_creates_then_updates() {
        let cache = ObjectCache::<Pod>::new(ObjectKind::Pod);

        let first = cache.apply(watcher::Event::Applied(pod("t1", "p1", "1")));
        assert!(matches!(first.as_slice(), [ResourceEvent::Create(_)]));

        let second = cache.apply(watcher::Event::Applied(pod("t1", "p1", "2")));
        match second.as_slice() {
            [ResourceEvent::Update { old, new }] => {
                assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
                assert_eq!(new.metadata.resource_version.as_deref(), Some("2"));
            }
            other => panic!("unexpected changes: {:?}", other.len()),
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_restart_diffs_against_cache() {
        let cache = ObjectCache::<Pod>::new(ObjectKind::Pod);
        cache.apply(watcher::Event::Applied(pod("t1", "stale", "1")));
        cache.apply(watcher::Event::Applied(pod("t1", "kept", "1")));
        assert!(!cache.is_synced());

        let changes = cache.apply(watcher::Event::Restarted(vec![
            pod("t1", "kept", "2"),
            pod("t2", "fresh", "1"),
        ]));

        let creates = changes
            .iter()
            .filter(|c| matches!(c, ResourceEvent::Create(_)))
            .count();
        let updates = changes
            .iter()
            .filter(|c| matches!(c, ResourceEvent::Update { .. }))
            .count();
        let deletes: Vec<_> = changes
            .iter()
            .filter_map(|c| match c {
                ResourceEvent::Delete(p) => Some(p.name_any()),
                _ => None,
            })
            .collect();

        assert_eq!((creates, updates), (1, 1));
        assert_eq!(deletes, vec!["stale".to_string()]);
        assert!(cache.is_synced());
        assert!(cache.get(Some("t1"), "stale").is_none());
    }

    #[test]
    fn test_namespaced_listing() {
        let cache = ObjectCache::<Pod>::new(ObjectKind::Pod);
        cache.apply(watcher::Event::Applied(pod("t1", "a", "1")));
        cache.apply(watcher::Event::Applied(pod("t1", "b", "1")));
        cache.apply(watcher::Event::Applied(pod("t2", "a", "1")));

        assert_eq!(cache.list_namespaced("t1").len(), 2);
        assert_eq!(cache.list().len(), 3);
        assert!(cache.get(Some("t2"), "a").is_some());

        cache.apply(watcher::Event::Deleted(pod("t2", "a", "2")));
        assert!(cache.get(Some("t2"), "a").is_none());
    }
}
