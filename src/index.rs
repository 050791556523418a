//! In-memory index from image name to the container slots running it.
//!
//! The index is shared between the cluster change listeners (writers) and the
//! update dispatcher (reader, plus write-through after a successful update).
//! Every operation takes the lock for the duration of the call only.

use crate::image_reference::ImageReference;
use crate::workload::{WorkloadKind, WorkloadRef};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One container slot inside one cluster workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKey {
    pub namespace: String,
    pub resource_name: String,
    pub kind: WorkloadKind,
    pub container_name: String,
    pub image_name: String,
    pub image_tag: String,
}

impl ResourceKey {
    pub fn new(workload: &WorkloadRef, container_name: &str, image: ImageReference) -> Self {
        Self {
            namespace: workload.namespace.clone(),
            resource_name: workload.name.clone(),
            kind: workload.kind,
            container_name: container_name.to_string(),
            image_name: image.name,
            image_tag: image.tag,
        }
    }

    pub fn workload(&self) -> WorkloadRef {
        WorkloadRef {
            kind: self.kind,
            namespace: self.namespace.clone(),
            name: self.resource_name.clone(),
        }
    }

    pub fn belongs_to(&self, workload: &WorkloadRef) -> bool {
        self.kind == workload.kind
            && self.namespace == workload.namespace
            && self.resource_name == workload.name
    }

    /// Same container slot, regardless of which tag it runs.
    pub fn same_container(&self, other: &ResourceKey) -> bool {
        self.kind == other.kind
            && self.namespace == other.namespace
            && self.resource_name == other.resource_name
            && self.container_name == other.container_name
    }
}

#[derive(Debug, Default)]
pub struct ResourceIndex {
    images: RwLock<HashMap<String, Vec<ResourceKey>>>,
}

impl ResourceIndex {
    /// Records `key` under `image_name`, replacing the slot of the same
    /// container if one is already present.
    #[cfg(test)]
    pub fn upsert(&self, image_name: &str, key: ResourceKey) {
        let mut images = self.write();
        upsert_locked(&mut images, image_name, key);
    }

    /// Moves an indexed container slot onto `tag`. Returns false, leaving the
    /// index untouched, when the slot is gone (its workload was deleted or
    /// the container no longer runs `image_name`).
    pub fn update_tag(&self, image_name: &str, key: &ResourceKey, tag: &str) -> bool {
        let mut images = self.write();
        let Some(slot) = images
            .get_mut(image_name)
            .and_then(|keys| keys.iter_mut().find(|k| k.same_container(key)))
        else {
            return false;
        };
        slot.image_tag = tag.to_string();
        true
    }

    /// Drops the keys of `workload` that run `image_name` at `tag`.
    pub fn remove(&self, image_name: &str, tag: &str, workload: &WorkloadRef) {
        let mut images = self.write();
        let Some(keys) = images.get_mut(image_name) else {
            return;
        };
        keys.retain(|k| !(k.image_tag == tag && k.belongs_to(workload)));
        if keys.is_empty() {
            images.remove(image_name);
        }
    }

    pub fn lookup(&self, image_name: &str) -> Option<Vec<ResourceKey>> {
        self.read().get(image_name).cloned()
    }

    /// Replaces everything known about `workload` with `keys` in one step.
    ///
    /// Slots whose container or image name no longer appears in `keys` are
    /// dropped, the rest are upserted.
    pub fn sync_workload(&self, workload: &WorkloadRef, keys: Vec<ResourceKey>) {
        let mut images = self.write();
        retain_locked(&mut images, |existing| {
            !existing.belongs_to(workload)
                || keys.iter().any(|k| {
                    k.same_container(existing) && k.image_name == existing.image_name
                })
        });
        for key in keys {
            let image_name = key.image_name.clone();
            upsert_locked(&mut images, &image_name, key);
        }
    }

    /// Keeps only the `kind` workloads for which `keep` returns true.
    pub fn retain_workloads<F>(&self, kind: WorkloadKind, keep: F)
    where
        F: Fn(&WorkloadRef) -> bool,
    {
        let mut images = self.write();
        retain_locked(&mut images, |k| k.kind != kind || keep(&k.workload()));
    }

    pub fn image_count(&self) -> usize {
        self.read().len()
    }

    pub fn key_count(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<ResourceKey>>> {
        self.images.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<ResourceKey>>> {
        self.images.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn upsert_locked(images: &mut HashMap<String, Vec<ResourceKey>>, image_name: &str, key: ResourceKey) {
    let keys = images.entry(image_name.to_string()).or_default();
    match keys.iter_mut().find(|k| k.same_container(&key)) {
        Some(slot) => *slot = key,
        None => keys.push(key),
    }
}

fn retain_locked<F>(images: &mut HashMap<String, Vec<ResourceKey>>, keep: F)
where
    F: Fn(&ResourceKey) -> bool,
{
    images.retain(|_, keys| {
        keys.retain(|k| keep(k));
        !keys.is_empty()
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(kind: WorkloadKind, namespace: &str, name: &str) -> WorkloadRef {
        WorkloadRef {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn key(workload: &WorkloadRef, container: &str, image: &str) -> ResourceKey {
        ResourceKey::new(workload, container, ImageReference::parse(image))
    }

    #[test]
    fn test_upsert_appends_first_key() {
        let index = ResourceIndex::default();
        let web = workload(WorkloadKind::Deployment, "web", "nginx");
        index.upsert("nginx", key(&web, "nginx", "nginx:1.14.2"));

        let keys = index.lookup("nginx").expect("nginx should be indexed");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].image_tag, "1.14.2");
    }

    #[test]
    fn test_upsert_replaces_same_container() {
        let index = ResourceIndex::default();
        let web = workload(WorkloadKind::Deployment, "web", "nginx");
        index.upsert("nginx", key(&web, "nginx", "nginx:1.14.2"));
        index.upsert("nginx", key(&web, "nginx", "nginx:1.14.3"));

        let keys = index.lookup("nginx").unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].image_tag, "1.14.3");
    }

    #[test]
    fn test_upsert_keeps_distinct_containers_apart() {
        let index = ResourceIndex::default();
        let web = workload(WorkloadKind::Deployment, "web", "nginx");
        index.upsert("nginx", key(&web, "main", "nginx:1.14.2"));
        index.upsert("nginx", key(&web, "canary", "nginx:1.15.0"));
        index.upsert("nginx", key(&web, "canary", "nginx:1.15.1"));

        let keys = index.lookup("nginx").unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].container_name, "main");
        assert_eq!(keys[0].image_tag, "1.14.2");
        assert_eq!(keys[1].image_tag, "1.15.1");
    }

    #[test]
    fn test_update_tag_moves_existing_slot() {
        let index = ResourceIndex::default();
        let web = workload(WorkloadKind::Deployment, "web", "nginx");
        let slot = key(&web, "nginx", "nginx:1.14.2");
        index.upsert("nginx", slot.clone());

        assert!(index.update_tag("nginx", &slot, "1.14.3"));
        let keys = index.lookup("nginx").unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].image_tag, "1.14.3");
    }

    #[test]
    fn test_update_tag_never_recreates_removed_slot() {
        let index = ResourceIndex::default();
        let web = workload(WorkloadKind::Deployment, "web", "nginx");
        let slot = key(&web, "nginx", "nginx:1.14.2");
        index.upsert("nginx", slot.clone());
        index.remove("nginx", "1.14.2", &web);

        assert!(!index.update_tag("nginx", &slot, "1.14.3"));
        assert!(index.lookup("nginx").is_none());
        assert_eq!(index.key_count(), 0);
    }

    #[test]
    fn test_remove_last_key_drops_image() {
        let index = ResourceIndex::default();
        let web = workload(WorkloadKind::Deployment, "web", "nginx");
        index.upsert("nginx", key(&web, "nginx", "nginx:1.14.2"));
        index.remove("nginx", "1.14.2", &web);

        assert!(index.lookup("nginx").is_none());
        assert_eq!(index.image_count(), 0);
    }

    #[test]
    fn test_remove_is_scoped_to_workload() {
        let index = ResourceIndex::default();
        let a = workload(WorkloadKind::Deployment, "web", "a");
        let b = workload(WorkloadKind::StatefulSet, "web", "b");
        index.upsert("nginx", key(&a, "nginx", "nginx:1.14.2"));
        index.upsert("nginx", key(&b, "nginx", "nginx:1.14.2"));
        index.remove("nginx", "1.14.2", &a);

        let keys = index.lookup("nginx").unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].resource_name, "b");
    }

    #[test]
    fn test_remove_other_tag_is_noop() {
        let index = ResourceIndex::default();
        let web = workload(WorkloadKind::Deployment, "web", "nginx");
        index.upsert("nginx", key(&web, "nginx", "nginx:1.14.2"));
        index.remove("nginx", "1.0", &web);
        index.remove("redis", "7", &web);

        assert_eq!(index.key_count(), 1);
    }

    #[test]
    fn test_sync_workload_drops_renamed_images() {
        let index = ResourceIndex::default();
        let web = workload(WorkloadKind::Deployment, "web", "frontend");
        index.sync_workload(
            &web,
            vec![
                key(&web, "app", "nginx:1.25"),
                key(&web, "sidecar", "envoy:1.30"),
            ],
        );
        index.sync_workload(&web, vec![key(&web, "app", "httpd:2.4")]);

        assert!(index.lookup("nginx").is_none());
        assert!(index.lookup("envoy").is_none());
        assert_eq!(index.lookup("httpd").unwrap()[0].image_tag, "2.4");
    }

    #[test]
    fn test_sync_workload_leaves_other_workloads() {
        let index = ResourceIndex::default();
        let a = workload(WorkloadKind::Deployment, "web", "a");
        let b = workload(WorkloadKind::Deployment, "web", "b");
        index.sync_workload(&a, vec![key(&a, "app", "nginx:1.25")]);
        index.sync_workload(&b, vec![key(&b, "app", "nginx:1.24")]);
        index.sync_workload(&a, vec![key(&a, "app", "nginx:1.26")]);

        let tags: Vec<_> = index
            .lookup("nginx")
            .unwrap()
            .into_iter()
            .map(|k| (k.resource_name, k.image_tag))
            .collect();
        assert_eq!(
            tags,
            vec![
                ("a".to_string(), "1.26".to_string()),
                ("b".to_string(), "1.24".to_string())
            ]
        );
    }

    #[test]
    fn test_retain_workloads_only_touches_kind() {
        let index = ResourceIndex::default();
        let deploy = workload(WorkloadKind::Deployment, "web", "gone");
        let sts = workload(WorkloadKind::StatefulSet, "web", "gone");
        index.upsert("nginx", key(&deploy, "app", "nginx:1.25"));
        index.upsert("nginx", key(&sts, "app", "nginx:1.25"));

        index.retain_workloads(WorkloadKind::Deployment, |_| false);

        let keys = index.lookup("nginx").unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].kind, WorkloadKind::StatefulSet);
    }
}
