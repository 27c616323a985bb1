//! Simple in-memory `ObjectStore` for tests.
//!
//! Objects are keyed by (namespace, name); a single template kind per
//! store is enough for engine tests. Replica writes are counted so tests
//! can assert that a steady-state reconcile mutates nothing.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use mirra_api::MirrorSource;
use mirra_core::labels::SOURCE_OBJECT;
use mirra_core::{meta_labels, NamespaceView, ReplicaKey, SourceRef, StoreError, TemplateKind};

use crate::store::{EventKind, ObjectStore};

#[derive(Default)]
struct Inner {
    source: Option<MirrorSource>,
    namespaces: Vec<NamespaceView>,
    objects: HashMap<(String, String), serde_json::Value>,
    events: Vec<(EventKind, String, String)>,
    replica_writes: usize,
    status_writes: usize,
    fail_delete_tagged: bool,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_source(&self, src: MirrorSource) {
        self.inner.lock().unwrap().source = Some(src);
    }

    pub fn source(&self) -> Option<MirrorSource> {
        self.inner.lock().unwrap().source.clone()
    }

    pub fn add_namespace(&self, ns: NamespaceView) {
        self.inner.lock().unwrap().namespaces.push(ns);
    }

    pub fn insert_object(&self, namespace: &str, name: &str, obj: serde_json::Value) {
        self.inner
            .lock()
            .unwrap()
            .objects
            .insert((namespace.to_string(), name.to_string()), obj);
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<serde_json::Value> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    /// Objects still carrying the replica tag for `uid`, in any namespace.
    pub fn tagged_count(&self, uid: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .objects
            .values()
            .filter(|o| meta_labels(o).get(SOURCE_OBJECT).map(String::as_str) == Some(uid))
            .count()
    }

    pub fn replica_writes(&self) -> usize {
        self.inner.lock().unwrap().replica_writes
    }

    pub fn status_writes(&self) -> usize {
        self.inner.lock().unwrap().status_writes
    }

    pub fn events(&self) -> Vec<(EventKind, String, String)> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn fail_delete_tagged(&self, fail: bool) {
        self.inner.lock().unwrap().fail_delete_tagged = fail;
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn get_source(&self, name: &str) -> Result<Option<MirrorSource>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.source.clone().filter(|s| s.name() == name))
    }

    async fn update_source(&self, src: &MirrorSource) -> Result<MirrorSource, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.source = Some(src.clone());
        Ok(src.clone())
    }

    async fn update_status(&self, src: &MirrorSource) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.status_writes += 1;
        if let Some(stored) = inner.source.as_mut() {
            stored.status = src.status.clone();
        }
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceView>, StoreError> {
        Ok(self.inner.lock().unwrap().namespaces.clone())
    }

    async fn get(&self, key: &ReplicaKey) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .objects
            .get(&(key.namespace.clone(), key.name.clone()))
            .cloned())
    }

    async fn create(&self, obj: &serde_json::Value) -> Result<(), StoreError> {
        let namespace = mirra_core::meta_str(obj, "namespace").unwrap_or_default().to_string();
        let name = mirra_core::meta_str(obj, "name").unwrap_or_default().to_string();
        let mut inner = self.inner.lock().unwrap();
        if inner.objects.contains_key(&(namespace.clone(), name.clone())) {
            return Err(StoreError::Conflict(format!("{namespace}/{name} already exists")));
        }
        inner.objects.insert((namespace, name), obj.clone());
        inner.replica_writes += 1;
        Ok(())
    }

    async fn update(&self, obj: &serde_json::Value) -> Result<(), StoreError> {
        let namespace = mirra_core::meta_str(obj, "namespace").unwrap_or_default().to_string();
        let name = mirra_core::meta_str(obj, "name").unwrap_or_default().to_string();
        let mut inner = self.inner.lock().unwrap();
        if !inner.objects.contains_key(&(namespace.clone(), name.clone())) {
            return Err(StoreError::Transient(format!("{namespace}/{name} vanished")));
        }
        inner.objects.insert((namespace, name), obj.clone());
        inner.replica_writes += 1;
        Ok(())
    }

    async fn delete(&self, key: &ReplicaKey) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .objects
            .remove(&(key.namespace.clone(), key.name.clone()))
            .is_some()
        {
            inner.replica_writes += 1;
        }
        Ok(())
    }

    async fn delete_tagged(&self, _kind: &TemplateKind, uid: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_delete_tagged {
            return Err(StoreError::Transient("bulk delete unavailable".into()));
        }
        let keys: Vec<(String, String)> = inner
            .objects
            .iter()
            .filter(|(_, o)| meta_labels(o).get(SOURCE_OBJECT).map(String::as_str) == Some(uid))
            .map(|(k, _)| k.clone())
            .collect();
        let removed = keys.len();
        for k in keys {
            inner.objects.remove(&k);
        }
        inner.replica_writes += removed;
        Ok(removed)
    }

    async fn emit_event(&self, _src: &SourceRef, kind: EventKind, reason: &str, note: &str) {
        self.inner
            .lock()
            .unwrap()
            .events
            .push((kind, reason.to_string(), note.to_string()));
    }
}
