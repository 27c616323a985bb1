//! Executes planned actions: renders the desired replica from the
//! template and drives the store.

use serde_json::{json, Value};

use mirra_core::labels::{K8S_MANAGED_BY, MANAGED_BY_VALUE, SOURCE_OBJECT};
use mirra_core::{ReplicaKey, SourceRef, StoreError};

use crate::store::ObjectStore;

/// Desired state of one replica: the template deep-copied into the target
/// namespace, stamped with the replica tag (label and annotation), the
/// managed-by label and the owner back-reference. Server-populated
/// metadata that may ride along in the template is dropped.
pub fn render(template: &Value, key: &ReplicaKey, src: &SourceRef) -> Value {
    let mut obj = template.clone();
    let Some(map) = obj.as_object_mut() else {
        return template.clone();
    };
    let meta = map.entry("metadata").or_insert_with(|| json!({}));
    if let Some(meta) = meta.as_object_mut() {
        for noisy in ["resourceVersion", "uid", "creationTimestamp", "generation", "managedFields"] {
            meta.remove(noisy);
        }
        meta.insert("name".into(), json!(key.name));
        meta.insert("namespace".into(), json!(key.namespace));
        let labels = meta.entry("labels").or_insert_with(|| json!({}));
        if let Some(labels) = labels.as_object_mut() {
            labels.insert(SOURCE_OBJECT.into(), json!(src.uid));
            labels.insert(K8S_MANAGED_BY.into(), json!(MANAGED_BY_VALUE));
        }
        let annotations = meta.entry("annotations").or_insert_with(|| json!({}));
        if let Some(annotations) = annotations.as_object_mut() {
            annotations.insert(SOURCE_OBJECT.into(), json!(src.uid));
        }
        meta.insert("ownerReferences".into(), json!([src.owner_reference()]));
    }
    obj
}

/// Does the live object already carry the desired state? Compared over
/// what the template specifies: every non-metadata key of the desired
/// object, plus our label/annotation stamps and the owner back-reference.
/// Server-populated extras on the live object do not count as drift.
pub fn in_sync(live: &Value, desired: &Value) -> bool {
    let (Some(dmap), Some(lmap)) = (desired.as_object(), live.as_object()) else {
        return false;
    };
    for (k, dv) in dmap {
        if k == "metadata" || k == "status" {
            continue;
        }
        if lmap.get(k) != Some(dv) {
            return false;
        }
    }
    for field in ["labels", "annotations"] {
        let want = string_map(desired, field);
        let have = string_map(live, field);
        if want.iter().any(|(k, v)| have.get(k) != Some(v)) {
            return false;
        }
    }
    let src_uid = desired
        .pointer("/metadata/ownerReferences/0/uid")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    live.pointer("/metadata/ownerReferences")
        .and_then(|o| o.as_array())
        .map(|refs| refs.iter().any(|r| r.get("uid").and_then(|v| v.as_str()) == Some(src_uid)))
        .unwrap_or(false)
}

fn string_map(raw: &Value, field: &str) -> std::collections::BTreeMap<String, String> {
    let mut out = std::collections::BTreeMap::new();
    if let Some(obj) = raw
        .get("metadata")
        .and_then(|m| m.get(field))
        .and_then(|v| v.as_object())
    {
        for (k, v) in obj {
            if let Some(s) = v.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
    }
    out
}

pub async fn create(
    store: &dyn ObjectStore,
    template: &Value,
    key: &ReplicaKey,
    src: &SourceRef,
) -> Result<(), StoreError> {
    store.create(&render(template, key, src)).await
}

/// Full replace of an owned replica. Returns `false` when the live object
/// already matches and no write was issued; that skip is what keeps a
/// steady-state reconcile free of store mutations. The live
/// `resourceVersion` is carried onto the write so concurrent edits fail
/// the replace instead of being overwritten blindly.
pub async fn update(
    store: &dyn ObjectStore,
    template: &Value,
    key: &ReplicaKey,
    src: &SourceRef,
    live: &Value,
) -> Result<bool, StoreError> {
    let mut desired = render(template, key, src);
    if in_sync(live, &desired) {
        return Ok(false);
    }
    if let Some(rv) = live.pointer("/metadata/resourceVersion").cloned() {
        if let Some(meta) = desired.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), rv);
        }
    }
    store.update(&desired).await?;
    Ok(true)
}

pub async fn delete(store: &dyn ObjectStore, key: &ReplicaKey) -> Result<(), StoreError> {
    store.delete(key).await
}
