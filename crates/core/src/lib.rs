//! Mirra core types: source identity, namespace views, replica addressing
//! and the store-boundary error taxonomy. No Kubernetes client dependencies
//! live here; everything heavier sits in `mirra-kubehub`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod labels;

/// Identity of a replication source, as stamped into owner back-references
/// on its replicas. `uid` is the opaque cluster-assigned unique id; it is
/// also the value of the replica-tag label used by the finalization sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    /// Spec generation observed when this ref was taken.
    pub generation: i64,
}

impl SourceRef {
    /// Owner reference entry for replicas, in wire form.
    pub fn owner_reference(&self) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": self.api_version,
            "kind": self.kind,
            "name": self.name,
            "uid": self.uid,
            "controller": true,
        })
    }
}

/// Point-in-time view of a namespace: name, labels and whether the
/// namespace is already on its way out. A namespace pending deletion is
/// never an eligible replication target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceView {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub deleting: bool,
}

impl NamespaceView {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), labels: BTreeMap::new(), deleting: false }
    }
}

/// Group/version/kind of the replicated template, the coordinate the store
/// needs to pick the right API endpoint for replica operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TemplateKind {
    pub api_version: String,
    pub kind: String,
}

/// Full address of one replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaKey {
    pub kind: TemplateKind,
    pub namespace: String,
    pub name: String,
}

/// Errors at the object-store boundary. `NotFound` exists so store
/// implementations can fold it before it ever reaches the engine (absent
/// objects are a normal planner input, not a failure).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("invalid: {0}")]
    Invalid(String),
}

/// Pull `metadata.<field>` as a string out of a raw object.
pub fn meta_str<'a>(raw: &'a serde_json::Value, field: &str) -> Option<&'a str> {
    raw.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
}

/// Labels of a raw object as an owned map. Missing or malformed label
/// blocks read as empty.
pub fn meta_labels(raw: &serde_json::Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(obj) = raw
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.as_object())
    {
        for (k, v) in obj {
            if let Some(s) = v.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
    }
    out
}
