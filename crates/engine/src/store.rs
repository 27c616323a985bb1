//! The narrow object-store interface the engine reconciles through.
//!
//! Implementations own transport, caching and retry concerns; the engine
//! only sees the taxonomy in [`StoreError`]. Absence is folded before it
//! reaches the engine: `get` answers `None` and `delete` succeeds when the
//! object is already gone.

use async_trait::async_trait;

use mirra_api::MirrorSource;
use mirra_core::{NamespaceView, ReplicaKey, SourceRef, StoreError, TemplateKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_source(&self, name: &str) -> Result<Option<MirrorSource>, StoreError>;

    /// Metadata write on the source (finalizer changes). Returns the
    /// stored object so callers continue with a fresh resource version.
    async fn update_source(&self, src: &MirrorSource) -> Result<MirrorSource, StoreError>;

    /// Status-subresource write; never races with spec edits.
    async fn update_status(&self, src: &MirrorSource) -> Result<(), StoreError>;

    async fn list_namespaces(&self) -> Result<Vec<NamespaceView>, StoreError>;

    /// Point-in-time replica lookup.
    async fn get(&self, key: &ReplicaKey) -> Result<Option<serde_json::Value>, StoreError>;

    async fn create(&self, obj: &serde_json::Value) -> Result<(), StoreError>;

    /// Whole-object replace; the object's `resourceVersion` is the
    /// conflict token.
    async fn update(&self, obj: &serde_json::Value) -> Result<(), StoreError>;

    async fn delete(&self, key: &ReplicaKey) -> Result<(), StoreError>;

    /// Bulk-delete every object of `kind` tagged with the source uid, in
    /// any namespace. Returns how many objects were removed.
    async fn delete_tagged(&self, kind: &TemplateKind, uid: &str) -> Result<usize, StoreError>;

    /// Observational only; never affects control flow.
    async fn emit_event(&self, src: &SourceRef, kind: EventKind, reason: &str, note: &str);
}
