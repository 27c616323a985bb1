//! Two-phase finalization: hold the source with a cleanup marker while it
//! lives, sweep its replicas when deletion is requested, and only then
//! release it.

use tracing::{debug, info};

use mirra_api::MirrorSource;
use mirra_core::labels::FINALIZER;
use mirra_core::{StoreError, TemplateKind};

use crate::store::ObjectStore;

/// Guard phase, run on every reconcile while the source is alive: make
/// sure the cleanup marker is present so the store defers hard deletion
/// until the sweep has run. Returns the stored object when a write
/// happened, `None` when the marker was already there.
pub async fn ensure_marker(
    store: &dyn ObjectStore,
    src: &MirrorSource,
) -> Result<Option<MirrorSource>, StoreError> {
    if src.has_finalizer() {
        return Ok(None);
    }
    debug!(source = %src.name(), "adding cleanup marker");
    let mut updated = src.clone();
    updated
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(FINALIZER.to_string());
    store.update_source(&updated).await.map(Some)
}

/// Sweep phase, run once deletion is pending. Replicas are located by the
/// replica-tag label alone, independent of current namespace eligibility,
/// so copies in namespaces that vanished or stopped matching the rule are
/// removed too. The marker comes off strictly after the bulk delete
/// succeeds; any failure leaves it in place and the whole sweep reruns on
/// the next trigger.
pub async fn sweep(
    store: &dyn ObjectStore,
    src: &MirrorSource,
    kind: &TemplateKind,
) -> Result<usize, StoreError> {
    let uid = src.metadata.uid.clone().unwrap_or_default();
    let removed = store.delete_tagged(kind, &uid).await?;
    info!(source = %src.name(), removed, "replica sweep complete");

    let mut updated = src.clone();
    if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != FINALIZER);
    }
    store.update_source(&updated).await?;
    Ok(removed)
}
