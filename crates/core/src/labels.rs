//! Well-known labels, annotations and the finalizer shared by every crate
//! that touches sources or replicas.

/// Label and annotation on every replica carrying the source's uid. The
/// label is the sole selector used by the finalization sweep.
pub const SOURCE_OBJECT: &str = "mirra.dev/src.object";

/// Legacy annotation-carried selection rules on a source: `;`-joined
/// regex lists.
pub const ANNOTATION_RGX_AVOID: &str = "mirra.dev/rgx.avoid";
pub const ANNOTATION_RGX_MATCH: &str = "mirra.dev/rgx.match";

/// Legacy consolidated rule annotation: JSON `{"avoid":[...],"match":[...]}`.
pub const ANNOTATION_RGX_CONFIG: &str = "mirra.dev/rgx.config";

/// Cleanup marker keeping a source alive until its replicas are swept.
pub const FINALIZER: &str = "mirra.dev/finalizer";

/// Standard label for the tool managing an object.
/// https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
pub const K8S_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value for [`K8S_MANAGED_BY`] on replicas.
pub const MANAGED_BY_VALUE: &str = "mirra";

/// The single readiness condition type maintained on source status.
pub const CONDITION_READY: &str = "Ready";
