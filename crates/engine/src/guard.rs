//! Ownership verification before any mutation of an existing object.

use mirra_core::SourceRef;

/// May the engine touch `live`? Only when it carries an owner
/// back-reference whose uid and apiVersion/kind all match the source.
/// Objects that merely collide on name and namespace stay untouched; the
/// caller downgrades the action to a no-op without raising an error.
pub fn may_mutate(live: &serde_json::Value, src: &SourceRef) -> bool {
    live.get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(|o| o.as_array())
        .map(|refs| {
            refs.iter().any(|r| {
                r.get("uid").and_then(|v| v.as_str()) == Some(src.uid.as_str())
                    && r.get("kind").and_then(|v| v.as_str()) == Some(src.kind.as_str())
                    && r.get("apiVersion").and_then(|v| v.as_str())
                        == Some(src.api_version.as_str())
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> SourceRef {
        SourceRef {
            api_version: "cluster.mirra.dev/v1alpha1".into(),
            kind: "MirrorSource".into(),
            name: "s".into(),
            uid: "uid-1".into(),
            generation: 1,
        }
    }

    #[test]
    fn owned_object_passes() {
        let live = serde_json::json!({
            "metadata": {"ownerReferences": [{
                "apiVersion": "cluster.mirra.dev/v1alpha1",
                "kind": "MirrorSource",
                "name": "s",
                "uid": "uid-1",
            }]}
        });
        assert!(may_mutate(&live, &src()));
    }

    #[test]
    fn missing_back_reference_is_vetoed() {
        let live = serde_json::json!({"metadata": {"name": "x"}});
        assert!(!may_mutate(&live, &src()));
    }

    #[test]
    fn uid_mismatch_is_vetoed() {
        let live = serde_json::json!({
            "metadata": {"ownerReferences": [{
                "apiVersion": "cluster.mirra.dev/v1alpha1",
                "kind": "MirrorSource",
                "uid": "somebody-else",
            }]}
        });
        assert!(!may_mutate(&live, &src()));
    }

    #[test]
    fn kind_mismatch_is_vetoed() {
        let live = serde_json::json!({
            "metadata": {"ownerReferences": [{
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "uid": "uid-1",
            }]}
        });
        assert!(!may_mutate(&live, &src()));
    }
}
