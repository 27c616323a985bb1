//! `cluster.mirra.dev/v1alpha1` — the MirrorSource resource.
//!
//! A MirrorSource declares a template object and one namespace selection
//! rule; the engine materializes a copy of the template in every eligible
//! namespace. The template is kept as raw JSON so unknown fields survive
//! the round trip byte-for-byte. CRD schema generation is disabled; the
//! manifest is maintained with the deployment assets.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use mirra_core::labels::FINALIZER;
use mirra_core::{SourceRef, TemplateKind};
use mirra_select::RegexRules;

pub const API_VERSION: &str = "cluster.mirra.dev/v1alpha1";
pub const KIND: &str = "MirrorSource";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize)]
#[kube(
    group = "cluster.mirra.dev",
    version = "v1alpha1",
    kind = "MirrorSource",
    status = "MirrorSourceStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSourceSpec {
    /// Regex avoid/match rules over namespace names.
    #[serde(default)]
    pub namespace_rules: RegexRules,

    /// Label selector over namespace labels. Mutually exclusive with
    /// `namespaceRules`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,

    /// The object replicated verbatim into each eligible namespace.
    pub template: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSourceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Recent recoverable failures, pruned by a retention window.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub latest_errors: Vec<ReconcileError>,
}

/// One entry of the bounded error history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileError {
    pub date_time: Time,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub error: String,
}

impl MirrorSource {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Identity stamped into owner back-references on replicas.
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name: self.name().to_string(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            generation: self.metadata.generation.unwrap_or_default(),
        }
    }

    /// Name the replicas carry: the template's own name, falling back to
    /// the source name when the template omits it.
    pub fn dependents_name(&self) -> String {
        self.spec
            .template
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or(self.name())
            .to_string()
    }

    /// Group/version/kind of the template; both fields must be present.
    pub fn template_kind(&self) -> Result<TemplateKind, String> {
        let api_version = self
            .spec
            .template
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "template is missing apiVersion".to_string())?;
        let kind = self
            .spec
            .template
            .get("kind")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "template is missing kind".to_string())?;
        Ok(TemplateKind { api_version: api_version.to_string(), kind: kind.to_string() })
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }

    pub fn deletion_pending(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == FINALIZER))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(template: serde_json::Value) -> MirrorSource {
        let mut src = MirrorSource::new(
            "corp-pull",
            MirrorSourceSpec {
                namespace_rules: RegexRules::default(),
                label_selector: None,
                template,
            },
        );
        src.metadata.uid = Some("u-1".into());
        src
    }

    #[test]
    fn dependents_name_prefers_template_name() {
        let src = source(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "registry-pull"}
        }));
        assert_eq!(src.dependents_name(), "registry-pull");
    }

    #[test]
    fn dependents_name_falls_back_to_source_name() {
        let src = source(serde_json::json!({"apiVersion": "v1", "kind": "Secret"}));
        assert_eq!(src.dependents_name(), "corp-pull");
    }

    #[test]
    fn template_kind_requires_both_fields() {
        let src = source(serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap"}));
        let tk = src.template_kind().unwrap();
        assert_eq!(tk.kind, "ConfigMap");

        let src = source(serde_json::json!({"kind": "ConfigMap"}));
        assert!(src.template_kind().unwrap_err().contains("apiVersion"));

        let src = source(serde_json::json!({"apiVersion": "v1", "kind": ""}));
        assert!(src.template_kind().unwrap_err().contains("kind"));
    }

    #[test]
    fn unknown_template_fields_survive_round_trips() {
        let src = source(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "s"},
            "vendorExtension": {"keep": ["me", 1]}
        }));
        let json = serde_json::to_string(&src).unwrap();
        let back: MirrorSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back.spec.template["vendorExtension"]["keep"][0], "me");
    }
}
