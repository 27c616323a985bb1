//! Namespace eligibility for replication sources.
//!
//! Two interchangeable strategies: regex avoid/match lists over the
//! namespace name, or a Kubernetes label selector over the namespace
//! labels. A source carries exactly one; [`SelectionRule::resolve`] picks
//! it once per reconcile instead of probing annotations on every
//! evaluation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::labels::{Selector, SelectorExt};
use regex::Regex;
use serde::{Deserialize, Serialize};

use mirra_core::labels::{ANNOTATION_RGX_AVOID, ANNOTATION_RGX_CONFIG, ANNOTATION_RGX_MATCH};
use mirra_core::NamespaceView;

/// Regex rule lists. Avoid patterns are evaluated first and win over
/// match patterns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegexRules {
    #[serde(default)]
    pub avoid: Vec<String>,

    #[serde(default, rename = "match")]
    pub matches: Vec<String>,
}

impl RegexRules {
    pub fn is_empty(&self) -> bool {
        self.avoid.is_empty() && self.matches.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("invalid pattern {pattern:?}: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid label selector: {0}")]
    BadSelector(String),
    #[error("invalid {key} annotation: {reason}")]
    BadAnnotation { key: &'static str, reason: String },
    #[error("ambiguous selection rule: both namespaceRules and labelSelector are set")]
    AmbiguousRule,
    #[error("no selection rule configured")]
    MissingRule,
}

/// The resolved selection strategy of one source.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionRule {
    Regex(RegexRules),
    Selector(LabelSelector),
}

impl SelectionRule {
    /// Resolve the one rule a source carries: an explicit label selector,
    /// explicit regex rules, or the legacy annotation-carried form, in
    /// that order. Carrying both explicit forms is an error rather than a
    /// silent preference.
    pub fn resolve(
        rules: &RegexRules,
        selector: Option<&LabelSelector>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Self, SelectError> {
        match (selector, rules.is_empty()) {
            (Some(_), false) => Err(SelectError::AmbiguousRule),
            (Some(s), true) => Ok(Self::Selector(s.clone())),
            (None, false) => Ok(Self::Regex(rules.clone())),
            (None, true) => Self::from_annotations(annotations)?.ok_or(SelectError::MissingRule),
        }
    }

    /// Legacy wire convention: a consolidated JSON blob under
    /// `mirra.dev/rgx.config`, or `;`-joined pattern lists under
    /// `mirra.dev/rgx.avoid` / `mirra.dev/rgx.match`.
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<Self>, SelectError> {
        if let Some(blob) = annotations.get(ANNOTATION_RGX_CONFIG) {
            let rules: RegexRules =
                serde_json::from_str(blob).map_err(|e| SelectError::BadAnnotation {
                    key: ANNOTATION_RGX_CONFIG,
                    reason: e.to_string(),
                })?;
            return Ok(Some(Self::Regex(rules)));
        }

        let avoid = annotations.get(ANNOTATION_RGX_AVOID).map(|s| split_list(s));
        let matches = annotations.get(ANNOTATION_RGX_MATCH).map(|s| split_list(s));
        if avoid.is_none() && matches.is_none() {
            return Ok(None);
        }
        Ok(Some(Self::Regex(RegexRules {
            avoid: avoid.unwrap_or_default(),
            matches: matches.unwrap_or_default(),
        })))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.trim_matches(';')
        .split(';')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Should a replica of the source exist in `ns`?
///
/// A namespace pending deletion is never eligible, regardless of the
/// rule. For the regex strategy, any avoid match excludes the namespace
/// before the match list is consulted; an uncompilable pattern stops
/// evaluation with an error, and no pattern after the bad one runs.
/// Patterns are recompiled per call, which is fine at reconcile
/// frequencies; a compile cache keyed by pattern string would not change
/// observable behavior.
pub fn should_exist(rule: &SelectionRule, ns: &NamespaceView) -> Result<bool, SelectError> {
    if ns.deleting {
        return Ok(false);
    }
    match rule {
        SelectionRule::Regex(rules) => {
            if list_matches(&rules.avoid, &ns.name)? {
                return Ok(false);
            }
            list_matches(&rules.matches, &ns.name)
        }
        SelectionRule::Selector(selector) => {
            let sel = Selector::try_from(selector.clone())
                .map_err(|e| SelectError::BadSelector(e.to_string()))?;
            Ok(sel.matches(&ns.labels))
        }
    }
}

fn list_matches(patterns: &[String], name: &str) -> Result<bool, SelectError> {
    for pattern in patterns {
        let re = Regex::new(pattern).map_err(|e| SelectError::BadPattern {
            pattern: pattern.clone(),
            source: e,
        })?;
        if re.is_match(name) {
            return Ok(true);
        }
    }
    Ok(false)
}
