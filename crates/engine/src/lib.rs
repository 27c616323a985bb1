//! Mirra replication engine: decides, per namespace, whether a replica of
//! a source template should exist, and drives the store toward that state.
//!
//! The engine is invoked once per source identity by an external
//! dispatcher that serializes invocations per key. Within one invocation
//! the namespace loop is strictly sequential and fail-fast: the first
//! error aborts the pass after being recorded on the source status, and
//! the dispatcher retries the whole pass. Every invocation re-derives the
//! full picture from the store, so replays are safe.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use mirra_api::{MirrorSource, MirrorSourceStatus};
use mirra_core::labels::CONDITION_READY;
use mirra_core::{ReplicaKey, StoreError};
use mirra_select::SelectionRule;

pub mod actuate;
pub mod finalize;
pub mod guard;
pub mod memstore;
pub mod plan;
pub mod status;
pub mod store;

pub use memstore::MemStore;
pub use plan::Action;
pub use store::{EventKind, ObjectStore};

/// Immutable engine configuration, constructed once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Requeue interval for periodic resync.
    pub sync_period: Duration,
    /// Retention window for the status error history.
    pub error_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_secs(600),
            error_retention: Duration::from_secs(900),
        }
    }
}

/// Where a reconcile pass failed; becomes the condition reason
/// (`Failed<Step>`) and the event reason (`<Step>Error`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SourceFetch,
    SourceUpdate,
    TemplateValidation,
    CalculateNamespace,
    NamespaceList,
    ObjectFetch,
    ObjectCreation,
    ObjectUpdate,
    ObjectDeletion,
    Finalization,
    StatusUpdate,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::SourceFetch => "SourceFetch",
            Step::SourceUpdate => "SourceUpdate",
            Step::TemplateValidation => "TemplateValidation",
            Step::CalculateNamespace => "ToCalculateNamespace",
            Step::NamespaceList => "NamespaceList",
            Step::ObjectFetch => "ObjectFetch",
            Step::ObjectCreation => "ObjectCreation",
            Step::ObjectUpdate => "ObjectUpdate",
            Step::ObjectDeletion => "ObjectDeletion",
            Step::Finalization => "Finalization",
            Step::StatusUpdate => "StatusUpdate",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Definition problems a retry cannot fix until the spec is edited.
    #[error("{message}")]
    Validation { step: Step, message: String },

    /// Store failure; the dispatcher retries and the next pass recomputes
    /// everything from scratch.
    #[error("{step} failed: {source}")]
    Store {
        step: Step,
        #[source]
        source: StoreError,
    },
}

impl EngineError {
    pub fn step(&self) -> Step {
        match self {
            EngineError::Validation { step, .. } => *step,
            EngineError::Store { step, .. } => *step,
        }
    }

    /// Transient and conflict failures are worth a prompt retry;
    /// validation failures are not until the definition changes.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Store { source: StoreError::Transient(_) | StoreError::Conflict(_), .. }
        )
    }
}

fn store_err(step: Step, source: StoreError) -> EngineError {
    EngineError::Store { step, source }
}

/// Result of one reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// The source was released for deletion during this pass.
    pub finalized: bool,
    /// When the dispatcher should run again without an external trigger.
    pub requeue: Option<Duration>,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

pub struct Engine {
    store: Arc<dyn ObjectStore>,
    cfg: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn ObjectStore>, cfg: EngineConfig) -> Self {
        Self { store, cfg }
    }

    /// One full evaluation pass for the named source.
    pub async fn reconcile(&self, name: &str) -> Result<Outcome, EngineError> {
        let t0 = Instant::now();
        counter!("reconcile_attempts", 1u64);

        let mut src = match self.store.get_source(name).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                debug!(source = %name, "source gone, nothing to do");
                return Ok(Outcome::default());
            }
            Err(e) => {
                counter!("reconcile_errors", 1u64);
                return Err(store_err(Step::SourceFetch, e));
            }
        };

        if src.deletion_pending() {
            let finalized = self.finalize(&mut src).await?;
            histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            return Ok(Outcome {
                finalized,
                requeue: if finalized { None } else { Some(self.cfg.sync_period) },
                ..Outcome::default()
            });
        }

        // Guard phase of finalization: hold the source before touching
        // anything else so deletion can never outrun the sweep.
        match finalize::ensure_marker(self.store.as_ref(), &src).await {
            Ok(Some(updated)) => src = updated,
            Ok(None) => {}
            Err(e) => {
                let err = store_err(Step::SourceUpdate, e);
                return Err(self.fail(&mut src, None, err).await);
            }
        }

        let template_kind = match src.template_kind() {
            Ok(k) => k,
            Err(message) => {
                let err = EngineError::Validation { step: Step::TemplateValidation, message };
                return Err(self.fail(&mut src, None, err).await);
            }
        };

        let rule = match SelectionRule::resolve(
            &src.spec.namespace_rules,
            src.spec.label_selector.as_ref(),
            &src.annotations(),
        ) {
            Ok(r) => r,
            Err(e) => {
                let err = EngineError::Validation {
                    step: Step::CalculateNamespace,
                    message: e.to_string(),
                };
                return Err(self.fail(&mut src, None, err).await);
            }
        };

        let namespaces = match self.store.list_namespaces().await {
            Ok(n) => n,
            Err(e) => {
                let err = store_err(Step::NamespaceList, e);
                return Err(self.fail(&mut src, None, err).await);
            }
        };

        let src_ref = src.source_ref();
        let replica_name = src.dependents_name();
        let template = src.spec.template.clone();
        let (mut created, mut updated, mut deleted, mut unchanged) = (0, 0, 0, 0);
        let mut eligible = 0;

        for ns in &namespaces {
            let should_exist = match mirra_select::should_exist(&rule, ns) {
                Ok(b) => b,
                Err(e) => {
                    // Rule errors are a property of the definition, not of
                    // the namespace that happened to trigger them.
                    let err = EngineError::Validation {
                        step: Step::CalculateNamespace,
                        message: e.to_string(),
                    };
                    return Err(self.fail(&mut src, None, err).await);
                }
            };

            let key = ReplicaKey {
                kind: template_kind.clone(),
                namespace: ns.name.clone(),
                name: replica_name.clone(),
            };
            let live = match self.store.get(&key).await {
                Ok(v) => v,
                Err(e) => {
                    let err = store_err(Step::ObjectFetch, e);
                    return Err(self.fail(&mut src, Some(&ns.name), err).await);
                }
            };

            if should_exist {
                eligible += 1;
            }
            let action = plan::plan(should_exist, live.is_some());
            debug!(namespace = %ns.name, should_exist, does_exist = live.is_some(), ?action, "planned");

            match (action, live) {
                (Action::Ignore, _) => unchanged += 1,
                (Action::Create, _) => {
                    if let Err(e) =
                        actuate::create(self.store.as_ref(), &template, &key, &src_ref).await
                    {
                        let err = store_err(Step::ObjectCreation, e);
                        return Err(self.fail(&mut src, Some(&ns.name), err).await);
                    }
                    counter!("replica_creates", 1u64);
                    created += 1;
                    self.store
                        .emit_event(
                            &src_ref,
                            EventKind::Normal,
                            "Created",
                            &format!("created {}/{}", ns.name, replica_name),
                        )
                        .await;
                }
                (Action::Update, Some(live)) => {
                    if !guard::may_mutate(&live, &src_ref) {
                        debug!(namespace = %ns.name, "existing object is not ours, leaving it alone");
                        unchanged += 1;
                        continue;
                    }
                    match actuate::update(self.store.as_ref(), &template, &key, &src_ref, &live)
                        .await
                    {
                        Ok(true) => {
                            counter!("replica_updates", 1u64);
                            updated += 1;
                        }
                        Ok(false) => unchanged += 1,
                        Err(e) => {
                            let err = store_err(Step::ObjectUpdate, e);
                            return Err(self.fail(&mut src, Some(&ns.name), err).await);
                        }
                    }
                }
                (Action::Delete, Some(live)) => {
                    if !guard::may_mutate(&live, &src_ref) {
                        debug!(namespace = %ns.name, "existing object is not ours, leaving it alone");
                        unchanged += 1;
                        continue;
                    }
                    if let Err(e) = actuate::delete(self.store.as_ref(), &key).await {
                        let err = store_err(Step::ObjectDeletion, e);
                        return Err(self.fail(&mut src, Some(&ns.name), err).await);
                    }
                    counter!("replica_deletes", 1u64);
                    deleted += 1;
                    self.store
                        .emit_event(
                            &src_ref,
                            EventKind::Normal,
                            "Deleted",
                            &format!("deleted {}/{}", ns.name, replica_name),
                        )
                        .await;
                }
                // The planner only answers Update/Delete when the lookup
                // found an object.
                (Action::Update | Action::Delete, None) => {}
            }
        }

        let now = Utc::now();
        let generation = src.metadata.generation.unwrap_or_default();
        // Phrased over desired state, not this pass's mutations, so a
        // steady-state pass leaves the condition byte-identical and the
        // status write is skipped.
        let message =
            format!("replica present in {eligible} of {} namespaces", namespaces.len());
        let changed = {
            let status = src.status.get_or_insert_with(MirrorSourceStatus::default);
            let pruned = status::prune_errors(status, now, self.retention());
            let condition = status::set_condition(
                status,
                CONDITION_READY,
                "True",
                "ReconcileSucceeded",
                &message,
                generation,
                now,
            );
            pruned || condition
        };
        if changed {
            if let Err(e) = self.store.update_status(&src).await {
                counter!("reconcile_errors", 1u64);
                warn!(source = %src.name(), error = %e, "unable to update status");
                return Err(store_err(Step::StatusUpdate, e));
            }
        }

        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(source = %src.name(), created, updated, deleted, unchanged, "reconcile ok");
        Ok(Outcome {
            finalized: false,
            requeue: Some(self.cfg.sync_period),
            created,
            updated,
            deleted,
            unchanged,
        })
    }

    /// Deletion path: sweep owned replicas everywhere, then release the
    /// source. While the sweep keeps failing, the marker stays and the
    /// whole phase reruns on the next trigger.
    async fn finalize(&self, src: &mut MirrorSource) -> Result<bool, EngineError> {
        if !src.has_finalizer() {
            debug!(source = %src.name(), "no cleanup marker held, deletion may proceed");
            return Ok(true);
        }
        let kind = match src.template_kind() {
            Ok(k) => k,
            Err(message) => {
                let err = EngineError::Validation { step: Step::TemplateValidation, message };
                return Err(self.fail(src, None, err).await);
            }
        };
        match finalize::sweep(self.store.as_ref(), src, &kind).await {
            Ok(removed) => {
                counter!("finalize_sweeps", 1u64);
                self.store
                    .emit_event(
                        &src.source_ref(),
                        EventKind::Normal,
                        "Finalized",
                        &format!("removed {removed} replicas"),
                    )
                    .await;
                Ok(true)
            }
            Err(e) => {
                let err = store_err(Step::Finalization, e);
                Err(self.fail(src, None, err).await)
            }
        }
    }

    /// Record a failure the way users can see it: error history entry,
    /// `Ready=False` with a per-step reason, and a Warning event. Status
    /// writes here are best-effort; the returned error is what aborts the
    /// pass.
    async fn fail(
        &self,
        src: &mut MirrorSource,
        namespace: Option<&str>,
        err: EngineError,
    ) -> EngineError {
        counter!("reconcile_errors", 1u64);
        warn!(
            source = %src.name(),
            step = %err.step(),
            namespace = namespace.unwrap_or(""),
            error = %err,
            "reconcile failed"
        );
        let now = Utc::now();
        let generation = src.metadata.generation.unwrap_or_default();
        let message = err.to_string();
        {
            let status = src.status.get_or_insert_with(MirrorSourceStatus::default);
            status::record_error(status, namespace, &message, now, self.retention());
            status::set_condition(
                status,
                CONDITION_READY,
                "False",
                &format!("Failed{}", err.step()),
                &message,
                generation,
                now,
            );
        }
        if let Err(e) = self.store.update_status(src).await {
            warn!(source = %src.name(), error = %e, "unable to record failure on status");
        }
        self.store
            .emit_event(
                &src.source_ref(),
                EventKind::Warning,
                &format!("{}Error", err.step()),
                &message,
            )
            .await;
        err
    }

    fn retention(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.cfg.error_retention)
            .unwrap_or_else(|_| chrono::Duration::minutes(15))
    }
}
