#![forbid(unsafe_code)]

use std::sync::Arc;

use mirra_api::{MirrorSource, MirrorSourceSpec};
use mirra_core::labels::{CONDITION_READY, SOURCE_OBJECT};
use mirra_core::NamespaceView;
use mirra_engine::{Engine, EngineConfig, MemStore};
use mirra_select::RegexRules;

fn source(avoid: &[&str], matches: &[&str]) -> MirrorSource {
    let mut src = MirrorSource::new(
        "corp-pull",
        MirrorSourceSpec {
            namespace_rules: RegexRules {
                avoid: avoid.iter().map(|s| s.to_string()).collect(),
                matches: matches.iter().map(|s| s.to_string()).collect(),
            },
            label_selector: None,
            template: serde_json::json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "metadata": {"name": "registry-pull"},
                "type": "Opaque",
                "data": {"token": "dg=="}
            }),
        },
    );
    src.metadata.uid = Some("uid-1".into());
    src.metadata.generation = Some(1);
    src
}

fn store_with(namespaces: &[&str], src: MirrorSource) -> Arc<MemStore> {
    let store = Arc::new(MemStore::new());
    for ns in namespaces {
        store.add_namespace(NamespaceView::new(*ns));
    }
    store.set_source(src);
    store
}

fn engine(store: &Arc<MemStore>) -> Engine {
    Engine::new(store.clone(), EngineConfig::default())
}

#[tokio::test]
async fn creates_only_in_matching_namespaces() {
    let store = store_with(&["prod-a", "dev-b"], source(&[], &["^prod-.*"]));
    let outcome = engine(&store).reconcile("corp-pull").await.unwrap();

    assert_eq!(outcome.created, 1);
    assert_eq!(outcome.unchanged, 1);
    let replica = store.object("prod-a", "registry-pull").unwrap();
    assert_eq!(replica["metadata"]["labels"][SOURCE_OBJECT], "uid-1");
    assert_eq!(replica["metadata"]["ownerReferences"][0]["kind"], "MirrorSource");
    assert!(store.object("dev-b", "registry-pull").is_none());
}

#[tokio::test]
async fn avoid_wins_over_blanket_match() {
    let store = store_with(&["kube-system", "default"], source(&["^kube-.*"], &[".*"]));
    let outcome = engine(&store).reconcile("corp-pull").await.unwrap();

    assert_eq!(outcome.created, 1);
    assert!(store.object("kube-system", "registry-pull").is_none());
    assert!(store.object("default", "registry-pull").is_some());
}

#[tokio::test]
async fn steady_state_reconcile_mutates_nothing() {
    let store = store_with(&["prod-a", "prod-b"], source(&[], &["^prod-.*"]));
    let eng = engine(&store);

    eng.reconcile("corp-pull").await.unwrap();
    let writes_after_first = store.replica_writes();
    let status_after_first = store.status_writes();
    assert_eq!(writes_after_first, 2);

    let outcome = eng.reconcile("corp-pull").await.unwrap();
    assert_eq!(outcome.created + outcome.updated + outcome.deleted, 0);
    assert_eq!(store.replica_writes(), writes_after_first);
    assert_eq!(store.status_writes(), status_after_first);
}

#[tokio::test]
async fn drifted_replica_is_rewritten() {
    let store = store_with(&["prod-a"], source(&[], &["^prod-.*"]));
    let eng = engine(&store);
    eng.reconcile("corp-pull").await.unwrap();

    let mut replica = store.object("prod-a", "registry-pull").unwrap();
    replica["data"]["token"] = serde_json::json!("dHdlYWtlZA==");
    store.insert_object("prod-a", "registry-pull", replica);

    let outcome = eng.reconcile("corp-pull").await.unwrap();
    assert_eq!(outcome.updated, 1);
    let replica = store.object("prod-a", "registry-pull").unwrap();
    assert_eq!(replica["data"]["token"], "dg==");
}

#[tokio::test]
async fn foreign_object_is_never_touched() {
    let store = store_with(&["prod-a"], source(&[], &["^prod-.*"]));
    let foreign = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": "registry-pull", "namespace": "prod-a"},
        "data": {"theirs": "x"}
    });
    store.insert_object("prod-a", "registry-pull", foreign.clone());

    let outcome = engine(&store).reconcile("corp-pull").await.unwrap();
    assert_eq!(outcome.created + outcome.updated + outcome.deleted, 0);
    assert_eq!(store.replica_writes(), 0);
    assert_eq!(store.object("prod-a", "registry-pull").unwrap(), foreign);
}

#[tokio::test]
async fn foreign_object_survives_a_delete_decision() {
    // Rule says the replica should not exist, an unrelated object holds
    // the name: the delete is vetoed silently.
    let store = store_with(&["prod-a"], source(&["^prod-.*"], &[".*"]));
    let foreign = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": {"name": "registry-pull", "namespace": "prod-a"},
        "data": {"theirs": "x"}
    });
    store.insert_object("prod-a", "registry-pull", foreign.clone());

    let outcome = engine(&store).reconcile("corp-pull").await.unwrap();
    assert_eq!(outcome.deleted, 0);
    assert_eq!(store.object("prod-a", "registry-pull").unwrap(), foreign);
}

#[tokio::test]
async fn owned_replica_is_deleted_when_namespace_stops_matching() {
    let store = store_with(&["prod-a"], source(&[], &["^prod-.*"]));
    let eng = engine(&store);
    eng.reconcile("corp-pull").await.unwrap();
    assert!(store.object("prod-a", "registry-pull").is_some());

    // The rule tightens; prod-a is no longer eligible.
    let mut src = store.source().unwrap();
    src.spec.namespace_rules = RegexRules { avoid: vec![], matches: vec!["^stage-.*".into()] };
    store.set_source(src);

    let outcome = eng.reconcile("corp-pull").await.unwrap();
    assert_eq!(outcome.deleted, 1);
    assert!(store.object("prod-a", "registry-pull").is_none());
}

#[tokio::test]
async fn deleting_namespace_is_not_a_target() {
    let store = Arc::new(MemStore::new());
    let mut terminating = NamespaceView::new("prod-a");
    terminating.deleting = true;
    store.add_namespace(terminating);
    store.set_source(source(&[], &["^prod-.*"]));

    let outcome = engine(&store).reconcile("corp-pull").await.unwrap();
    assert_eq!(outcome.created, 0);
    assert_eq!(store.object_count(), 0);
}

#[tokio::test]
async fn first_reconcile_installs_the_cleanup_marker() {
    let store = store_with(&[], source(&[], &[".*"]));
    assert!(!store.source().unwrap().has_finalizer());

    engine(&store).reconcile("corp-pull").await.unwrap();
    assert!(store.source().unwrap().has_finalizer());
}

#[tokio::test]
async fn invalid_pattern_aborts_and_is_recorded() {
    let store = store_with(&["prod-a"], source(&[], &["("]));
    let err = engine(&store).reconcile("corp-pull").await.unwrap_err();
    assert!(!err.retryable());

    let src = store.source().unwrap();
    let status = src.status.unwrap();
    assert_eq!(status.latest_errors.len(), 1);
    assert!(status.latest_errors[0].namespace.is_none());
    let ready = status.conditions.iter().find(|c| c.type_ == CONDITION_READY).unwrap();
    assert_eq!(ready.status, "False");
    assert_eq!(ready.reason, "FailedToCalculateNamespace");
    // Nothing was replicated.
    assert_eq!(store.replica_writes(), 0);
}

#[tokio::test]
async fn success_sets_ready_with_observed_generation() {
    let store = store_with(&["prod-a"], source(&[], &["^prod-.*"]));
    engine(&store).reconcile("corp-pull").await.unwrap();

    let src = store.source().unwrap();
    let status = src.status.unwrap();
    let ready = status.conditions.iter().find(|c| c.type_ == CONDITION_READY).unwrap();
    assert_eq!(ready.status, "True");
    assert_eq!(ready.reason, "ReconcileSucceeded");
    assert_eq!(ready.observed_generation, Some(1));
}

#[tokio::test]
async fn missing_source_is_a_clean_noop() {
    let store = Arc::new(MemStore::new());
    let outcome = engine(&store).reconcile("nobody").await.unwrap();
    assert_eq!(outcome, Default::default());
    assert!(outcome.requeue.is_none());
}

#[tokio::test]
async fn label_selector_strategy_targets_labelled_namespaces() {
    let mut src = source(&[], &[]);
    src.spec.label_selector = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
        match_labels: Some([("mirror".to_string(), "on".to_string())].into()),
        ..Default::default()
    });

    let store = Arc::new(MemStore::new());
    let mut labelled = NamespaceView::new("team-a");
    labelled.labels.insert("mirror".into(), "on".into());
    store.add_namespace(labelled);
    store.add_namespace(NamespaceView::new("team-b"));
    store.set_source(src);

    let outcome = engine(&store).reconcile("corp-pull").await.unwrap();
    assert_eq!(outcome.created, 1);
    assert!(store.object("team-a", "registry-pull").is_some());
    assert!(store.object("team-b", "registry-pull").is_none());
}

#[tokio::test]
async fn template_without_kind_is_a_validation_error() {
    let mut src = source(&[], &[".*"]);
    src.spec.template = serde_json::json!({"metadata": {"name": "x"}});
    let store = store_with(&["prod-a"], src);

    let err = engine(&store).reconcile("corp-pull").await.unwrap_err();
    assert!(!err.retryable());
    let src = store.source().unwrap();
    let ready = src
        .status
        .unwrap()
        .conditions
        .into_iter()
        .find(|c| c.type_ == CONDITION_READY)
        .unwrap();
    assert_eq!(ready.reason, "FailedTemplateValidation");
}
