//! Kube-backed `ObjectStore`: dynamic-object replica operations resolved
//! through API discovery, namespace listing, status subresource writes
//! and event publishing.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ObjectReference};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client, ResourceExt,
};
use metrics::counter;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use mirra_api::MirrorSource;
use mirra_core::labels::SOURCE_OBJECT;
use mirra_core::{meta_str, NamespaceView, ReplicaKey, SourceRef, StoreError, TemplateKind};
use mirra_engine::store::{EventKind, ObjectStore};

/// Object store over a live cluster. API resources for template kinds are
/// resolved via discovery once and cached for the process lifetime.
pub struct KubeStore {
    client: Client,
    reporter: Reporter,
    resources: RwLock<HashMap<TemplateKind, ApiResource>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: "mirra-controller".into(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self { client, reporter, resources: RwLock::new(HashMap::new()) }
    }

    fn sources(&self) -> Api<MirrorSource> {
        Api::all(self.client.clone())
    }

    /// Resolve the API resource for a template kind. Namespaced kinds
    /// only; a cluster-scoped template cannot be replicated per
    /// namespace.
    async fn resolve(&self, kind: &TemplateKind) -> Result<ApiResource, StoreError> {
        if let Some(ar) = self.resources.read().await.get(kind) {
            return Ok(ar.clone());
        }
        counter!("kube_discovery_resolves", 1u64);
        let gvk = parse_gvk(kind);
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| StoreError::Transient(format!("discovery: {e}")))?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    if !matches!(caps.scope, Scope::Namespaced) {
                        return Err(StoreError::Invalid(format!(
                            "template kind {}/{} is cluster-scoped",
                            kind.api_version, kind.kind
                        )));
                    }
                    debug!(gvk = %format!("{}/{}", kind.api_version, kind.kind), "resolved template kind");
                    self.resources.write().await.insert(kind.clone(), ar.clone());
                    return Ok(ar);
                }
            }
        }
        Err(StoreError::Invalid(format!(
            "template kind {}/{} is not served by the cluster",
            kind.api_version, kind.kind
        )))
    }

    async fn replica_api(
        &self,
        kind: &TemplateKind,
        namespace: &str,
    ) -> Result<Api<DynamicObject>, StoreError> {
        let ar = self.resolve(kind).await?;
        Ok(Api::namespaced_with(self.client.clone(), namespace, &ar))
    }
}

fn parse_gvk(kind: &TemplateKind) -> GroupVersionKind {
    let (group, version) = match kind.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), kind.api_version.clone()),
    };
    GroupVersionKind { group, version, kind: kind.kind.clone() }
}

fn map_kube_err(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound,
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
        kube::Error::Api(ae) => StoreError::Transient(format!("{} (http {})", ae.message, ae.code)),
        other => StoreError::Transient(other.to_string()),
    }
}

fn object_reference(src: &SourceRef) -> ObjectReference {
    ObjectReference {
        api_version: Some(src.api_version.clone()),
        kind: Some(src.kind.clone()),
        name: Some(src.name.clone()),
        uid: Some(src.uid.clone()),
        ..Default::default()
    }
}

fn replica_target(obj: &serde_json::Value) -> Result<(String, String, TemplateKind), StoreError> {
    let namespace = meta_str(obj, "namespace")
        .ok_or_else(|| StoreError::Invalid("replica is missing metadata.namespace".into()))?;
    let name = meta_str(obj, "name")
        .ok_or_else(|| StoreError::Invalid("replica is missing metadata.name".into()))?;
    let api_version = obj
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StoreError::Invalid("replica is missing apiVersion".into()))?;
    let kind = obj
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StoreError::Invalid("replica is missing kind".into()))?;
    Ok((
        namespace.to_string(),
        name.to_string(),
        TemplateKind { api_version: api_version.to_string(), kind: kind.to_string() },
    ))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_source(&self, name: &str) -> Result<Option<MirrorSource>, StoreError> {
        self.sources().get_opt(name).await.map_err(map_kube_err)
    }

    async fn update_source(&self, src: &MirrorSource) -> Result<MirrorSource, StoreError> {
        self.sources()
            .replace(src.name(), &PostParams::default(), src)
            .await
            .map_err(map_kube_err)
    }

    async fn update_status(&self, src: &MirrorSource) -> Result<(), StoreError> {
        let data = serde_json::to_vec(src)
            .map_err(|e| StoreError::Invalid(format!("serializing status: {e}")))?;
        self.sources()
            .replace_status(src.name(), &PostParams::default(), data)
            .await
            .map_err(map_kube_err)?;
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceView>, StoreError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.map_err(map_kube_err)?;
        Ok(list
            .items
            .into_iter()
            .map(|ns| NamespaceView {
                name: ns.name_any(),
                labels: ns.metadata.labels.clone().unwrap_or_default(),
                deleting: ns.metadata.deletion_timestamp.is_some(),
            })
            .collect())
    }

    async fn get(&self, key: &ReplicaKey) -> Result<Option<serde_json::Value>, StoreError> {
        let api = self.replica_api(&key.kind, &key.namespace).await?;
        match api.get_opt(&key.name).await.map_err(map_kube_err)? {
            Some(obj) => serde_json::to_value(&obj)
                .map(Some)
                .map_err(|e| StoreError::Invalid(format!("serializing replica: {e}"))),
            None => Ok(None),
        }
    }

    async fn create(&self, obj: &serde_json::Value) -> Result<(), StoreError> {
        let (namespace, name, kind) = replica_target(obj)?;
        let dynamic: DynamicObject = serde_json::from_value(obj.clone())
            .map_err(|e| StoreError::Invalid(format!("deserializing replica: {e}")))?;
        let api = self.replica_api(&kind, &namespace).await?;
        api.create(&PostParams::default(), &dynamic).await.map_err(map_kube_err)?;
        debug!(namespace = %namespace, name = %name, "replica created");
        Ok(())
    }

    async fn update(&self, obj: &serde_json::Value) -> Result<(), StoreError> {
        let (namespace, name, kind) = replica_target(obj)?;
        let dynamic: DynamicObject = serde_json::from_value(obj.clone())
            .map_err(|e| StoreError::Invalid(format!("deserializing replica: {e}")))?;
        let api = self.replica_api(&kind, &namespace).await?;
        api.replace(&name, &PostParams::default(), &dynamic).await.map_err(map_kube_err)?;
        debug!(namespace = %namespace, name = %name, "replica replaced");
        Ok(())
    }

    async fn delete(&self, key: &ReplicaKey) -> Result<(), StoreError> {
        let api = self.replica_api(&key.kind, &key.namespace).await?;
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match map_kube_err(e) {
                StoreError::NotFound => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn delete_tagged(&self, kind: &TemplateKind, uid: &str) -> Result<usize, StoreError> {
        if uid.is_empty() {
            warn!("source has no uid; skipping tagged sweep");
            return Ok(0);
        }
        let ar = self.resolve(kind).await?;
        let all: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let selector = format!("{SOURCE_OBJECT}={uid}");
        let list = all
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(map_kube_err)?;
        let mut removed = 0usize;
        for item in list.items {
            let namespace = item.namespace().unwrap_or_default();
            let name = item.name_any();
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), &namespace, &ar);
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => removed += 1,
                Err(e) => match map_kube_err(e) {
                    StoreError::NotFound => {}
                    other => return Err(other),
                },
            }
        }
        info!(selector = %selector, removed, "tagged replicas deleted");
        Ok(removed)
    }

    async fn emit_event(&self, src: &SourceRef, kind: EventKind, reason: &str, note: &str) {
        let type_ = match kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        let recorder =
            Recorder::new(self.client.clone(), self.reporter.clone(), object_reference(src));
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(source = %src.name, reason = %reason, error = %e, "event publish failed");
        }
    }
}
