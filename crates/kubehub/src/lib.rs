//! spawnwatch kubehub: list and watch pods/events against the Kubernetes API.
//!
//! `KubeSource` is the production `ListWatch`. It talks to the API server with
//! `Api<DynamicObject>` so objects stay shallow JSON until a projection reads
//! the handful of fields it needs.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event as CoreEvent, Pod};
use kube::{
    api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, ErrorResponse},
    Client,
};
use spawnwatch_core::{
    EventStream, ListPage, ListWatch, PageRequest, ResourceKind, ResourceVersion, WatchError, WatchEvent, WatchTarget,
};
use tracing::{debug, info};

/// The API server rejects watch timeouts above this.
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

/// Build a client from the ambient configuration (in-cluster first, then
/// kubeconfig) with an optional network read timeout.
pub async fn client(read_timeout: Option<Duration>) -> Result<Client> {
    let mut config = kube::Config::infer().await.context("inferring kube config")?;
    if read_timeout.is_some() {
        config.read_timeout = read_timeout;
    }
    let cluster_url = config.cluster_url.clone();
    let client = Client::try_from(config).context("building kube client")?;
    info!(cluster = %cluster_url, read_timeout = ?read_timeout, "kube client ready");
    Ok(client)
}

pub fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::Pods => ApiResource::erase::<Pod>(&()),
        ResourceKind::Events => ApiResource::erase::<CoreEvent>(&()),
    }
}

/// `ListWatch` backed by a live API server.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, target: &WatchTarget) -> Api<DynamicObject> {
        let ar = api_resource(target.kind);
        match target.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn list_params(target: &WatchTarget, page: &PageRequest) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(l) = target.label_selector.as_deref() { lp = lp.labels(l); }
    if let Some(f) = target.field_selector.as_deref() { lp = lp.fields(f); }
    if let Some(limit) = page.limit { lp = lp.limit(limit); }
    if let Some(token) = page.continue_token.as_deref() { lp = lp.continue_token(token); }
    lp
}

fn watch_params(target: &WatchTarget, timeout_secs: Option<u32>) -> WatchParams {
    let mut wp = WatchParams::default();
    if let Some(l) = target.label_selector.as_deref() { wp = wp.labels(l); }
    if let Some(f) = target.field_selector.as_deref() { wp = wp.fields(f); }
    if let Some(t) = timeout_secs { wp = wp.timeout(t.clamp(1, MAX_WATCH_TIMEOUT_SECS)); }
    wp
}

#[async_trait::async_trait]
impl ListWatch for KubeSource {
    async fn list(&self, target: &WatchTarget, page: PageRequest) -> Result<ListPage, WatchError> {
        let lp = list_params(target, &page);
        let list = self.api(target).list(&lp).await.map_err(classify)?;
        let resource_version = list
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| WatchError::Malformed("list response missing resourceVersion".into()))?;
        let continue_token = list.metadata.continue_.clone().filter(|t| !t.is_empty());
        let items = list.items.iter().map(to_raw).collect::<Result<Vec<_>, _>>()?;
        debug!(kind = %target.kind, ns = ?target.namespace, items = items.len(), more = continue_token.is_some(), "list page");
        Ok(ListPage { items, resource_version, continue_token })
    }

    async fn watch(
        &self,
        target: &WatchTarget,
        resource_version: ResourceVersion,
        timeout_secs: Option<u32>,
    ) -> Result<EventStream, WatchError> {
        let wp = watch_params(target, timeout_secs);
        let stream = self
            .api(target)
            .watch(&wp, &resource_version.to_string())
            .await
            .map_err(classify)?;
        metrics::counter!("kube_watch_opened_total", 1u64, "kind" => target.kind.as_str());
        Ok(stream.map(convert_event).boxed())
    }
}

fn convert_event(ev: kube::Result<KubeWatchEvent<DynamicObject>>) -> Result<WatchEvent, WatchError> {
    match ev {
        Ok(KubeWatchEvent::Added(o)) => to_raw(&o).map(WatchEvent::added),
        Ok(KubeWatchEvent::Modified(o)) => to_raw(&o).map(WatchEvent::modified),
        Ok(KubeWatchEvent::Deleted(o)) => to_raw(&o).map(WatchEvent::deleted),
        Ok(KubeWatchEvent::Bookmark(bm)) => Ok(WatchEvent::bookmark(bm.metadata.resource_version)),
        Ok(KubeWatchEvent::Error(resp)) => Err(classify_response(&resp)),
        Err(e) => Err(classify(e)),
    }
}

/// Map a kube client error onto the reflector's failure taxonomy.
pub fn classify(err: kube::Error) -> WatchError {
    match err {
        kube::Error::Api(resp) => classify_response(&resp),
        kube::Error::SerdeError(e) => WatchError::Malformed(e.to_string()),
        other => WatchError::Transient(other.to_string()),
    }
}

pub fn classify_response(resp: &ErrorResponse) -> WatchError {
    let msg = if resp.reason.is_empty() { resp.message.clone() } else { format!("{} ({})", resp.message, resp.reason) };
    match resp.code {
        401 => WatchError::Unauthorized(msg),
        403 => WatchError::Forbidden(msg),
        410 => WatchError::ResourceVersionTooOld(msg),
        400 | 404 | 422 => WatchError::Config(msg),
        _ => WatchError::Transient(msg),
    }
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

#[cfg(not(feature = "strip-managed-fields"))]
fn strip_managed_fields(_v: &mut serde_json::Value) {}

fn to_raw(obj: &DynamicObject) -> Result<serde_json::Value, WatchError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| WatchError::Malformed(format!("serializing object: {}", e)))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}
