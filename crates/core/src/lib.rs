//! spawnwatch core types: object identity, resource versions, watch events and
//! the list/watch source seam shared by the store, reflectors and kube wiring.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod projection;

pub use error::WatchError;
pub use projection::{ContainerState, ContainerStatusView, EventView, InvolvedObject, PodView, Projection};

pub type Uid = [u8; 16];

/// Label selector used for user pods when nothing else is configured.
pub const DEFAULT_POD_SELECTOR: &str = "component=singleuser-server";
/// Field selector used for events when nothing else is configured.
pub const DEFAULT_EVENT_FIELD_SELECTOR: &str = "involvedObject.kind=Pod";

/// Resource kinds reflected by the spawner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pods,
    Events,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pods => "pods",
            ResourceKind::Events => "events",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pod" | "pods" => Ok(ResourceKind::Pods),
            "event" | "events" => Ok(ResourceKind::Events),
            other => Err(WatchError::Config(format!("unknown resource kind: {}", other))),
        }
    }
}

/// Identity of a watched object within one resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    /// Read `metadata.namespace`/`metadata.name` from a raw object.
    pub fn from_raw(raw: &serde_json::Value) -> Result<Self, WatchError> {
        let meta = raw.get("metadata").ok_or_else(|| WatchError::Malformed("object missing metadata".into()))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| WatchError::Malformed("object missing metadata.name".into()))?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        Ok(Self::new(namespace, name))
    }

    pub fn in_namespace(&self, namespace: Option<&str>) -> bool {
        match namespace {
            None => true,
            Some(ns) => self.namespace.as_deref() == Some(ns),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Server resource version. Kubernetes treats these as opaque strings, but
/// they are etcd revisions and compare numerically within one resource kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ResourceVersion(pub u64);

impl ResourceVersion {
    pub fn from_raw(raw: &serde_json::Value) -> Result<Self, WatchError> {
        raw.pointer("/metadata/resourceVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| WatchError::Malformed("object missing metadata.resourceVersion".into()))?
            .parse()
    }
}

impl FromStr for ResourceVersion {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(ResourceVersion)
            .map_err(|_| WatchError::Malformed(format!("unparseable resourceVersion: {:?}", s)))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One reflector (and one cache) per `(kind, namespace)`; `None` means cluster-wide.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReflectorKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
}

impl ReflectorKey {
    pub fn new(kind: ResourceKind, namespace: Option<&str>) -> Self {
        Self { kind, namespace: namespace.map(|s| s.to_string()) }
    }

    pub fn scope(&self) -> &str {
        self.namespace.as_deref().unwrap_or("*")
    }
}

impl fmt::Display for ReflectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.scope())
    }
}

/// What a reflector lists and watches: kind, scope and selectors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchTarget {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl WatchTarget {
    pub fn new(kind: ResourceKind, namespace: Option<&str>) -> Self {
        Self { kind, namespace: namespace.map(|s| s.to_string()), label_selector: None, field_selector: None }
    }

    /// User pods, selected by the default component label.
    pub fn pods(namespace: Option<&str>) -> Self {
        Self::new(ResourceKind::Pods, namespace).labels(DEFAULT_POD_SELECTOR)
    }

    /// Pod events only.
    pub fn events(namespace: Option<&str>) -> Self {
        Self::new(ResourceKind::Events, namespace).fields(DEFAULT_EVENT_FIELD_SELECTOR)
    }

    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string()).filter(|s| !s.is_empty());
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string()).filter(|s| !s.is_empty());
        self
    }

    pub fn key(&self) -> ReflectorKey {
        ReflectorKey { kind: self.kind, namespace: self.namespace.clone() }
    }

    /// Human readable selector description for logs.
    pub fn describe_selectors(&self) -> String {
        let mut parts = Vec::new();
        if let Some(l) = &self.label_selector { parts.push(format!("labels={}", l)); }
        if let Some(f) = &self.field_selector { parts.push(format!("fields={}", f)); }
        if parts.is_empty() { "(none)".to_string() } else { parts.join(",") }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    /// Raw object (managedFields stripped by the source).
    pub raw: serde_json::Value,
}

/// One item delivered by a watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WatchEvent {
    Delta(Delta),
    /// Progress marker carrying only a resource version.
    Bookmark { resource_version: String },
}

impl WatchEvent {
    pub fn added(raw: serde_json::Value) -> Self { WatchEvent::Delta(Delta { kind: DeltaKind::Added, raw }) }
    pub fn modified(raw: serde_json::Value) -> Self { WatchEvent::Delta(Delta { kind: DeltaKind::Modified, raw }) }
    pub fn deleted(raw: serde_json::Value) -> Self { WatchEvent::Delta(Delta { kind: DeltaKind::Deleted, raw }) }
    pub fn bookmark(rv: impl Into<String>) -> Self { WatchEvent::Bookmark { resource_version: rv.into() } }
}

/// Page request for a paginated list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
}

/// One page of a list response.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<serde_json::Value>,
    pub resource_version: String,
    pub continue_token: Option<String>,
}

pub type EventStream = BoxStream<'static, Result<WatchEvent, WatchError>>;

/// The orchestrator boundary consumed by reflectors.
///
/// A watch stream that simply ends is the benign `StreamClosed` case; errors
/// yielded by the stream or returned when opening it carry the typed reason.
#[async_trait::async_trait]
pub trait ListWatch: Send + Sync {
    async fn list(&self, target: &WatchTarget, page: PageRequest) -> Result<ListPage, WatchError>;

    async fn watch(
        &self,
        target: &WatchTarget,
        resource_version: ResourceVersion,
        timeout_secs: Option<u32>,
    ) -> Result<EventStream, WatchError>;
}

pub mod prelude {
    pub use super::{
        Delta, DeltaKind, EventStream, ListPage, ListWatch, ObjectKey, PageRequest, Projection, ReflectorKey,
        ResourceKind, ResourceVersion, WatchError, WatchEvent, WatchTarget,
    };
}
