//! Reduced projections of watched objects.
//!
//! Only the fields the per-session code reads are kept. Objects are read from
//! raw JSON with pointer lookups instead of deserialising the full upstream
//! schema; events in particular are high volume and low value.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{ObjectKey, ResourceKind, Uid, WatchError};

/// Turns a raw object into the reduced form a cache stores.
pub trait Projection: Clone + Debug + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn project(raw: &serde_json::Value) -> Result<Self, WatchError>;

    fn key(&self) -> &ObjectKey;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ContainerState {
    Waiting { reason: Option<String> },
    Running,
    Terminated { exit_code: i32, reason: Option<String> },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatusView {
    pub name: String,
    pub ready: bool,
    pub restart_count: u32,
    pub state: ContainerState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodView {
    pub key: ObjectKey,
    pub uid: Option<Uid>,
    pub phase: String,
    pub reason: Option<String>,
    pub node_name: Option<String>,
    pub pod_ip: Option<String>,
    pub host_ip: Option<String>,
    /// Set once the pod has a deletionTimestamp.
    pub deleting: bool,
    pub labels: SmallVec<[(String, String); 8]>,
    pub containers: SmallVec<[ContainerStatusView; 2]>,
}

impl PodView {
    /// Running, addressable, not being deleted and every container ready.
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
            && self.pod_ip.is_some()
            && !self.deleting
            && self.containers.iter().all(|c| c.ready)
    }

    pub fn container(&self, name: &str) -> Option<&ContainerStatusView> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn restarts(&self) -> u32 {
        self.containers.iter().map(|c| c.restart_count).sum()
    }
}

impl Projection for PodView {
    const KIND: ResourceKind = ResourceKind::Pods;

    fn project(raw: &serde_json::Value) -> Result<Self, WatchError> {
        let key = ObjectKey::from_raw(raw)?;
        let containers = raw
            .pointer("/status/containerStatuses")
            .and_then(|v| v.as_array())
            .map(|cs| cs.iter().filter_map(project_container).collect())
            .unwrap_or_default();
        Ok(PodView {
            key,
            uid: uid_of(raw),
            phase: str_at(raw, "/status/phase").unwrap_or_else(|| "Unknown".to_string()),
            reason: str_at(raw, "/status/reason"),
            node_name: str_at(raw, "/spec/nodeName"),
            pod_ip: str_at(raw, "/status/podIP"),
            host_ip: str_at(raw, "/status/hostIP"),
            deleting: raw.pointer("/metadata/deletionTimestamp").map(|v| !v.is_null()).unwrap_or(false),
            labels: labels_of(raw),
            containers,
        })
    }

    fn key(&self) -> &ObjectKey { &self.key }
}

fn project_container(c: &serde_json::Value) -> Option<ContainerStatusView> {
    let name = c.get("name").and_then(|v| v.as_str())?.to_string();
    let state = match c.get("state") {
        Some(s) if s.get("running").is_some() => ContainerState::Running,
        Some(s) if s.get("terminated").is_some() => ContainerState::Terminated {
            exit_code: s.pointer("/terminated/exitCode").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
            reason: str_at(s, "/terminated/reason"),
        },
        Some(s) if s.get("waiting").is_some() => ContainerState::Waiting { reason: str_at(s, "/waiting/reason") },
        _ => ContainerState::Unknown,
    };
    Some(ContainerStatusView {
        name,
        ready: c.get("ready").and_then(|v| v.as_bool()).unwrap_or(false),
        restart_count: c.get("restartCount").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        state,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvolvedObject {
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub uid: Option<String>,
}

/// Shallow projection of a core/v1 Event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventView {
    pub key: ObjectKey,
    pub uid: Option<String>,
    pub involved_object: InvolvedObject,
    pub reason: Option<String>,
    pub message: Option<String>,
    #[serde(rename = "type")]
    pub type_: Option<String>,
    pub count: u32,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub event_time: Option<DateTime<Utc>>,
}

impl EventView {
    /// Events carry either the low resolution lastTimestamp or the newer
    /// eventTime; the epoch is the last resort.
    pub fn sort_key(&self) -> DateTime<Utc> {
        self.last_timestamp.or(self.event_time).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn involves(&self, namespace: Option<&str>, name: &str) -> bool {
        self.involved_object.name.as_deref() == Some(name)
            && (namespace.is_none() || self.involved_object.namespace.as_deref() == namespace)
    }
}

impl Projection for EventView {
    const KIND: ResourceKind = ResourceKind::Events;

    fn project(raw: &serde_json::Value) -> Result<Self, WatchError> {
        let key = ObjectKey::from_raw(raw)?;
        Ok(EventView {
            key,
            uid: str_at(raw, "/metadata/uid"),
            involved_object: InvolvedObject {
                kind: str_at(raw, "/involvedObject/kind"),
                namespace: str_at(raw, "/involvedObject/namespace"),
                name: str_at(raw, "/involvedObject/name"),
                uid: str_at(raw, "/involvedObject/uid"),
            },
            reason: str_at(raw, "/reason"),
            message: str_at(raw, "/message"),
            type_: str_at(raw, "/type"),
            count: raw.get("count").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            first_timestamp: ts_at(raw, "/firstTimestamp"),
            last_timestamp: ts_at(raw, "/lastTimestamp"),
            event_time: ts_at(raw, "/eventTime"),
        })
    }

    fn key(&self) -> &ObjectKey { &self.key }
}

fn str_at(raw: &serde_json::Value, pointer: &str) -> Option<String> {
    raw.pointer(pointer).and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(|s| s.to_string())
}

fn ts_at(raw: &serde_json::Value, pointer: &str) -> Option<DateTime<Utc>> {
    raw.pointer(pointer)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn uid_of(raw: &serde_json::Value) -> Option<Uid> {
    raw.pointer("/metadata/uid")
        .and_then(|v| v.as_str())
        .and_then(|s| uuid::Uuid::parse_str(s).ok())
        .map(|u| *u.as_bytes())
}

fn labels_of(raw: &serde_json::Value) -> SmallVec<[(String, String); 8]> {
    let mut labels = SmallVec::new();
    if let Some(lbls) = raw.pointer("/metadata/labels").and_then(|m| m.as_object()) {
        for (k, v) in lbls.iter() {
            if let Some(val) = v.as_str() { labels.push((k.clone(), val.to_string())); }
        }
    }
    labels
}
