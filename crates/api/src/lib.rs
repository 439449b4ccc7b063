//! spawnwatch public API façade (in-process).
//!
//! `Hub` is what per-session spawner code holds on to: it starts the pod and
//! event reflectors, waits for their first lists and answers status queries
//! straight from memory.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use spawnwatch_core::{EventView, ListWatch, PodView, ResourceKind};
use spawnwatch_reflector::{
    CachedObject, Health, LookupError, ReflectorFailure, Registry, StartupError, StopReport, Supervisor,
};
use tracing::{debug, info, warn};

mod config;

pub use config::{parse_namespaces, HubConfig};

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("kube client: {0}")]
    Client(String),
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

pub type HubResult<T> = Result<T, HubError>;

pub struct Hub {
    config: HubConfig,
    supervisor: Supervisor,
    registry: Registry,
}

impl Hub {
    /// Connect with the ambient kube configuration and start reflecting.
    pub async fn start(config: HubConfig) -> HubResult<Self> {
        let client = spawnwatch_kubehub::client(Some(config.request_timeout))
            .await
            .map_err(|e| HubError::Client(format!("{:#}", e)))?;
        Self::start_with(config, Arc::new(spawnwatch_kubehub::KubeSource::new(client))).await
    }

    /// Start on any list/watch source and wait until every cache is ready.
    pub async fn start_with(config: HubConfig, source: Arc<dyn ListWatch>) -> HubResult<Self> {
        let t0 = Instant::now();
        let targets = config.targets();
        info!(reflectors = targets.len(), cluster_wide = config.cluster_wide(), events = config.events_enabled, "hub starting");
        let mut supervisor = Supervisor::new(source, config.supervisor.clone(), targets);
        supervisor.start()?;
        if let Err(e) = supervisor.ready().await {
            supervisor.stop().await;
            return Err(e.into());
        }
        let registry = supervisor.registry();
        info!(took_ms = %t0.elapsed().as_millis(), "hub ready");
        Ok(Self { config, supervisor, registry })
    }

    pub async fn stop(mut self) -> StopReport {
        self.supervisor.stop().await
    }

    /// Resolves when a reflector stops on a fatal error.
    pub async fn next_failure(&mut self) -> Option<ReflectorFailure> {
        self.supervisor.next_failure().await
    }

    pub fn config(&self) -> &HubConfig { &self.config }
    pub fn registry(&self) -> Registry { self.registry.clone() }
    pub fn health(&self) -> Health { self.registry.health() }

    pub fn pod(&self, namespace: &str, name: &str) -> HubResult<Option<Arc<PodView>>> {
        metrics::counter!("hub_queries_total", 1u64, "op" => "pod");
        Ok(self.registry.get_typed::<PodView>(Some(namespace), name)?)
    }

    /// Pods in `namespace`, or in every watched namespace, sorted by key.
    /// Across namespaces, partitions that cannot serve are skipped with a warning.
    pub fn pods(&self, namespace: Option<&str>) -> HubResult<Vec<Arc<PodView>>> {
        metrics::counter!("hub_queries_total", 1u64, "op" => "pods");
        let mut pods = match namespace {
            Some(ns) => self.registry.list_typed::<PodView>(Some(ns))?,
            None => {
                let listing = self.registry.list_all(ResourceKind::Pods)?;
                for skipped in &listing.skipped {
                    warn!(error = %skipped, "pod listing skipped a partition");
                }
                if listing.served == 0 {
                    if let Some(first) = listing.skipped.into_iter().next() {
                        return Err(first.into());
                    }
                }
                listing
                    .objects
                    .into_iter()
                    .filter_map(|o| match o {
                        CachedObject::Pod(p) => Some(p),
                        CachedObject::Event(_) => None,
                    })
                    .collect()
            }
        };
        pods.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(pods)
    }

    /// Events for one pod, oldest first. With `since_uid`, only events after
    /// that one are returned; an unknown marker returns everything.
    pub fn events_for_pod(&self, namespace: &str, pod: &str, since_uid: Option<&str>) -> HubResult<Vec<Arc<EventView>>> {
        metrics::counter!("hub_queries_total", 1u64, "op" => "events");
        if !self.config.events_enabled {
            return Ok(Vec::new());
        }
        let mut events: Vec<_> = self
            .registry
            .list_typed::<EventView>(Some(namespace))?
            .into_iter()
            .filter(|e| e.involves(Some(namespace), pod))
            .collect();
        events.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()).then_with(|| a.key.cmp(&b.key)));
        if let Some(marker) = since_uid {
            if let Some(pos) = events.iter().position(|e| e.uid.as_deref() == Some(marker)) {
                events.drain(..=pos);
            } else {
                debug!(ns = namespace, pod, marker, "event marker not found; returning all events");
            }
        }
        Ok(events)
    }
}
