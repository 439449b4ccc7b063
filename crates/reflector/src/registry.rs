//! Read side: route lookups to the right cache without touching the network.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::Serialize;
use spawnwatch_core::{EventView, ObjectKey, PodView, Projection, ReflectorKey, ResourceKind, WatchError};
use spawnwatch_store::Cache;
use tokio::sync::watch;

use crate::{ReflectorState, ReflectorStatus};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LookupError {
    /// The cache has not completed its first list yet.
    #[error("{0} is not ready")]
    NotReady(ReflectorKey),
    #[error("{key} stopped: {error}")]
    Failed { key: ReflectorKey, error: WatchError },
    /// No reflector covers this kind and namespace.
    #[error("no reflector for {0}")]
    Unknown(ReflectorKey),
}

/// A cache of either reflected kind.
#[derive(Clone)]
pub enum AnyCache {
    Pods(Arc<Cache<PodView>>),
    Events(Arc<Cache<EventView>>),
}

impl AnyCache {
    pub fn for_key(key: ReflectorKey) -> Self {
        match key.kind {
            ResourceKind::Pods => AnyCache::Pods(Arc::new(Cache::new(key))),
            ResourceKind::Events => AnyCache::Events(Arc::new(Cache::new(key))),
        }
    }

    pub fn key(&self) -> &ReflectorKey {
        match self {
            AnyCache::Pods(c) => c.key(),
            AnyCache::Events(c) => c.key(),
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            AnyCache::Pods(c) => c.is_ready(),
            AnyCache::Events(c) => c.is_ready(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AnyCache::Pods(c) => c.len(),
            AnyCache::Events(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn get(&self, key: &ObjectKey) -> Option<CachedObject> {
        match self {
            AnyCache::Pods(c) => c.get(key).map(CachedObject::Pod),
            AnyCache::Events(c) => c.get(key).map(CachedObject::Event),
        }
    }

    fn list(&self, namespace: Option<&str>) -> Vec<CachedObject> {
        match self {
            AnyCache::Pods(c) => c.list(namespace).into_iter().map(CachedObject::Pod).collect(),
            AnyCache::Events(c) => c.list(namespace).into_iter().map(CachedObject::Event).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CachedObject {
    Pod(Arc<PodView>),
    Event(Arc<EventView>),
}

impl CachedObject {
    pub fn key(&self) -> &ObjectKey {
        match self {
            CachedObject::Pod(p) => &p.key,
            CachedObject::Event(e) => &e.key,
        }
    }
}

/// Projections that have a typed cache in `AnyCache`.
pub trait Cached: Projection {
    fn cache_of(cache: &AnyCache) -> Option<&Arc<Cache<Self>>>;
}

impl Cached for PodView {
    fn cache_of(cache: &AnyCache) -> Option<&Arc<Cache<Self>>> {
        match cache {
            AnyCache::Pods(c) => Some(c),
            _ => None,
        }
    }
}

impl Cached for EventView {
    fn cache_of(cache: &AnyCache) -> Option<&Arc<Cache<Self>>> {
        match cache {
            AnyCache::Events(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct RegistryEntry {
    pub(crate) cache: AnyCache,
    pub(crate) status: watch::Receiver<ReflectorStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReflectorHealth {
    pub key: ReflectorKey,
    pub objects: usize,
    pub status: ReflectorStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Health {
    pub reflectors: Vec<ReflectorHealth>,
}

impl Health {
    pub fn all_ready(&self) -> bool {
        self.reflectors.iter().all(|r| r.status.ready && !r.status.is_failed())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ReflectorHealth> + '_ {
        self.reflectors.iter().filter(|r| r.status.is_failed())
    }
}

/// Result of listing across every partition of a kind.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub objects: Vec<CachedObject>,
    /// Partitions that answered.
    pub served: usize,
    /// Why the other partitions were left out.
    pub skipped: Vec<LookupError>,
}

/// Cheap to clone; shares the supervisor's table of caches.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<RwLock<FxHashMap<ReflectorKey, RegistryEntry>>>,
}

impl Registry {
    pub(crate) fn insert(&self, entry: RegistryEntry) {
        let key = entry.cache.key().clone();
        self.entries.write().unwrap_or_else(PoisonError::into_inner).insert(key, entry);
    }

    pub(crate) fn set_status(&self, key: &ReflectorKey, status: watch::Receiver<ReflectorStatus>) {
        if let Some(e) = self.entries.write().unwrap_or_else(PoisonError::into_inner).get_mut(key) {
            e.status = status;
        }
    }

    pub fn keys(&self) -> Vec<ReflectorKey> {
        let mut keys: Vec<_> = self.entries.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The namespace's own reflector, else the cluster-wide one.
    fn route(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<RegistryEntry, LookupError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let exact = ReflectorKey::new(kind, namespace);
        entries
            .get(&exact)
            .or_else(|| entries.get(&ReflectorKey::new(kind, None)))
            .cloned()
            .ok_or(LookupError::Unknown(exact))
    }

    fn serving(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<AnyCache, LookupError> {
        let entry = self.route(kind, namespace)?;
        let key = entry.cache.key().clone();
        if let Some(error) = entry.status.borrow().fatal.clone() {
            return Err(LookupError::Failed { key, error });
        }
        if !entry.cache.is_ready() {
            return Err(LookupError::NotReady(key));
        }
        Ok(entry.cache)
    }

    pub fn get(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<Option<CachedObject>, LookupError> {
        Ok(self.serving(kind, namespace)?.get(&ObjectKey::new(namespace, name)))
    }

    /// Objects of `kind` in `namespace`. With `None`, whatever the serving
    /// reflectors of the kind hold; fails only when none of them can serve.
    pub fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<Vec<CachedObject>, LookupError> {
        if namespace.is_some() {
            return Ok(self.serving(kind, namespace)?.list(namespace));
        }
        let listing = self.list_all(kind)?;
        match listing.skipped.into_iter().next() {
            Some(first) if listing.served == 0 => Err(first),
            _ => Ok(listing.objects),
        }
    }

    /// Every partition of `kind`; failed or unready ones are skipped and reported.
    pub fn list_all(&self, kind: ResourceKind) -> Result<Listing, LookupError> {
        let keys: Vec<_> = self.keys().into_iter().filter(|k| k.kind == kind).collect();
        if keys.is_empty() {
            return Err(LookupError::Unknown(ReflectorKey::new(kind, None)));
        }
        let mut listing = Listing::default();
        for key in keys {
            let ns = key.namespace.as_deref();
            match self.serving(kind, ns) {
                Ok(cache) => {
                    listing.objects.extend(cache.list(ns));
                    listing.served += 1;
                }
                Err(e) => listing.skipped.push(e),
            }
        }
        Ok(listing)
    }

    pub fn get_typed<T: Cached>(&self, namespace: Option<&str>, name: &str) -> Result<Option<Arc<T>>, LookupError> {
        let cache = self.serving(T::KIND, namespace)?;
        Ok(T::cache_of(&cache).and_then(|c| c.get(&ObjectKey::new(namespace, name))))
    }

    pub fn list_typed<T: Cached>(&self, namespace: Option<&str>) -> Result<Vec<Arc<T>>, LookupError> {
        let cache = self.serving(T::KIND, namespace)?;
        Ok(T::cache_of(&cache).map(|c| c.list(namespace)).unwrap_or_default())
    }

    /// Wait until the covering cache is ready. A fatal stop or the timeout is an error.
    pub async fn ready(&self, kind: ResourceKind, namespace: Option<&str>, timeout: Duration) -> Result<(), LookupError> {
        let entry = self.route(kind, namespace)?;
        let key = entry.cache.key().clone();
        let mut status = entry.status;
        let waited = tokio::time::timeout(timeout, status.wait_for(|s| s.ready || s.is_failed() || s.state == ReflectorState::Stopped))
            .await
            .map(|r| r.map(|s| s.clone()).ok());
        let current = match waited {
            Err(_) => return Err(LookupError::NotReady(key)),
            Ok(Some(s)) => s,
            // sender gone: the last published status is final
            Ok(None) => status.borrow().clone(),
        };
        match current.fatal {
            Some(error) => Err(LookupError::Failed { key, error }),
            None if entry.cache.is_ready() => Ok(()),
            None => Err(LookupError::NotReady(key)),
        }
    }

    pub fn status(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<ReflectorStatus, LookupError> {
        let entry = self.route(kind, namespace)?;
        let status = entry.status.borrow().clone();
        Ok(status)
    }

    pub fn health(&self) -> Health {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut reflectors: Vec<ReflectorHealth> = entries
            .iter()
            .map(|(key, e)| ReflectorHealth { key: key.clone(), objects: e.cache.len(), status: e.status.borrow().clone() })
            .collect();
        reflectors.sort_by(|a, b| a.key.cmp(&b.key));
        Health { reflectors }
    }
}
