//! spawnwatch store: the in-RAM resource cache fed by one reflector.
//!
//! One `Cache<T>` exists per `(kind, namespace)`. The owning reflector is the
//! only writer; any number of readers take point lookups or immutable
//! snapshots without touching the network.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use arc_swap::ArcSwapOption;
use rustc_hash::FxHashMap;
use spawnwatch_core::{DeltaKind, ObjectKey, ReflectorKey, ResourceVersion};
use tokio::sync::watch;
use tracing::{debug, info};

/// A cached object together with the version it was recorded at.
#[derive(Debug)]
pub struct Entry<T> {
    pub resource_version: ResourceVersion,
    pub object: Arc<T>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self { resource_version: self.resource_version, object: Arc::clone(&self.object) }
    }
}

/// Result of applying one watch delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Deleted,
    /// Delete for a key the cache never held.
    Absent,
    /// Version not newer than what is already recorded; nothing changed.
    Stale { recorded: ResourceVersion },
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, ApplyOutcome::Inserted | ApplyOutcome::Updated | ApplyOutcome::Deleted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceStats {
    pub items: usize,
    pub evicted: usize,
}

/// Immutable point-in-time view, sorted by key.
#[derive(Debug)]
pub struct Snapshot<T> {
    epoch: u64,
    items: Vec<(ObjectKey, Arc<T>)>,
}

impl<T> Snapshot<T> {
    pub fn epoch(&self) -> u64 { self.epoch }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Lazily filter by namespace (`None` yields everything).
    pub fn iter<'a>(&'a self, namespace: Option<&'a str>) -> impl Iterator<Item = &'a Arc<T>> + 'a {
        self.items.iter().filter(move |(k, _)| k.in_namespace(namespace)).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> + '_ {
        self.items.iter().map(|(k, _)| k)
    }
}

struct State<T> {
    objects: FxHashMap<ObjectKey, Entry<T>>,
    /// Versions of recent deletions, so replays cannot resurrect keys. Cleared by
    /// `replace` and trimmed by `prune_tombstones`.
    tombstones: FxHashMap<ObjectKey, ResourceVersion>,
    list_version: Option<ResourceVersion>,
    epoch: u64,
}

pub struct Cache<T> {
    key: ReflectorKey,
    state: RwLock<State<T>>,
    snapshot: ArcSwapOption<Snapshot<T>>,
    epoch_tx: watch::Sender<u64>,
    ready_tx: watch::Sender<bool>,
}

impl<T> Cache<T> {
    pub fn new(key: ReflectorKey) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        let (ready_tx, _) = watch::channel(false);
        Self {
            key,
            state: RwLock::new(State {
                objects: FxHashMap::default(),
                tombstones: FxHashMap::default(),
                list_version: None,
                epoch: 0,
            }),
            snapshot: ArcSwapOption::empty(),
            epoch_tx,
            ready_tx,
        }
    }

    pub fn key(&self) -> &ReflectorKey { &self.key }

    fn read(&self) -> RwLockReadGuard<'_, State<T>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State<T>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<T>> {
        self.read().objects.get(key).map(|e| Arc::clone(&e.object))
    }

    pub fn get_named(&self, namespace: Option<&str>, name: &str) -> Option<Arc<T>> {
        self.get(&ObjectKey::new(namespace, name))
    }

    pub fn entry(&self, key: &ObjectKey) -> Option<Entry<T>> {
        self.read().objects.get(key).cloned()
    }

    pub fn resource_version(&self, key: &ObjectKey) -> Option<ResourceVersion> {
        self.read().objects.get(key).map(|e| e.resource_version)
    }

    /// Version of the list response that established the current baseline.
    pub fn list_version(&self) -> Option<ResourceVersion> {
        self.read().list_version
    }

    pub fn len(&self) -> usize { self.read().objects.len() }
    pub fn is_empty(&self) -> bool { self.read().objects.is_empty() }

    /// Current snapshot; rebuilt only when the cache changed since the last call.
    pub fn snapshot(&self) -> Arc<Snapshot<T>> {
        let state = self.read();
        if let Some(snap) = self.snapshot.load_full() {
            if snap.epoch == state.epoch {
                return snap;
            }
        }
        let mut items: Vec<(ObjectKey, Arc<T>)> =
            state.objects.iter().map(|(k, e)| (k.clone(), Arc::clone(&e.object))).collect();
        let epoch = state.epoch;
        drop(state);
        items.sort_by(|a, b| a.0.cmp(&b.0));
        let snap = Arc::new(Snapshot { epoch, items });
        self.snapshot.store(Some(Arc::clone(&snap)));
        snap
    }

    /// Objects in `namespace` (or all), copied out of a snapshot.
    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<T>> {
        self.snapshot().iter(namespace).cloned().collect()
    }

    /// Atomically swap in a full list result. Anything absent from `items` is evicted.
    pub fn replace<I>(&self, items: I, list_version: ResourceVersion) -> ReplaceStats
    where
        I: IntoIterator<Item = (ObjectKey, ResourceVersion, T)>,
    {
        let objects: FxHashMap<ObjectKey, Entry<T>> = items
            .into_iter()
            .map(|(key, resource_version, obj)| (key, Entry { resource_version, object: Arc::new(obj) }))
            .collect();
        let mut state = self.write();
        let evicted = state.objects.keys().filter(|k| !objects.contains_key(*k)).count();
        let stats = ReplaceStats { items: objects.len(), evicted };
        state.objects = objects;
        state.tombstones.clear();
        state.list_version = Some(list_version);
        state.epoch += 1;
        let epoch = state.epoch;
        drop(state);

        self.epoch_tx.send_replace(epoch);
        let first = !self.ready_tx.send_replace(true);
        metrics::gauge!("cache_objects", stats.items as f64, "kind" => self.key.kind.as_str(), "scope" => self.key.scope().to_string());
        if first {
            info!(cache = %self.key, items = stats.items, rv = %list_version, "cache ready");
        } else {
            debug!(cache = %self.key, items = stats.items, evicted = stats.evicted, rv = %list_version, "cache replaced");
        }
        stats
    }

    /// Apply one watch delta. Versions not newer than the recorded one (or the
    /// deletion tombstone) are ignored, so duplicate delivery is harmless.
    pub fn apply(&self, kind: DeltaKind, key: ObjectKey, resource_version: ResourceVersion, object: T) -> ApplyOutcome {
        let mut state = self.write();
        let recorded = state
            .objects
            .get(&key)
            .map(|e| e.resource_version)
            .or_else(|| state.tombstones.get(&key).copied());
        if let Some(recorded) = recorded {
            if resource_version <= recorded {
                drop(state);
                debug!(cache = %self.key, key = %key, rv = %resource_version, recorded = %recorded, "ignoring stale delta");
                metrics::counter!("cache_stale_deltas_total", 1u64, "kind" => self.key.kind.as_str());
                return ApplyOutcome::Stale { recorded };
            }
        }
        let outcome = match kind {
            DeltaKind::Added | DeltaKind::Modified => {
                state.tombstones.remove(&key);
                let entry = Entry { resource_version, object: Arc::new(object) };
                match state.objects.insert(key, entry) {
                    Some(_) => ApplyOutcome::Updated,
                    None => ApplyOutcome::Inserted,
                }
            }
            DeltaKind::Deleted => {
                state.tombstones.insert(key.clone(), resource_version);
                match state.objects.remove(&key) {
                    Some(_) => ApplyOutcome::Deleted,
                    None => ApplyOutcome::Absent,
                }
            }
        };
        if !outcome.changed() {
            return outcome;
        }
        state.epoch += 1;
        let (epoch, len) = (state.epoch, state.objects.len());
        drop(state);
        self.epoch_tx.send_replace(epoch);
        metrics::gauge!("cache_objects", len as f64, "kind" => self.key.kind.as_str(), "scope" => self.key.scope().to_string());
        outcome
    }

    /// Drop tombstones at or below `through`; returns how many were dropped.
    /// Callers pass a version they will never accept a delta at or below.
    pub fn prune_tombstones(&self, through: ResourceVersion) -> usize {
        let mut state = self.write();
        let before = state.tombstones.len();
        state.tombstones.retain(|_, rv| *rv > through);
        before - state.tombstones.len()
    }

    /// Number of deletion tombstones currently held.
    pub fn tombstones(&self) -> usize { self.read().tombstones.len() }

    /// True once the first full list has been applied.
    pub fn is_ready(&self) -> bool { *self.ready_tx.borrow() }

    pub async fn wait_ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Change notification: the epoch bumps on every mutation.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    pub fn epoch(&self) -> u64 { *self.epoch_tx.borrow() }
}
