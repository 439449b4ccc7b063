//! Owns the reflector tasks: start, readiness, restart and bounded shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use rustc_hash::FxHashMap;
use spawnwatch_core::{ListWatch, Projection, ReflectorKey, WatchError, WatchTarget};
use spawnwatch_store::Cache;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::registry::RegistryEntry;
use crate::{AnyCache, LookupError, Reflector, ReflectorConfig, ReflectorStatus, Registry};

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub reflector: ReflectorConfig,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { reflector: ReflectorConfig::default(), startup_timeout: Duration::from_secs(60), stop_grace: Duration::from_secs(5) }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StartupError {
    #[error("timed out waiting for first list of: {}", join(.pending))]
    Timeout { pending: Vec<ReflectorKey> },
    #[error("{key} failed during startup: {error}")]
    Failed { key: ReflectorKey, error: WatchError },
    #[error("duplicate reflector {0}")]
    Duplicate(ReflectorKey),
    #[error("no reflector {0}")]
    Unknown(ReflectorKey),
}

fn join(keys: &[ReflectorKey]) -> String {
    keys.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", ")
}

/// A reflector that stopped on a fatal error.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflectorFailure {
    pub key: ReflectorKey,
    pub error: WatchError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopReport {
    pub stopped: Vec<ReflectorKey>,
    /// Tasks that ignored cancellation past the grace period and were aborted.
    pub aborted: Vec<ReflectorKey>,
}

struct Slot {
    target: WatchTarget,
    cache: AnyCache,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), WatchError>>>,
}

pub struct Supervisor {
    source: Arc<dyn ListWatch>,
    config: SupervisorConfig,
    targets: Vec<WatchTarget>,
    slots: FxHashMap<ReflectorKey, Slot>,
    registry: Registry,
    shutdown: CancellationToken,
    failures_tx: mpsc::UnboundedSender<ReflectorFailure>,
    failures_rx: mpsc::UnboundedReceiver<ReflectorFailure>,
}

impl Supervisor {
    pub fn new(source: Arc<dyn ListWatch>, config: SupervisorConfig, targets: Vec<WatchTarget>) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            source,
            config,
            targets,
            slots: FxHashMap::default(),
            registry: Registry::default(),
            shutdown: CancellationToken::new(),
            failures_tx,
            failures_rx,
        }
    }

    pub fn registry(&self) -> Registry { self.registry.clone() }

    pub fn config(&self) -> &SupervisorConfig { &self.config }

    /// Spawn one task per target. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), StartupError> {
        let mut seen = FxHashMap::default();
        for target in &self.targets {
            if seen.insert(target.key(), ()).is_some() {
                return Err(StartupError::Duplicate(target.key()));
            }
        }
        for target in self.targets.clone() {
            let key = target.key();
            if self.slots.contains_key(&key) {
                continue;
            }
            let cache = AnyCache::for_key(key.clone());
            let cancel = self.shutdown.child_token();
            let (task, status) = self.spawn(&target, &cache, cancel.clone());
            self.registry.insert(RegistryEntry { cache: cache.clone(), status });
            self.slots.insert(key, Slot { target, cache, cancel, task: Some(task) });
        }
        info!(reflectors = self.slots.len(), "supervisor started");
        Ok(())
    }

    fn spawn(
        &self,
        target: &WatchTarget,
        cache: &AnyCache,
        cancel: CancellationToken,
    ) -> (JoinHandle<Result<(), WatchError>>, watch::Receiver<ReflectorStatus>) {
        match cache {
            AnyCache::Pods(c) => self.spawn_typed(target, Arc::clone(c), cancel),
            AnyCache::Events(c) => self.spawn_typed(target, Arc::clone(c), cancel),
        }
    }

    fn spawn_typed<T: Projection>(
        &self,
        target: &WatchTarget,
        cache: Arc<Cache<T>>,
        cancel: CancellationToken,
    ) -> (JoinHandle<Result<(), WatchError>>, watch::Receiver<ReflectorStatus>) {
        let reflector = Reflector::new(target.clone(), Arc::clone(&self.source), cache, self.config.reflector.clone(), cancel);
        let status = reflector.subscribe();
        let failures = self.failures_tx.clone();
        let key = target.key();
        let task = tokio::spawn(async move {
            let result = reflector.run().await;
            if let Err(error) = &result {
                let _ = failures.send(ReflectorFailure { key, error: error.clone() });
            }
            result
        });
        (task, status)
    }

    /// Wait for every reflector's first list, bounded by the startup timeout.
    /// Reflectors are awaited together; the first fatal stop wins.
    pub async fn ready(&self) -> Result<(), StartupError> {
        let budget = self.config.startup_timeout;
        let mut waits: FuturesUnordered<_> = self
            .registry
            .keys()
            .into_iter()
            .map(|key| {
                let registry = self.registry.clone();
                async move { registry.ready(key.kind, key.namespace.as_deref(), budget).await }
            })
            .collect();
        while let Some(result) = waits.next().await {
            match result {
                Ok(()) => {}
                Err(LookupError::Failed { key, error }) => return Err(StartupError::Failed { key, error }),
                Err(_) => return Err(self.startup_failure()),
            }
        }
        info!(reflectors = self.slots.len(), "all reflectors ready");
        Ok(())
    }

    /// A fatal stop if any reflector has one, otherwise a timeout naming the unready reflectors.
    fn startup_failure(&self) -> StartupError {
        let health = self.registry.health();
        if let Some(failed) = health.failed().next() {
            if let Some(error) = failed.status.fatal.clone() {
                return StartupError::Failed { key: failed.key.clone(), error };
            }
        }
        let pending: Vec<_> = health.reflectors.into_iter().filter(|r| !r.status.ready).map(|r| r.key).collect();
        warn!(pending = %join(&pending), "startup timeout");
        StartupError::Timeout { pending }
    }

    /// Next fatal reflector failure; `None` only once the supervisor is dropped.
    pub async fn next_failure(&mut self) -> Option<ReflectorFailure> {
        self.failures_rx.recv().await
    }

    /// Replace one reflector with a fresh one feeding the same cache.
    pub async fn restart(&mut self, key: &ReflectorKey) -> Result<(), StartupError> {
        let grace = self.config.stop_grace;
        let (target, cache, old_cancel, old_task) = match self.slots.get_mut(key) {
            Some(slot) => (slot.target.clone(), slot.cache.clone(), slot.cancel.clone(), slot.task.take()),
            None => return Err(StartupError::Unknown(key.clone())),
        };
        old_cancel.cancel();
        if let Some(task) = old_task {
            if !join_within(key, task, Instant::now() + grace).await {
                warn!(reflector = %key, "old reflector aborted during restart");
            }
        }
        let cancel = self.shutdown.child_token();
        let (task, status) = self.spawn(&target, &cache, cancel.clone());
        self.registry.set_status(key, status);
        if let Some(slot) = self.slots.get_mut(key) {
            slot.cancel = cancel;
            slot.task = Some(task);
        }
        info!(reflector = %key, "reflector restarted");
        Ok(())
    }

    /// Cancel all reflectors and wait up to the grace period for them to finish.
    pub async fn stop(&mut self) -> StopReport {
        self.shutdown.cancel();
        let deadline = Instant::now() + self.config.stop_grace;
        let mut report = StopReport::default();
        let mut keys: Vec<_> = self.slots.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let Some(task) = self.slots.get_mut(&key).and_then(|s| s.task.take()) else { continue };
            if join_within(&key, task, deadline).await {
                report.stopped.push(key);
            } else {
                report.aborted.push(key);
            }
        }
        if report.aborted.is_empty() {
            info!(stopped = report.stopped.len(), "supervisor stopped");
        } else {
            error!(stopped = report.stopped.len(), aborted = %join(&report.aborted), "supervisor stopped with laggards");
        }
        report
    }

    pub fn health(&self) -> crate::Health { self.registry.health() }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// True when the task finished before the deadline; otherwise it is aborted.
async fn join_within(key: &ReflectorKey, mut task: JoinHandle<Result<(), WatchError>>, deadline: Instant) -> bool {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            error!(reflector = %key, error = %e, "reflector task panicked");
            true
        }
        Err(_) => {
            error!(reflector = %key, "reflector did not stop within grace period; aborting");
            task.abort();
            false
        }
    }
}
