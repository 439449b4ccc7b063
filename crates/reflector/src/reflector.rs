//! The list-then-watch loop for one `(kind, namespace)`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use futures::StreamExt;
use serde::Serialize;
use spawnwatch_core::{
    Delta, ListWatch, PageRequest, Projection, ResourceVersion, WatchError, WatchEvent, WatchTarget,
};
use spawnwatch_store::Cache;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ReflectorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflectorState {
    Created,
    Listing,
    Watching,
    Stopped,
}

/// Externally visible progress of one reflector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReflectorStatus {
    pub state: ReflectorState,
    /// First full list applied.
    pub ready: bool,
    pub checkpoint: Option<ResourceVersion>,
    pub relists: u64,
    pub watch_restarts: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<WatchError>,
    /// Set when the reflector stopped on a fatal error.
    pub fatal: Option<WatchError>,
}

impl Default for ReflectorStatus {
    fn default() -> Self {
        Self {
            state: ReflectorState::Created,
            ready: false,
            checkpoint: None,
            relists: 0,
            watch_restarts: 0,
            consecutive_failures: 0,
            last_error: None,
            fatal: None,
        }
    }
}

impl ReflectorStatus {
    pub fn is_failed(&self) -> bool { self.fatal.is_some() }
}

#[derive(Clone, Copy)]
enum Step {
    List,
    Watch,
}

enum WatchEnd {
    /// Stream ended or went idle; resume from the checkpoint.
    Closed,
    Resync,
    Cancelled,
}

/// Consecutive failure bookkeeping plus the backoff policy.
struct Retry {
    backoff: ExponentialBackoff,
    failures: u32,
    degraded_after: u32,
    max: Duration,
}

impl Retry {
    fn succeeded(&mut self) {
        self.backoff.reset();
        self.failures = 0;
    }

    fn failed(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.backoff.next_backoff().unwrap_or(self.max)
    }

    fn just_degraded(&self) -> bool {
        self.degraded_after > 0 && self.failures == self.degraded_after
    }
}

/// Keeps one cache in sync with the server. Sole writer of that cache.
pub struct Reflector<T: Projection> {
    target: WatchTarget,
    source: Arc<dyn ListWatch>,
    cache: Arc<Cache<T>>,
    config: ReflectorConfig,
    status: watch::Sender<ReflectorStatus>,
    cancel: CancellationToken,
}

impl<T: Projection> Reflector<T> {
    pub fn new(
        target: WatchTarget,
        source: Arc<dyn ListWatch>,
        cache: Arc<Cache<T>>,
        config: ReflectorConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(ReflectorStatus::default());
        Self { target, source, cache, config, status, cancel }
    }

    pub fn cache(&self) -> &Arc<Cache<T>> { &self.cache }

    pub fn subscribe(&self) -> watch::Receiver<ReflectorStatus> { self.status.subscribe() }

    pub fn target(&self) -> &WatchTarget { &self.target }

    /// Run until cancelled (`Ok`) or a fatal error (`Err`). Transient errors never escape.
    pub async fn run(self) -> Result<(), WatchError> {
        let key = self.target.key();
        info!(reflector = %key, selectors = %self.target.describe_selectors(), "reflector starting");
        let mut retry = Retry {
            backoff: self.config.backoff(),
            failures: 0,
            degraded_after: self.config.degraded_after,
            max: self.config.backoff_max,
        };
        let mut step = Step::List;
        let mut checkpoint = ResourceVersion::default();
        let mut resync_at: Option<Instant> = None;

        let outcome = loop {
            let result = match step {
                Step::List => match self.until_cancelled(self.list()).await {
                    None => break Ok(()),
                    Some(Ok(rv)) => {
                        checkpoint = rv;
                        retry.succeeded();
                        resync_at = self.config.next_resync().and_then(|d| Instant::now().checked_add(d));
                        Ok(Step::Watch)
                    }
                    Some(Err(e)) => Err(e),
                },
                Step::Watch => match self.watch(&mut checkpoint, resync_at, &mut retry).await {
                    Ok(WatchEnd::Cancelled) => break Ok(()),
                    Ok(WatchEnd::Closed) => {
                        self.status.send_modify(|s| s.watch_restarts += 1);
                        metrics::counter!("reflector_watch_restarts_total", 1u64, "kind" => key.kind.as_str());
                        Ok(Step::Watch)
                    }
                    Ok(WatchEnd::Resync) => {
                        info!(reflector = %key, rv = %checkpoint, "periodic resync");
                        metrics::counter!("reflector_resyncs_total", 1u64, "kind" => key.kind.as_str());
                        Ok(Step::List)
                    }
                    Err(e) => Err(e),
                },
            };

            match result {
                Ok(next) => step = next,
                Err(WatchError::StreamClosed) => step = Step::Watch,
                Err(WatchError::ResourceVersionTooOld(msg)) => {
                    info!(reflector = %key, rv = %checkpoint, reason = %msg, "checkpoint expired; relisting");
                    metrics::counter!("reflector_expired_total", 1u64, "kind" => key.kind.as_str());
                    step = Step::List;
                }
                Err(e) if e.is_fatal() => break Err(e),
                Err(e) => {
                    let delay = retry.failed();
                    let failures = retry.failures;
                    self.status.send_modify(|s| {
                        s.consecutive_failures = failures;
                        s.last_error = Some(e.clone());
                    });
                    metrics::counter!("reflector_errors_total", 1u64, "kind" => key.kind.as_str(), "reason" => e.reason());
                    metrics::histogram!("reflector_backoff_seconds", delay.as_secs_f64());
                    if retry.just_degraded() {
                        warn!(reflector = %key, failures, error = %e, "reflector degraded; still retrying");
                    } else {
                        debug!(reflector = %key, failures, error = %e, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                    }
                    if self.until_cancelled(tokio::time::sleep(delay)).await.is_none() {
                        break Ok(());
                    }
                }
            }
        };

        match &outcome {
            Ok(()) => info!(reflector = %key, "reflector stopped"),
            Err(e) => error!(reflector = %key, error = %e, "reflector stopped on fatal error"),
        }
        let fatal = outcome.as_ref().err().cloned();
        self.status.send_modify(|s| {
            s.state = ReflectorState::Stopped;
            if let Some(e) = fatal {
                s.last_error = Some(e.clone());
                s.fatal = Some(e);
            }
        });
        outcome
    }

    async fn until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }

    fn set_state(&self, state: ReflectorState) {
        self.status.send_if_modified(|s| {
            let changed = s.state != state;
            s.state = state;
            changed
        });
    }

    /// Drain every page, then swap the cache atomically. Any page error aborts the whole list.
    async fn list(&self) -> Result<ResourceVersion, WatchError> {
        self.set_state(ReflectorState::Listing);
        let key = self.target.key();
        let started = Instant::now();
        let mut items = Vec::new();
        let mut skipped = 0usize;
        let mut pages = 0u32;
        let mut continue_token = None;
        let list_version = loop {
            let page = self
                .source
                .list(&self.target, PageRequest { limit: self.config.list_page_size, continue_token: continue_token.take() })
                .await?;
            pages += 1;
            for raw in &page.items {
                match project::<T>(raw) {
                    Ok(item) => items.push(item),
                    Err(e) => {
                        skipped += 1;
                        warn!(reflector = %key, error = %e, "skipping malformed list item");
                    }
                }
            }
            match page.continue_token {
                Some(token) => continue_token = Some(token),
                None => break page.resource_version.parse::<ResourceVersion>()?,
            }
        };

        let stats = self.cache.replace(items, list_version);
        let took = started.elapsed();
        self.status.send_modify(|s| {
            s.ready = true;
            s.relists += 1;
            s.checkpoint = Some(list_version);
            s.consecutive_failures = 0;
        });
        metrics::counter!("reflector_relists_total", 1u64, "kind" => key.kind.as_str());
        metrics::histogram!("reflector_list_seconds", took.as_secs_f64());
        if skipped > 0 {
            metrics::counter!("reflector_malformed_total", skipped as u64, "kind" => key.kind.as_str());
        }
        info!(reflector = %key, items = stats.items, evicted = stats.evicted, pages, skipped, rv = %list_version, took_ms = %took.as_millis(), "list applied");
        Ok(list_version)
    }

    async fn watch(
        &self,
        checkpoint: &mut ResourceVersion,
        resync_at: Option<Instant>,
        retry: &mut Retry,
    ) -> Result<WatchEnd, WatchError> {
        let key = self.target.key();
        let opened = self.source.watch(&self.target, *checkpoint, Some(self.config.watch_timeout_secs));
        let mut stream = match self.until_cancelled(opened).await {
            None => return Ok(WatchEnd::Cancelled),
            Some(r) => r?,
        };
        self.set_state(ReflectorState::Watching);
        let pruned = self.cache.prune_tombstones(*checkpoint);
        debug!(reflector = %key, rv = %checkpoint, pruned, "watch opened");
        // an open stream can still fail straight away; only a delivered event counts as recovery
        let mut delivered = false;

        let resync = async {
            match resync_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(resync);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(WatchEnd::Cancelled),
                _ = &mut resync => return Ok(WatchEnd::Resync),
                next = tokio::time::timeout(self.config.request_timeout, stream.next()) => next,
            };
            match next {
                Err(_) => {
                    warn!(reflector = %key, rv = %checkpoint, idle_secs = self.config.request_timeout.as_secs(), "watch idle; reconnecting");
                    return Ok(WatchEnd::Closed);
                }
                Ok(None) | Ok(Some(Err(WatchError::StreamClosed))) => {
                    debug!(reflector = %key, rv = %checkpoint, "watch stream closed; resuming");
                    return Ok(WatchEnd::Closed);
                }
                Ok(Some(Err(WatchError::Malformed(msg)))) => {
                    warn!(reflector = %key, error = %msg, "skipping malformed watch event");
                    metrics::counter!("reflector_malformed_total", 1u64, "kind" => key.kind.as_str());
                }
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(event))) => {
                    if !delivered {
                        delivered = true;
                        retry.succeeded();
                        self.status.send_if_modified(|s| {
                            let changed = s.consecutive_failures != 0;
                            s.consecutive_failures = 0;
                            changed
                        });
                    }
                    match event {
                        WatchEvent::Bookmark { resource_version } => match resource_version.parse::<ResourceVersion>() {
                            Ok(rv) => {
                                self.advance(checkpoint, rv);
                                self.cache.prune_tombstones(*checkpoint);
                            }
                            Err(e) => warn!(reflector = %key, error = %e, "skipping malformed bookmark"),
                        },
                        WatchEvent::Delta(delta) => self.apply(delta, checkpoint),
                    }
                }
            }
        }
    }

    fn apply(&self, delta: Delta, checkpoint: &mut ResourceVersion) {
        let key = self.target.key();
        let (object_key, rv, object) = match project::<T>(&delta.raw) {
            Ok(item) => item,
            Err(e) => {
                warn!(reflector = %key, error = %e, "skipping malformed watch event");
                metrics::counter!("reflector_malformed_total", 1u64, "kind" => key.kind.as_str());
                return;
            }
        };
        if rv <= *checkpoint {
            debug!(reflector = %key, object = %object_key, rv = %rv, checkpoint = %checkpoint, "ignoring delta at or below checkpoint");
            metrics::counter!("reflector_events_stale_total", 1u64, "kind" => key.kind.as_str());
            return;
        }
        let outcome = self.cache.apply(delta.kind, object_key, rv, object);
        if outcome.changed() {
            metrics::counter!("reflector_events_applied_total", 1u64, "kind" => key.kind.as_str());
        }
        self.advance(checkpoint, rv);
    }

    fn advance(&self, checkpoint: &mut ResourceVersion, rv: ResourceVersion) {
        if rv > *checkpoint {
            *checkpoint = rv;
            self.status.send_modify(|s| s.checkpoint = Some(rv));
        }
    }
}

fn project<T: Projection>(raw: &serde_json::Value) -> Result<(spawnwatch_core::ObjectKey, ResourceVersion, T), WatchError> {
    let rv = ResourceVersion::from_raw(raw)?;
    let obj = T::project(raw)?;
    Ok((obj.key().clone(), rv, obj))
}
