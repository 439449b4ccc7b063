//! Scripted list/watch source shared by the reflector integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use spawnwatch_core::{
    EventStream, ListPage, ListWatch, PageRequest, ReflectorKey, ResourceVersion, WatchError, WatchEvent, WatchTarget,
};
use spawnwatch_reflector::ReflectorConfig;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub type Feed = mpsc::UnboundedSender<Result<WatchEvent, WatchError>>;

pub enum WatchScript {
    /// Stream yields whatever the test sends and ends when the sender is dropped.
    Feed(mpsc::UnboundedReceiver<Result<WatchEvent, WatchError>>),
    Fail(WatchError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    List { limit: Option<u32>, continue_token: Option<String> },
    Watch { rv: ResourceVersion, timeout_secs: Option<u32> },
}

#[derive(Debug, Clone)]
pub struct Call {
    pub key: ReflectorKey,
    pub at: Instant,
    pub op: Op,
}

#[derive(Default)]
struct Script {
    lists: HashMap<ReflectorKey, VecDeque<Result<ListPage, WatchError>>>,
    watches: HashMap<ReflectorKey, VecDeque<WatchScript>>,
    calls: Vec<Call>,
}

/// Replays queued responses per reflector key. Once a queue runs dry, lists
/// hang and watches open a stream that never yields.
#[derive(Default)]
pub struct Scripted {
    script: Mutex<Script>,
}

impl Scripted {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn list_ok(&self, key: &ReflectorKey, page: ListPage) {
        self.script.lock().unwrap().lists.entry(key.clone()).or_default().push_back(Ok(page));
    }

    pub fn list_err(&self, key: &ReflectorKey, err: WatchError) {
        self.script.lock().unwrap().lists.entry(key.clone()).or_default().push_back(Err(err));
    }

    pub fn watch_err(&self, key: &ReflectorKey, err: WatchError) {
        self.script.lock().unwrap().watches.entry(key.clone()).or_default().push_back(WatchScript::Fail(err));
    }

    /// Queue a watch whose events the test pushes through the returned sender.
    pub fn feed(&self, key: &ReflectorKey) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().unwrap().watches.entry(key.clone()).or_default().push_back(WatchScript::Feed(rx));
        tx
    }

    pub fn calls(&self) -> Vec<Call> { self.script.lock().unwrap().calls.clone() }

    pub fn lists(&self, key: &ReflectorKey) -> Vec<Call> {
        self.calls().into_iter().filter(|c| &c.key == key && matches!(c.op, Op::List { .. })).collect()
    }

    pub fn watches(&self, key: &ReflectorKey) -> Vec<Call> {
        self.calls().into_iter().filter(|c| &c.key == key && matches!(c.op, Op::Watch { .. })).collect()
    }

    pub fn watch_versions(&self, key: &ReflectorKey) -> Vec<u64> {
        self.watches(key)
            .into_iter()
            .filter_map(|c| match c.op {
                Op::Watch { rv, .. } => Some(rv.0),
                _ => None,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ListWatch for Scripted {
    async fn list(&self, target: &WatchTarget, page: PageRequest) -> Result<ListPage, WatchError> {
        let next = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(Call {
                key: target.key(),
                at: Instant::now(),
                op: Op::List { limit: page.limit, continue_token: page.continue_token.clone() },
            });
            script.lists.get_mut(&target.key()).and_then(|q| q.pop_front())
        };
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn watch(
        &self,
        target: &WatchTarget,
        resource_version: ResourceVersion,
        timeout_secs: Option<u32>,
    ) -> Result<EventStream, WatchError> {
        let next = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(Call {
                key: target.key(),
                at: Instant::now(),
                op: Op::Watch { rv: resource_version, timeout_secs },
            });
            script.watches.get_mut(&target.key()).and_then(|q| q.pop_front())
        };
        match next {
            Some(WatchScript::Fail(err)) => Err(err),
            Some(WatchScript::Feed(mut rx)) => {
                let stream = async_stream::stream! {
                    while let Some(item) = rx.recv().await {
                        yield item;
                    }
                };
                Ok(stream.boxed())
            }
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

pub fn pod(ns: &str, name: &str, phase: &str, rv: u64) -> Value {
    json!({
        "metadata": {
            "name": name,
            "namespace": ns,
            "resourceVersion": rv.to_string(),
            "labels": { "component": "singleuser-server" }
        },
        "status": { "phase": phase }
    })
}

pub fn event(ns: &str, name: &str, pod: &str, reason: &str, rv: u64) -> Value {
    json!({
        "metadata": { "name": name, "namespace": ns, "resourceVersion": rv.to_string(), "uid": format!("uid-{}", name) },
        "involvedObject": { "kind": "Pod", "namespace": ns, "name": pod },
        "reason": reason,
        "message": format!("{} {}", reason, pod),
        "type": "Normal",
        "lastTimestamp": format!("2024-01-01T00:00:{:02}Z", rv % 60)
    })
}

pub fn page(items: Vec<Value>, rv: u64) -> ListPage {
    ListPage { items, resource_version: rv.to_string(), continue_token: None }
}

pub fn partial_page(items: Vec<Value>, rv: u64, token: &str) -> ListPage {
    ListPage { items, resource_version: rv.to_string(), continue_token: Some(token.to_string()) }
}

/// Deterministic settings: no resync, no backoff jitter, long idle timeout.
pub fn config() -> ReflectorConfig {
    ReflectorConfig {
        resync: None,
        resync_jitter: 0.0,
        watch_timeout_secs: 290,
        request_timeout: Duration::from_secs(3600),
        backoff_initial: Duration::from_millis(100),
        backoff_max: Duration::from_secs(10),
        backoff_multiplier: 2.0,
        backoff_randomization: 0.0,
        degraded_after: 5,
        list_page_size: Some(500),
    }
}

/// Poll `cond` while letting (paused) time move forward.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(120);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
