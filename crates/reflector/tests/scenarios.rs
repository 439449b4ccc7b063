mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use spawnwatch_core::{PodView, ReflectorKey, ResourceKind, ResourceVersion, WatchError, WatchEvent, WatchTarget};
use spawnwatch_reflector::{Reflector, ReflectorConfig, ReflectorState, ReflectorStatus};
use spawnwatch_store::Cache;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    cache: Arc<Cache<PodView>>,
    status: watch::Receiver<ReflectorStatus>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), WatchError>>,
}

impl Running {
    fn phase(&self, name: &str) -> Option<String> {
        self.cache.get_named(Some("hub"), name).map(|p| p.phase.clone())
    }

    fn status(&self) -> ReflectorStatus { self.status.borrow().clone() }

    async fn stop(self) -> Result<(), WatchError> {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), self.task).await.expect("reflector ignored cancellation").unwrap()
    }
}

fn key() -> ReflectorKey { ReflectorKey::new(ResourceKind::Pods, Some("hub")) }

fn start(source: Arc<Scripted>, config: ReflectorConfig) -> Running {
    let cache = Arc::new(Cache::new(key()));
    let cancel = CancellationToken::new();
    let reflector = Reflector::new(WatchTarget::pods(Some("hub")), source, Arc::clone(&cache), config, cancel.clone());
    let status = reflector.subscribe();
    let task = tokio::spawn(reflector.run());
    Running { cache, status, cancel, task }
}

async fn ready(r: &Running) {
    tokio::time::timeout(Duration::from_secs(30), r.cache.wait_ready()).await.expect("cache never became ready");
}

fn final_state(cache: &Cache<PodView>) -> Vec<(String, String, Option<ResourceVersion>)> {
    cache
        .snapshot()
        .iter(None)
        .map(|p| (p.key.to_string(), p.phase.clone(), cache.resource_version(&p.key)))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn list_watch_delete_expire_and_bookmark() {
    let source = Scripted::new();
    source.list_ok(&key(), page(vec![pod("hub", "pod1", "Running", 10)], 10));
    source.list_ok(&key(), page(vec![pod("hub", "pod2", "Pending", 50)], 50));
    let first = source.feed(&key());
    let second = source.feed(&key());
    let r = start(Arc::clone(&source), config());

    // 1. initial list
    ready(&r).await;
    assert_eq!(r.phase("pod1").as_deref(), Some("Running"));
    assert!(r.status().ready);

    // 2. modification
    first.send(Ok(WatchEvent::modified(pod("hub", "pod1", "Succeeded", 11)))).unwrap();
    eventually("pod1 succeeded", || r.phase("pod1").as_deref() == Some("Succeeded")).await;

    // 3. deletion
    first.send(Ok(WatchEvent::deleted(pod("hub", "pod1", "Succeeded", 12)))).unwrap();
    eventually("pod1 deleted", || r.phase("pod1").is_none()).await;
    eventually("checkpoint 12", || r.status().checkpoint == Some(ResourceVersion(12))).await;

    // 4. expired checkpoint forces exactly one relist
    first.send(Err(WatchError::ResourceVersionTooOld("too old resource version: 12".into()))).unwrap();
    eventually("pod2 listed", || r.phase("pod2").is_some()).await;
    assert_eq!(r.phase("pod1"), None);
    assert_eq!(r.phase("pod2").as_deref(), Some("Pending"));
    assert_eq!(source.lists(&key()).len(), 2);
    eventually("second watch", || source.watches(&key()).len() == 2).await;
    assert_eq!(source.watch_versions(&key()), vec![10, 50]);

    // 5. bookmark only moves the checkpoint
    let epoch = r.cache.epoch();
    second.send(Ok(WatchEvent::bookmark("60"))).unwrap();
    eventually("checkpoint 60", || r.status().checkpoint == Some(ResourceVersion(60))).await;
    assert_eq!(r.cache.epoch(), epoch);
    assert_eq!(r.cache.len(), 1);
    assert_eq!(r.status().relists, 2);
    assert_eq!(r.status().state, ReflectorState::Watching);

    assert_eq!(r.stop().await, Ok(()));
}

#[tokio::test(start_paused = true)]
async fn transient_watch_failures_back_off_then_resume_from_checkpoint() {
    let source = Scripted::new();
    source.list_ok(&key(), page(vec![pod("hub", "pod1", "Running", 12)], 12));
    for _ in 0..3 {
        source.watch_err(&key(), WatchError::Transient("connection reset by peer".into()));
    }
    let feed = source.feed(&key());
    let r = start(Arc::clone(&source), config());

    eventually("fourth watch attempt", || source.watches(&key()).len() == 4).await;
    let at: Vec<_> = source.watches(&key()).iter().map(|c| c.at).collect();
    for (i, expected_ms) in [100u64, 200, 400].into_iter().enumerate() {
        let gap = at[i + 1] - at[i];
        assert!(
            gap >= Duration::from_millis(expected_ms) && gap <= Duration::from_millis(expected_ms + 5),
            "retry {} waited {:?}",
            i + 1,
            gap
        );
    }
    assert_eq!(source.watch_versions(&key()), vec![12, 12, 12, 12]);
    assert_eq!(source.lists(&key()).len(), 1, "transient errors must not relist");

    feed.send(Ok(WatchEvent::modified(pod("hub", "pod1", "Succeeded", 13)))).unwrap();
    eventually("resumed watch applies events", || r.phase("pod1").as_deref() == Some("Succeeded")).await;
    let status = r.status();
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.state, ReflectorState::Watching);
    assert!(matches!(status.last_error, Some(WatchError::Transient(_))));

    r.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failures_right_after_a_watch_opens_keep_backing_off() {
    let source = Scripted::new();
    source.list_ok(&key(), page(vec![pod("hub", "pod1", "Running", 12)], 12));
    let mut broken = Vec::new();
    for _ in 0..6 {
        let feed = source.feed(&key());
        feed.send(Err(WatchError::Transient("connection reset mid-stream".into()))).unwrap();
        broken.push(feed);
    }
    let healthy = source.feed(&key());
    let r = start(Arc::clone(&source), config());

    eventually("seventh watch attempt", || source.watches(&key()).len() == 7).await;
    let at: Vec<_> = source.watches(&key()).iter().map(|c| c.at).collect();
    for (i, expected_ms) in [100u64, 200, 400, 800, 1600, 3200].into_iter().enumerate() {
        let gap = at[i + 1] - at[i];
        assert!(
            gap >= Duration::from_millis(expected_ms) && gap <= Duration::from_millis(expected_ms + 5),
            "retry {} waited {:?}",
            i + 1,
            gap
        );
    }
    assert_eq!(r.status().consecutive_failures, 6);
    assert_eq!(source.lists(&key()).len(), 1);
    assert!(source.watch_versions(&key()).iter().all(|v| *v == 12));

    healthy.send(Ok(WatchEvent::modified(pod("hub", "pod1", "Succeeded", 13)))).unwrap();
    eventually("first event delivered", || r.phase("pod1").as_deref() == Some("Succeeded")).await;
    assert_eq!(r.status().consecutive_failures, 0);
    r.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn deletions_without_resync_leave_no_tombstones_behind() {
    let source = Scripted::new();
    source.list_ok(&key(), page(Vec::new(), 10));
    let feed = source.feed(&key());
    let r = start(Arc::clone(&source), config());
    ready(&r).await;

    for i in 0..50u64 {
        let name = format!("jupyter-{}", i);
        feed.send(Ok(WatchEvent::added(pod("hub", &name, "Running", 11 + 2 * i)))).unwrap();
        feed.send(Ok(WatchEvent::deleted(pod("hub", &name, "Succeeded", 12 + 2 * i)))).unwrap();
    }
    eventually("all deletions applied", || r.status().checkpoint == Some(ResourceVersion(110))).await;
    assert!(r.cache.is_empty());
    assert_eq!(r.cache.tombstones(), 50);

    feed.send(Ok(WatchEvent::bookmark("111"))).unwrap();
    eventually("tombstones pruned", || r.cache.tombstones() == 0).await;

    // a replayed add from before the checkpoint stays dead
    feed.send(Ok(WatchEvent::added(pod("hub", "jupyter-0", "Running", 11)))).unwrap();
    feed.send(Ok(WatchEvent::bookmark("112"))).unwrap();
    eventually("checkpoint 112", || r.status().checkpoint == Some(ResourceVersion(112))).await;
    assert_eq!(r.phase("jupyter-0"), None);
    assert_eq!(source.lists(&key()).len(), 1);
    r.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stream_end_resumes_with_same_result_as_uninterrupted_watch() {
    let events = vec![
        WatchEvent::modified(pod("hub", "pod1", "Running", 11)),
        WatchEvent::added(pod("hub", "pod3", "Pending", 12)),
        WatchEvent::modified(pod("hub", "pod3", "Running", 13)),
        WatchEvent::deleted(pod("hub", "pod1", "Running", 14)),
    ];

    // interrupted after the second event
    let source = Scripted::new();
    source.list_ok(&key(), page(vec![pod("hub", "pod1", "Pending", 10)], 10));
    let first = source.feed(&key());
    let second = source.feed(&key());
    let interrupted = start(Arc::clone(&source), config());
    ready(&interrupted).await;
    for ev in &events[..2] {
        first.send(Ok(ev.clone())).unwrap();
    }
    drop(first);
    eventually("watch resumed", || source.watches(&key()).len() == 2).await;
    assert_eq!(source.watch_versions(&key()), vec![10, 12]);
    for ev in &events[2..] {
        second.send(Ok(ev.clone())).unwrap();
    }
    eventually("pod1 deleted", || interrupted.phase("pod1").is_none()).await;
    assert_eq!(source.lists(&key()).len(), 1, "a closed stream resumes without relisting");
    assert!(interrupted.status().watch_restarts >= 1);

    // uninterrupted reference
    let reference_source = Scripted::new();
    reference_source.list_ok(&key(), page(vec![pod("hub", "pod1", "Pending", 10)], 10));
    let only = reference_source.feed(&key());
    let reference = start(Arc::clone(&reference_source), config());
    ready(&reference).await;
    for ev in &events {
        only.send(Ok(ev.clone())).unwrap();
    }
    eventually("reference caught up", || reference.status().checkpoint == Some(ResourceVersion(14))).await;

    assert_eq!(final_state(&interrupted.cache), final_state(&reference.cache));
    assert_eq!(final_state(&reference.cache), vec![("hub/pod3".to_string(), "Running".to_string(), Some(ResourceVersion(13)))]);

    interrupted.stop().await.unwrap();
    reference.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn replayed_and_older_events_are_no_ops() {
    let source = Scripted::new();
    source.list_ok(&key(), page(vec![pod("hub", "pod1", "Pending", 10)], 10));
    let feed = source.feed(&key());
    let r = start(Arc::clone(&source), config());
    ready(&r).await;

    feed.send(Ok(WatchEvent::modified(pod("hub", "pod1", "Running", 20)))).unwrap();
    feed.send(Ok(WatchEvent::modified(pod("hub", "pod1", "Running", 20)))).unwrap();
    feed.send(Ok(WatchEvent::modified(pod("hub", "pod1", "Failed", 15)))).unwrap();
    feed.send(Ok(WatchEvent::bookmark("21"))).unwrap();
    eventually("bookmark seen", || r.status().checkpoint == Some(ResourceVersion(21))).await;

    assert_eq!(r.phase("pod1").as_deref(), Some("Running"));
    assert_eq!(r.cache.resource_version(&spawnwatch_core::ObjectKey::new(Some("hub"), "pod1")), Some(ResourceVersion(20)));
    r.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn fatal_list_error_stops_without_retry() {
    let source = Scripted::new();
    source.list_err(&key(), WatchError::Forbidden("pods is forbidden".into()));
    let r = start(Arc::clone(&source), config());

    let result = tokio::time::timeout(Duration::from_secs(5), r.task).await.expect("reflector kept running").unwrap();
    assert!(matches!(result, Err(WatchError::Forbidden(_))));
    let status = r.status.borrow().clone();
    assert_eq!(status.state, ReflectorState::Stopped);
    assert!(status.is_failed());
    assert!(!status.ready);
    assert_eq!(source.lists(&key()).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_watch_error_keeps_last_cache_content() {
    let source = Scripted::new();
    source.list_ok(&key(), page(vec![pod("hub", "pod1", "Running", 10)], 10));
    source.watch_err(&key(), WatchError::Unauthorized("token expired".into()));
    let r = start(Arc::clone(&source), config());

    let result = tokio::time::timeout(Duration::from_secs(5), r.task).await.expect("reflector kept running").unwrap();
    assert!(matches!(result, Err(WatchError::Unauthorized(_))));
    assert_eq!(r.cache.get_named(Some("hub"), "pod1").map(|p| p.phase.clone()).as_deref(), Some("Running"));
    assert!(matches!(r.status.borrow().fatal, Some(WatchError::Unauthorized(_))));
}

#[tokio::test(start_paused = true)]
async fn malformed_items_and_events_are_skipped() {
    let source = Scripted::new();
    source.list_ok(
        &key(),
        page(vec![json!({ "metadata": { "namespace": "hub" } }), pod("hub", "pod1", "Pending", 10)], 10),
    );
    let feed = source.feed(&key());
    let r = start(Arc::clone(&source), config());
    ready(&r).await;
    assert_eq!(r.cache.len(), 1);

    feed.send(Err(WatchError::Malformed("invalid JSON line".into()))).unwrap();
    feed.send(Ok(WatchEvent::modified(json!({ "metadata": { "name": "pod1", "namespace": "hub" } })))).unwrap();
    feed.send(Ok(WatchEvent::bookmark("not-a-number"))).unwrap();
    feed.send(Ok(WatchEvent::modified(pod("hub", "pod1", "Running", 11)))).unwrap();
    eventually("valid event applied", || r.phase("pod1").as_deref() == Some("Running")).await;

    assert_eq!(r.status().checkpoint, Some(ResourceVersion(11)));
    assert_eq!(r.status().state, ReflectorState::Watching);
    assert_eq!(source.lists(&key()).len(), 1);
    assert_eq!(source.watches(&key()).len(), 1);
    r.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn pagination_is_drained_and_a_failed_page_restarts_the_list() {
    let source = Scripted::new();
    let first_page = vec![pod("hub", "a", "Running", 21), pod("hub", "b", "Running", 22)];
    source.list_ok(&key(), partial_page(first_page.clone(), 30, "t1"));
    source.list_err(&key(), WatchError::Transient("503 Service Unavailable".into()));
    source.list_ok(&key(), partial_page(first_page, 30, "t1"));
    source.list_ok(&key(), page(vec![pod("hub", "c", "Pending", 25)], 30));
    let _feed = source.feed(&key());
    let r = start(Arc::clone(&source), ReflectorConfig { list_page_size: Some(2), ..config() });

    ready(&r).await;
    assert_eq!(r.cache.len(), 3);
    assert_eq!(r.cache.list_version(), Some(ResourceVersion(30)));
    let tokens: Vec<_> = source
        .lists(&key())
        .into_iter()
        .map(|c| match c.op {
            Op::List { limit, continue_token } => {
                assert_eq!(limit, Some(2));
                continue_token
            }
            other => panic!("unexpected call {:?}", other),
        })
        .collect();
    assert_eq!(tokens, vec![None, Some("t1".to_string()), None, Some("t1".to_string())]);
    assert_eq!(r.status().relists, 1);
    eventually("watch opened", || source.watches(&key()).len() == 1).await;
    assert_eq!(source.watch_versions(&key()), vec![30]);
    r.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn periodic_resync_relists() {
    let source = Scripted::new();
    source.list_ok(&key(), page(vec![pod("hub", "pod1", "Running", 10)], 10));
    source.list_ok(&key(), page(vec![pod("hub", "pod2", "Running", 20)], 20));
    let _quiet = source.feed(&key());
    let _next = source.feed(&key());
    let r = start(Arc::clone(&source), ReflectorConfig { resync: Some(Duration::from_secs(5)), ..config() });

    ready(&r).await;
    eventually("resync relist", || source.lists(&key()).len() == 2).await;
    eventually("resync applied", || r.phase("pod2").is_some()).await;
    assert_eq!(r.phase("pod1"), None);
    let lists = source.lists(&key());
    assert!(lists[1].at - lists[0].at >= Duration::from_secs(5));
    eventually("watch after resync", || source.watches(&key()).len() == 2).await;
    assert_eq!(source.watch_versions(&key()), vec![10, 20]);
    r.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn idle_watch_reconnects_from_checkpoint() {
    let source = Scripted::new();
    source.list_ok(&key(), page(vec![pod("hub", "pod1", "Running", 10)], 10));
    let _silent = source.feed(&key());
    let r = start(Arc::clone(&source), ReflectorConfig { request_timeout: Duration::from_secs(2), ..config() });

    ready(&r).await;
    eventually("reconnect after idle", || source.watches(&key()).len() >= 2).await;
    let versions = source.watch_versions(&key());
    assert_eq!((versions[0], versions[1]), (10, 10));
    assert_eq!(source.lists(&key()).len(), 1);
    r.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn keeps_retrying_past_the_degraded_threshold() {
    let source = Scripted::new();
    for _ in 0..6 {
        source.list_err(&key(), WatchError::Transient("dial tcp: i/o timeout".into()));
    }
    source.list_ok(&key(), page(vec![pod("hub", "pod1", "Running", 10)], 10));
    let _feed = source.feed(&key());
    let r = start(Arc::clone(&source), ReflectorConfig { degraded_after: 3, ..config() });

    eventually("six failures recorded", || r.status().consecutive_failures == 6).await;
    ready(&r).await;
    assert_eq!(source.lists(&key()).len(), 7);
    assert_eq!(r.status().consecutive_failures, 0);
    r.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_a_hanging_list_and_a_backoff() {
    // list never answers
    let source = Scripted::new();
    let r = start(Arc::clone(&source), config());
    eventually("list issued", || source.lists(&key()).len() == 1).await;
    let status = r.status.clone();
    assert_eq!(r.stop().await, Ok(()));
    assert_eq!(status.borrow().state, ReflectorState::Stopped);

    // cancelled while sleeping between retries
    let source = Scripted::new();
    source.list_err(&key(), WatchError::Transient("refused".into()));
    let r = start(Arc::clone(&source), ReflectorConfig { backoff_initial: Duration::from_secs(600), backoff_max: Duration::from_secs(600), ..config() });
    eventually("failure recorded", || r.status().consecutive_failures == 1).await;
    assert_eq!(r.stop().await, Ok(()));
    assert_eq!(source.lists(&key()).len(), 1);
}
