use std::time::Duration;

use serde::Serialize;
use spawnwatch_core::{WatchTarget, DEFAULT_EVENT_FIELD_SELECTOR, DEFAULT_POD_SELECTOR};
use spawnwatch_reflector::{ReflectorConfig, SupervisorConfig};
use tracing::warn;

/// Everything the hub needs to know to start its reflectors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubConfig {
    /// Empty means one cluster-wide reflector per kind.
    pub namespaces: Vec<String>,
    pub pod_selector: String,
    pub events_enabled: bool,
    pub event_field_selector: String,
    /// Network read timeout for the API client.
    pub request_timeout: Duration,
    #[serde(skip)]
    pub supervisor: SupervisorConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            pod_selector: DEFAULT_POD_SELECTOR.to_string(),
            events_enabled: true,
            event_field_selector: DEFAULT_EVENT_FIELD_SELECTOR.to_string(),
            request_timeout: Duration::from_secs(330),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl HubConfig {
    /// Read `SPAWNWATCH_*` variables; unset or unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = HubConfig::default();
        let r = ReflectorConfig::default();
        let num = |key: &str| -> Option<u64> {
            let raw = get(key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(var = key, value = %raw, "ignoring unparseable setting");
                    None
                }
            }
        };

        let request_timeout = num("SPAWNWATCH_REQUEST_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.request_timeout);
        let resync = match num("SPAWNWATCH_RESYNC_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => r.resync,
        };
        let resync_jitter = get("SPAWNWATCH_RESYNC_JITTER")
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|j| j.is_finite() && *j >= 0.0)
            .unwrap_or(r.resync_jitter);
        let reflector = ReflectorConfig {
            resync,
            resync_jitter,
            watch_timeout_secs: num("SPAWNWATCH_WATCH_TIMEOUT_SECS").map(|v| v.min(u32::MAX as u64) as u32).unwrap_or(r.watch_timeout_secs),
            request_timeout,
            backoff_initial: num("SPAWNWATCH_BACKOFF_INITIAL_MS").map(Duration::from_millis).unwrap_or(r.backoff_initial),
            backoff_max: num("SPAWNWATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(r.backoff_max),
            degraded_after: num("SPAWNWATCH_DEGRADED_AFTER").map(|v| v.min(u32::MAX as u64) as u32).unwrap_or(r.degraded_after),
            list_page_size: match num("SPAWNWATCH_LIST_PAGE_SIZE") {
                Some(0) => None,
                Some(n) => Some(n.min(u32::MAX as u64) as u32),
                None => r.list_page_size,
            },
            ..r
        };
        let supervisor = SupervisorConfig {
            reflector,
            startup_timeout: num("SPAWNWATCH_STARTUP_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.supervisor.startup_timeout),
            stop_grace: num("SPAWNWATCH_STOP_GRACE_SECS").map(Duration::from_secs).unwrap_or(d.supervisor.stop_grace),
        };

        HubConfig {
            namespaces: get("SPAWNWATCH_NAMESPACES").map(|s| parse_namespaces(&s)).unwrap_or_default(),
            pod_selector: get("SPAWNWATCH_POD_SELECTOR").unwrap_or(d.pod_selector),
            events_enabled: get("SPAWNWATCH_EVENTS_ENABLED").and_then(|s| parse_bool(&s)).unwrap_or(d.events_enabled),
            event_field_selector: get("SPAWNWATCH_EVENT_FIELD_SELECTOR").unwrap_or(d.event_field_selector),
            request_timeout,
            supervisor,
        }
    }

    /// One pod target (and one event target when enabled) per namespace.
    pub fn targets(&self) -> Vec<WatchTarget> {
        let scopes: Vec<Option<&str>> = if self.namespaces.is_empty() {
            vec![None]
        } else {
            self.namespaces.iter().map(|ns| Some(ns.as_str())).collect()
        };
        let mut targets = Vec::with_capacity(scopes.len() * 2);
        for ns in scopes {
            targets.push(WatchTarget::pods(ns).labels(&self.pod_selector));
            if self.events_enabled {
                targets.push(WatchTarget::events(ns).fields(&self.event_field_selector));
            }
        }
        targets
    }

    pub fn cluster_wide(&self) -> bool { self.namespaces.is_empty() }
}

/// Comma separated; `*` anywhere (or nothing at all) selects every namespace.
pub fn parse_namespaces(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for ns in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if ns == "*" {
            return Vec::new();
        }
        if !out.iter().any(|seen| seen == ns) {
            out.push(ns.to_string());
        }
    }
    out
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
