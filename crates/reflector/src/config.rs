use std::time::Duration;

use backoff::ExponentialBackoff;
use rand::Rng;

/// Tunables for one reflector.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflectorConfig {
    /// Forced relist interval; `None` disables periodic resync.
    pub resync: Option<Duration>,
    /// Upper bound of the random extra fraction added to `resync`.
    pub resync_jitter: f64,
    /// Server-side watch timeout.
    pub watch_timeout_secs: u32,
    /// Reconnect when a watch stream is silent for this long.
    pub request_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_multiplier: f64,
    pub backoff_randomization: f64,
    /// Consecutive failures before a degraded warning.
    pub degraded_after: u32,
    pub list_page_size: Option<u32>,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            resync: Some(Duration::from_secs(300)),
            resync_jitter: 0.1,
            watch_timeout_secs: 290,
            request_timeout: Duration::from_secs(330),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            backoff_randomization: 0.5,
            degraded_after: 5,
            list_page_size: Some(500),
        }
    }
}

impl ReflectorConfig {
    /// Retry policy for transient failures; never gives up.
    pub fn backoff(&self) -> ExponentialBackoff {
        let mut b = ExponentialBackoff {
            initial_interval: self.backoff_initial,
            current_interval: self.backoff_initial,
            randomization_factor: self.backoff_randomization.clamp(0.0, 1.0),
            multiplier: self.backoff_multiplier.max(1.0),
            max_interval: self.backoff_max.max(self.backoff_initial),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        backoff::backoff::Backoff::reset(&mut b);
        b
    }

    /// Next resync delay: `resync * (1 + U[0, jitter))`, saturating at `Duration::MAX`.
    pub fn next_resync(&self) -> Option<Duration> {
        let base = self.resync?;
        let jitter = if self.resync_jitter.is_finite() { self.resync_jitter.max(0.0) } else { 0.0 };
        if jitter == 0.0 {
            return Some(base);
        }
        let extra = rand::thread_rng().gen_range(0.0..jitter);
        Some(Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + extra)).unwrap_or(Duration::MAX))
    }
}
