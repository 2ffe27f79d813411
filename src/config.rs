use std::str::FromStr;
use std::time::Duration;

/// Tuning knobs of the admission scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Number of worker tasks draining the queue.
    pub workers: usize,
    /// Attempts per request, first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_cap: Duration,
    /// Fixed length of every booking window.
    pub slot_duration: Duration,
    /// Upper bound on how long an idle worker or the timer goes without
    /// looking at the running flag.
    pub poll_interval: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SLOT_DURATION: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_JITTER_MIN: Duration = Duration::from_millis(250);
pub const DEFAULT_JITTER_MAX: Duration = Duration::from_millis(750);

/// Half the available parallelism, never fewer than two.
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    (cores / 2).max(2)
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            slot_duration: DEFAULT_SLOT_DURATION,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter_min: DEFAULT_JITTER_MIN,
            jitter_max: DEFAULT_JITTER_MAX,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

impl AdmissionConfig {
    /// Defaults overridden by `ADMITD_*` environment variables. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_parse("ADMITD_WORKERS").unwrap_or(d.workers),
            max_attempts: env_parse("ADMITD_MAX_ATTEMPTS").unwrap_or(d.max_attempts),
            initial_backoff: env_millis("ADMITD_INITIAL_BACKOFF_MS").unwrap_or(d.initial_backoff),
            backoff_cap: env_millis("ADMITD_BACKOFF_CAP_MS").unwrap_or(d.backoff_cap),
            slot_duration: env_parse::<u64>("ADMITD_SLOT_MINUTES")
                .map(|m| Duration::from_secs(m.saturating_mul(60)))
                .unwrap_or(d.slot_duration),
            poll_interval: env_millis("ADMITD_POLL_INTERVAL_MS").unwrap_or(d.poll_interval),
            jitter_min: env_millis("ADMITD_JITTER_MIN_MS").unwrap_or(d.jitter_min),
            jitter_max: env_millis("ADMITD_JITTER_MAX_MS").unwrap_or(d.jitter_max),
        }
        .normalized()
    }

    /// Clamp values the scheduler cannot run with.
    pub fn normalized(mut self) -> Self {
        self.workers = self.workers.max(1);
        self.max_attempts = self.max_attempts.max(1);
        if self.slot_duration.is_zero() {
            self.slot_duration = DEFAULT_SLOT_DURATION;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.jitter_min > self.jitter_max {
            std::mem::swap(&mut self.jitter_min, &mut self.jitter_max);
        }
        self.backoff_cap = self.backoff_cap.max(self.initial_backoff);
        self
    }
}
