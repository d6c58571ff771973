// ── Failure controller ──
//
// One instance per physical endpoint. Counts consecutive failures and
// turns them into an exponential delay applied before the next request.
// Login requests skip the wait but still feed the counters.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::debug;

use crate::error::FailureKind;

/// Exponential backoff tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure. Default: 1s.
    pub base: Duration,
    /// Growth per additional failure. Default: 2.
    pub factor: f64,
    /// Upper bound before jitter. Default: 60s.
    pub max_delay: Duration,
    /// Jitter as a fraction of the delay, added on top. Default: 0.1.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// `min(base * factor^(errors-1), max_delay)`; zero when `errors == 0`.
    pub fn delay_for(&self, errors: u32) -> Duration {
        if errors == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(errors - 1).unwrap_or(i32::MAX);
        let raw = self.base.as_secs_f64() * self.factor.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if delay.is_zero() || self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay + delay.mul_f64(spread)
    }
}

/// Whether a request may be held back by the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Data,
    /// Login / session establishment; never delayed.
    Authentication,
}

#[derive(Debug, Default)]
struct State {
    consecutive_errors: u32,
    delay: Duration,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<(DateTime<Utc>, FailureKind)>,
}

/// Point-in-time view of one controller, for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureSnapshot {
    pub consecutive_errors: u32,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_failure_kind: Option<FailureKind>,
}

/// Per-endpoint consecutive-failure counter.
#[derive(Debug)]
pub struct FailureController {
    config: BackoffConfig,
    state: Mutex<State>,
}

impl FailureController {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Current delay before jitter.
    pub fn delay(&self) -> Duration {
        self.with_state(|s| s.delay)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.with_state(|s| s.consecutive_errors)
    }

    /// Wait out the current backoff delay, unless this is a login request.
    pub async fn before_request(&self, class: RequestClass) {
        if class == RequestClass::Authentication {
            return;
        }
        let delay = self.with_state(|s| s.delay);
        if delay.is_zero() {
            return;
        }
        let wait = self.config.jittered(delay);
        debug!(delay_ms = wait.as_millis(), "backing off before request");
        tokio::time::sleep(wait).await;
    }

    pub fn record_success(&self) {
        self.with_state(|s| {
            s.consecutive_errors = 0;
            s.delay = Duration::ZERO;
            s.last_success = Some(Utc::now());
        });
    }

    pub fn record_failure(&self, kind: FailureKind) {
        let config = self.config;
        self.with_state(|s| {
            s.consecutive_errors = s.consecutive_errors.saturating_add(1);
            s.delay = config.delay_for(s.consecutive_errors);
            s.last_failure = Some((Utc::now(), kind));
        });
    }

    pub fn snapshot(&self) -> FailureSnapshot {
        self.with_state(|s| FailureSnapshot {
            consecutive_errors: s.consecutive_errors,
            delay: s.delay,
            last_success: s.last_success,
            last_failure: s.last_failure.map(|(at, _)| at),
            last_failure_kind: s.last_failure.map(|(_, kind)| kind),
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        // A poisoned lock only means another thread panicked mid-update;
        // the counters are still usable.
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

// ── Tests ────────────────────────────────────────────────────────────
