//! Error control for the ingest path: classification, a sliding error-rate
//! window, a circuit breaker and an adaptive log rate limiter.
//!
//! All of this is owned by the single ingest task, so the types here take
//! `&mut self` and carry no locks.

use std::io;
use std::time::{Duration, Instant};

/// How a read error should be treated by the ingest loop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Expected under load (EAGAIN, EOF, closed); retry without ceremony.
    Transient,
    /// Unknown failure; retried but counted against the breaker.
    Recoverable,
    /// Permission problems and the like; trips the breaker immediately.
    Permanent,
}

/// Classify an error by errno when available, falling back to its textual
/// form. A missing error is transient: a wakeup with nothing to read.
pub fn classify(err: Option<&io::Error>) -> ErrorCategory {
    let Some(err) = err else {
        return ErrorCategory::Transient;
    };

    if let Some(code) = err.raw_os_error() {
        match code {
            libc::EAGAIN | libc::EINTR => return ErrorCategory::Transient,
            libc::EACCES | libc::EPERM => return ErrorCategory::Permanent,
            _ => {}
        }
    }

    let text = err.to_string().to_lowercase();
    if ["eagain", "temporary", "eof", "closed"]
        .iter()
        .any(|needle| text.contains(needle))
    {
        ErrorCategory::Transient
    } else if ["permission", "denied"]
        .iter()
        .any(|needle| text.contains(needle))
    {
        ErrorCategory::Permanent
    } else {
        ErrorCategory::Recoverable
    }
}

/// Errors in the last `window`, counted in evenly-spaced buckets. Buckets
/// older than the window are zeroed on access, so an idle period costs
/// nothing.
pub struct ErrorWindow {
    counts: Vec<u64>,
    epochs: Vec<u64>,
    bucket_len: Duration,
    buckets: u64,
    origin: Instant,
}

pub const DEFAULT_ERROR_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_ERROR_BUCKETS: usize = 10;

impl ErrorWindow {
    pub fn new(window: Duration, buckets: usize) -> Self {
        let window = if window.is_zero() {
            DEFAULT_ERROR_WINDOW
        } else {
            window
        };
        let buckets = buckets.max(1);
        Self {
            counts: vec![0; buckets],
            epochs: vec![0; buckets],
            bucket_len: window / buckets as u32,
            buckets: buckets as u64,
            origin: Instant::now(),
        }
    }

    fn epoch(&self) -> u64 {
        (self.origin.elapsed().as_nanos() / self.bucket_len.as_nanos().max(1)) as u64
    }

    pub fn add_error(&mut self) {
        let epoch = self.epoch();
        let slot = (epoch % self.buckets) as usize;
        if self.epochs[slot] != epoch {
            self.counts[slot] = 0;
            self.epochs[slot] = epoch;
        }
        self.counts[slot] += 1;
    }

    /// Errors recorded within the window ending now.
    pub fn rate(&mut self) -> u64 {
        let epoch = self.epoch();
        let oldest = epoch.saturating_sub(self.buckets - 1);
        let mut total = 0;
        for slot in 0..self.counts.len() {
            if self.epochs[slot] < oldest {
                self.counts[slot] = 0;
            } else {
                total += self.counts[slot];
            }
        }
        total
    }
}

impl Default for ErrorWindow {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_WINDOW, DEFAULT_ERROR_BUCKETS)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

pub const DEFAULT_BREAKER_THRESHOLD: u32 = 100;
pub const DEFAULT_BREAKER_TIMEOUT: Duration = Duration::from_secs(30);
const HALF_OPEN_SUCCESSES: u32 = 3;

/// Three-state breaker guarding the error-handling path of the ingest loop.
///
/// Closed -> Open after `threshold` consecutive failures or any permanent
/// failure; Open -> HalfOpen once `timeout` has elapsed since the last
/// failure; HalfOpen -> Closed after three consecutive successes and back to
/// Open on any failure.
pub struct CircuitBreaker {
    state: BreakerState,
    threshold: u32,
    timeout: Duration,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
    enabled: bool,
    opens: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration, enabled: bool) -> Self {
        Self {
            state: BreakerState::Closed,
            threshold: threshold.max(1),
            timeout,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_failure: None,
            enabled,
            opens: 0,
        }
    }

    pub fn state(&mut self) -> BreakerState {
        self.maybe_half_open();
        self.state
    }

    pub fn can_proceed(&mut self) -> bool {
        if !self.enabled {
            return true;
        }
        self.maybe_half_open();
        !matches!(self.state, BreakerState::Open)
    }

    pub fn record_failure(&mut self, category: ErrorCategory) {
        if !self.enabled {
            return;
        }
        self.maybe_half_open();
        self.last_failure = Some(Instant::now());
        self.half_open_successes = 0;
        match self.state {
            BreakerState::HalfOpen => self.open(),
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if category == ErrorCategory::Permanent
                    || self.consecutive_failures >= self.threshold
                {
                    self.open();
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_success(&mut self) {
        if !self.enabled {
            return;
        }
        self.maybe_half_open();
        self.consecutive_failures = 0;
        if self.state == BreakerState::HalfOpen {
            self.half_open_successes += 1;
            if self.half_open_successes >= HALF_OPEN_SUCCESSES {
                self.state = BreakerState::Closed;
                self.half_open_successes = 0;
            }
        }
    }

    /// Times opened, for metrics.
    pub fn opens(&self) -> u64 {
        self.opens
    }

    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.consecutive_failures = 0;
        self.opens += 1;
    }

    fn maybe_half_open(&mut self) {
        if self.state == BreakerState::Open
            && self
                .last_failure
                .is_none_or(|at| at.elapsed() >= self.timeout)
        {
            self.state = BreakerState::HalfOpen;
            self.half_open_successes = 0;
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_BREAKER_THRESHOLD, DEFAULT_BREAKER_TIMEOUT, true)
    }
}

const MAX_INTERVAL_MULTIPLIER: u32 = 64;

/// Keeps error logging from flooding: enforces a minimum interval between
/// log lines, and doubles that interval every second consecutive error up to
/// 64x (bounded by `max_interval`). A line that makes it through resets the
/// backoff.
pub struct LogRateLimiter {
    min_interval: Duration,
    max_interval: Duration,
    multiplier: u32,
    consecutive_errors: u64,
    last_log: Option<Instant>,
    enabled: bool,
}

impl LogRateLimiter {
    pub fn new(min_interval: Duration, max_interval: Duration, enabled: bool) -> Self {
        Self {
            min_interval,
            max_interval: max_interval.max(min_interval),
            multiplier: 1,
            consecutive_errors: 0,
            last_log: None,
            enabled,
        }
    }

    /// Called once per error that wants to log. Returns true when the caller
    /// should emit the line.
    pub fn should_log(&mut self) -> bool {
        if !self.enabled {
            return true;
        }
        self.consecutive_errors += 1;
        if self.consecutive_errors.is_multiple_of(2) {
            self.multiplier = (self.multiplier * 2).min(MAX_INTERVAL_MULTIPLIER);
        }
        let interval = (self.min_interval * self.multiplier).min(self.max_interval);
        let due = self.last_log.is_none_or(|at| at.elapsed() >= interval);
        if due {
            self.last_log = Some(Instant::now());
            self.multiplier = 1;
            self.consecutive_errors = 0;
        }
        due
    }
}
