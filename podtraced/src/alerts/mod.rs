//! Alert distribution: model, validation, deduplication, rate limiting and
//! fan-out with retry to the configured sinks.
//!
//! Diagnostics from this subsystem go through plain logging only; the
//! logger-to-pipeline bridge skips records originating under this module, so
//! a failing sink can never generate alerts about itself.

pub mod chat;
pub mod file;
pub mod siem;
pub mod webhook;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::config::AlertConfig;
use crate::metrics::Metrics;
use crate::validation::truncate_ellipsis;

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(300);
pub const DEFAULT_RATE_LIMIT: usize = 10;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

const MAX_TITLE: usize = 256;
const MAX_MESSAGE: usize = 1024;
const MAX_POD_NAME: usize = 256;
const MAX_NAMESPACE: usize = 256;
const MAX_SOURCE: usize = 128;
const MAX_ERROR_CODE: usize = 64;
const MAX_RECOMMENDATIONS: usize = 10;
const MAX_RECOMMENDATION_LEN: usize = 512;

/// Alert severity; total order `fatal > critical > warning > error`.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error = 1,
    Warning = 2,
    Critical = 3,
    Fatal = 4,
}

impl Severity {
    pub const fn rank(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Fatal => "fatal",
        }
    }

    /// Map a kernel-supplied alert level. Level 0 maps to `error`, not
    /// `warning`; the kernel side reserves 0 for "no band", so seeing it here
    /// means a malformed entry and the low rank keeps it quiet.
    pub const fn from_kernel_level(level: u8) -> Severity {
        match level {
            0 => Severity::Error,
            1 => Severity::Warning,
            2 => Severity::Critical,
            _ => Severity::Fatal,
        }
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "error" => Ok(Severity::Error),
            "warning" | "warn" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            "fatal" | "emergency" => Ok(Severity::Fatal),
            other => anyhow::bail!("unknown severity {other:?}"),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A required alert field failed validation; never retried.
#[derive(Debug)]
pub struct InvalidAlert(pub &'static str);

impl fmt::Display for InvalidAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid alert: {}", self.0)
    }
}

impl std::error::Error for InvalidAlert {}

static HOSTNAME: Lazy<Option<String>> =
    Lazy::new(|| hostname::get().ok().and_then(|h| h.into_string().ok()));

/// Inside a pod the hostname is the pod name, so it is the natural default
/// when configuration leaves the field empty.
pub fn default_pod_name() -> String {
    HOSTNAME.clone().unwrap_or_default()
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub pod_name: String,
    pub namespace: String,
    pub context: serde_json::Map<String, serde_json::Value>,
    pub error_code: String,
    pub recommendations: Vec<String>,
}

impl Alert {
    pub fn new(
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> Alert {
        Alert {
            severity,
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
            source: source.into(),
            pod_name: default_pod_name(),
            namespace: String::new(),
            context: serde_json::Map::new(),
            error_code: String::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn with_context(mut self, key: &str, value: serde_json::Value) -> Alert {
        self.context.insert(key.to_string(), value);
        self
    }

    /// Reject alerts missing a required field or carrying a zero timestamp.
    pub fn validate(&self) -> Result<(), InvalidAlert> {
        if self.title.is_empty() {
            return Err(InvalidAlert("empty title"));
        }
        if self.message.is_empty() {
            return Err(InvalidAlert("empty message"));
        }
        if self.source.is_empty() {
            return Err(InvalidAlert("empty source"));
        }
        if self.timestamp.timestamp() == 0 {
            return Err(InvalidAlert("zero timestamp"));
        }
        Ok(())
    }

    /// Enforce the field length bounds. Idempotent; truncation ends in the
    /// three-character ellipsis marker.
    pub fn sanitize(&mut self) {
        self.title = truncate_ellipsis(&self.title, MAX_TITLE);
        self.message = truncate_ellipsis(&self.message, MAX_MESSAGE);
        self.pod_name = truncate_ellipsis(&self.pod_name, MAX_POD_NAME);
        self.namespace = truncate_ellipsis(&self.namespace, MAX_NAMESPACE);
        self.source = truncate_ellipsis(&self.source, MAX_SOURCE);
        self.error_code = truncate_ellipsis(&self.error_code, MAX_ERROR_CODE);
        self.recommendations.truncate(MAX_RECOMMENDATIONS);
        for rec in &mut self.recommendations {
            *rec = truncate_ellipsis(rec, MAX_RECOMMENDATION_LEN);
        }
    }

    /// Identity for deduplication: 16 hex characters of SHA-256 over the
    /// identity fields. Deliberately short; the expected alert cardinality
    /// gains nothing from a longer key.
    pub fn dedup_key(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.severity.as_str(),
            self.source.as_str(),
            self.pod_name.as_str(),
            self.namespace.as_str(),
            self.title.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        let digest = hasher.finalize();
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// One delivery destination. Implementations must be cheap to share and do
/// their own wire formatting.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// True for errors that must not be retried: explicit cancellation and
/// elapsed deadlines.
fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<tokio::time::error::Elapsed>().is_some()
            || cause
                .downcast_ref::<reqwest::Error>()
                .is_some_and(|e| e.is_timeout())
    })
}

fn backoff_for(base: Duration, failed_attempt: u32) -> Duration {
    let shift = (failed_attempt.saturating_sub(1)).min(16);
    base.saturating_mul(1u32 << shift).min(MAX_BACKOFF)
}

/// Wraps a sink with validation, sanitisation and bounded retry.
pub struct RetrySender {
    sink: Arc<dyn AlertSink>,
    max_retries: u32,
    base_backoff: Duration,
    metrics: Arc<Metrics>,
}

impl RetrySender {
    pub fn new(
        sink: Arc<dyn AlertSink>,
        max_retries: u32,
        base_backoff: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sink,
            max_retries: max_retries.max(1),
            base_backoff,
            metrics,
        }
    }

    pub fn sink_name(&self) -> &'static str {
        self.sink.name()
    }

    /// Deliver with retry. The alert is validated and sanitised exactly once;
    /// every attempt sees the sanitised copy. Backoff between attempts is
    /// `min(base << (attempt - 1), 30 s)` and races the cancellation token.
    pub async fn send(&self, mut alert: Alert, cancel: &CancellationToken) -> anyhow::Result<()> {
        alert.validate()?;
        alert.sanitize();

        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            match self.sink.deliver(&alert).await {
                Ok(()) => {
                    self.metrics.inc_alert_delivered();
                    return Ok(());
                }
                Err(err) if is_cancellation(&err) => {
                    return Err(err.context("alert delivery cancelled"));
                }
                Err(err) => {
                    last_err = Some(err);
                }
            }

            if attempt < self.max_retries {
                self.metrics.inc_alert_retried();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        anyhow::bail!("alert delivery cancelled during backoff");
                    }
                    _ = tokio::time::sleep(backoff_for(self.base_backoff, attempt)) => {}
                }
            }
        }

        self.metrics.inc_alert_failed();
        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("sink rejected alert"))
            .context(format!(
                "{} delivery failed after {} attempts",
                self.sink.name(),
                self.max_retries
            )))
    }
}

/// Sliding one-minute admission window. A linear scan over the admitted
/// timestamps is plenty at the configured limits (tens per minute).
pub struct RateLimiter {
    admitted: Mutex<Vec<Instant>>,
    limit: usize,
}

impl RateLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            admitted: Mutex::new(Vec::new()),
            limit,
        }
    }

    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut admitted = self.admitted.lock().unwrap();
        admitted.retain(|at| now.duration_since(*at) < Duration::from_secs(60));
        if admitted.len() < self.limit {
            admitted.push(now);
            true
        } else {
            false
        }
    }
}

/// Suppresses repeats of the same dedup key within the window.
pub struct Deduper {
    sent: Mutex<HashMap<String, Instant>>,
    window: Duration,
}

impl Deduper {
    pub fn new(window: Duration) -> Self {
        let window = if window.is_zero() {
            DEFAULT_DEDUP_WINDOW
        } else {
            window
        };
        Self {
            sent: Mutex::new(HashMap::new()),
            window,
        }
    }

    pub fn should_send(&self, key: &str) -> bool {
        let mut sent = self.sent.lock().unwrap();
        if sent.get(key).is_some_and(|at| at.elapsed() <= self.window) {
            return false;
        }
        sent.insert(key.to_string(), Instant::now());
        true
    }

    /// Hourly sweep; entries older than twice the window can never suppress
    /// anything again.
    pub fn cleanup(&self) {
        let horizon = self.window * 2;
        self.sent
            .lock()
            .unwrap()
            .retain(|_, at| at.elapsed() <= horizon);
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fan-in/fan-out hub: every alert passes the enabled gate, the severity
/// floor, the rate limiter and the deduper before one bounded delivery task
/// is spawned per sink. The gates always run before any spawn.
pub struct AlertPipeline {
    enabled: bool,
    min_severity: Severity,
    limiter: RateLimiter,
    deduper: Deduper,
    senders: RwLock<Vec<Arc<RetrySender>>>,
    http_timeout: Duration,
    handle: tokio::runtime::Handle,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl AlertPipeline {
    /// Build the pipeline and its sinks from configuration. Must be called
    /// from within the runtime; delivery tasks are spawned on the current
    /// handle. Sink construction errors (bad URL, bad scheme) surface here
    /// and abort start-up.
    pub fn from_config(
        cfg: &AlertConfig,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<AlertPipeline>> {
        let http_timeout = Duration::from_secs(cfg.http_timeout_secs.max(1));
        let pipeline = AlertPipeline {
            enabled: cfg.enabled,
            min_severity: cfg.min_severity.parse().unwrap_or(Severity::Warning),
            limiter: RateLimiter::new(cfg.rate_limit),
            deduper: Deduper::new(Duration::from_secs(cfg.dedup_window_secs)),
            senders: RwLock::new(Vec::new()),
            http_timeout,
            handle: tokio::runtime::Handle::current(),
            cancel,
            metrics: Arc::clone(&metrics),
        };

        if let Some(url) = cfg.webhook_url.as_deref() {
            let sink = webhook::WebhookSink::new(url, http_timeout, cfg.max_payload_size)
                .context("webhook sink")?;
            pipeline.register_sink(Arc::new(sink), cfg.max_retries);
        }
        if let Some(url) = cfg.chat_webhook_url.as_deref() {
            let sink = chat::ChatSink::new(url, &cfg.chat_channel, http_timeout)
                .context("chat sink")?;
            pipeline.register_sink(Arc::new(sink), cfg.max_retries);
        }
        if cfg.siem_enabled {
            let endpoint = cfg
                .siem_endpoint
                .as_deref()
                .context("SIEM enabled but no endpoint configured")?;
            let token = cfg
                .siem_token
                .as_deref()
                .context("SIEM enabled but no token configured")?;
            let sink =
                siem::SiemSink::new(endpoint, token, http_timeout).context("siem sink")?;
            pipeline.register_sink(Arc::new(sink), cfg.max_retries);
        }
        if let Some(path) = cfg.alerts_file.as_deref() {
            pipeline.register_sink(Arc::new(file::FileSink::new(path)), cfg.max_retries);
        }

        Ok(Arc::new(pipeline))
    }

    pub fn register_sink(&self, sink: Arc<dyn AlertSink>, max_retries: u32) {
        let sender = Arc::new(RetrySender::new(
            sink,
            max_retries,
            DEFAULT_BACKOFF_BASE,
            Arc::clone(&self.metrics),
        ));
        self.senders.write().unwrap().push(sender);
    }

    pub fn sink_count(&self) -> usize {
        self.senders.read().unwrap().len()
    }

    /// Submit an alert. Returns true when it cleared every gate and delivery
    /// tasks were dispatched; each stage short-circuits on rejection.
    pub fn submit(&self, alert: Alert) -> bool {
        if !self.enabled {
            return false;
        }
        self.metrics.inc_alert_submitted();
        if alert.severity < self.min_severity {
            self.metrics.inc_alert_severity_gated();
            return false;
        }
        if !self.limiter.allow() {
            self.metrics.inc_alert_rate_limited();
            log::debug!("alert {:?} dropped by rate limiter", alert.title);
            return false;
        }
        if !self.deduper.should_send(&alert.dedup_key()) {
            self.metrics.inc_alert_deduplicated();
            return false;
        }

        let senders: Vec<Arc<RetrySender>> = self.senders.read().unwrap().clone();
        let deadline = self.http_timeout * 2;
        for sender in senders {
            let alert = alert.clone();
            let cancel = self.cancel.clone();
            self.handle.spawn(async move {
                match tokio::time::timeout(deadline, sender.send(alert, &cancel)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        log::warn!("{} sink failed: {err:#}", sender.sink_name());
                    }
                    Err(_) => {
                        log::warn!(
                            "{} sink exceeded the delivery deadline",
                            sender.sink_name()
                        );
                    }
                }
            });
        }
        true
    }

    /// Periodic dedup-map sweep, driven by the orchestrator.
    pub fn dedup_cleanup(&self) {
        self.deduper.cleanup();
    }
}

static GLOBAL_PIPELINE: Lazy<RwLock<Option<Arc<AlertPipeline>>>> =
    Lazy::new(|| RwLock::new(None));

/// Install the process-wide pipeline handle consumed by the logger bridge.
pub fn init_global(pipeline: Arc<AlertPipeline>) {
    let mut slot = GLOBAL_PIPELINE.write().unwrap();
    if slot.is_some() {
        log::warn!("global alert pipeline already initialised; replacing");
    }
    *slot = Some(pipeline);
}

/// Swap the global handle, returning the previous one.
pub fn replace_global(pipeline: Option<Arc<AlertPipeline>>) -> Option<Arc<AlertPipeline>> {
    std::mem::replace(&mut *GLOBAL_PIPELINE.write().unwrap(), pipeline)
}

pub fn global() -> Option<Arc<AlertPipeline>> {
    GLOBAL_PIPELINE.read().unwrap().clone()
}
