use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/podtrace/podtrace.toml";
const ENV_CONFIG_PATH: &str = "PODTRACE_CONFIG";

/// Daemon configuration. Loaded from an optional TOML file, then overridden
/// by the environment surface; every field has a default so a bare container
/// can run with no file at all.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Config {
    /// Load configuration. The file path can be overridden with the
    /// `PODTRACE_CONFIG` environment variable; a missing or unparsable file
    /// falls back to defaults. Environment variables are applied last and
    /// win over the file.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        let mut config: Config = match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        };
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_bool("ALERTING_ENABLED") {
            self.alerts.enabled = v;
        }
        if let Some(v) = env_str("ALERT_WEBHOOK_URL") {
            self.alerts.webhook_url = Some(v);
        }
        if let Some(v) = env_str("ALERT_CHAT_WEBHOOK_URL") {
            self.alerts.chat_webhook_url = Some(v);
        }
        if let Some(v) = env_str("ALERT_CHAT_CHANNEL") {
            self.alerts.chat_channel = v;
        }
        if let Some(v) = env_bool("ALERT_SIEM_ENABLED") {
            self.alerts.siem_enabled = v;
        }
        if let Some(v) = env_str("SIEM_ENDPOINT") {
            self.alerts.siem_endpoint = Some(v);
        }
        if let Some(v) = env_str("SIEM_TOKEN") {
            self.alerts.siem_token = Some(v);
        }
        if let Some(v) = env_parse("ALERT_DEDUP_WINDOW") {
            self.alerts.dedup_window_secs = v;
        }
        if let Some(v) = env_parse("ALERT_RATE_LIMIT") {
            self.alerts.rate_limit = v;
        }
        if let Some(v) = env_parse("ALERT_HTTP_TIMEOUT") {
            self.alerts.http_timeout_secs = v;
        }
        if let Some(v) = env_parse("ALERT_MAX_RETRIES") {
            self.alerts.max_retries = v;
        }
        if let Some(v) = env_parse("ALERT_MAX_PAYLOAD_SIZE") {
            self.alerts.max_payload_size = v;
        }
        if let Some(v) = env_str("ALERT_MIN_SEVERITY") {
            self.alerts.min_severity = v;
        }
        if let Some(v) = env_parse("CACHE_MAX_SIZE") {
            self.cache.max_size = v;
        }
        if let Some(v) = env_parse("CACHE_TTL_SECONDS") {
            self.cache.ttl_seconds = v;
        }
        if let Some(v) = env_parse("EVENT_BUFFER_SIZE") {
            self.runtime.event_buffer_size = v;
        }
        if let Some(v) = env_bool("ERROR_BACKOFF_ENABLED") {
            self.runtime.error_backoff_enabled = v;
        }
        if let Some(v) = env_bool("CIRCUIT_BREAKER_ENABLED") {
            self.runtime.circuit_breaker_enabled = v;
        }
        if let Some(v) = env_str("CGROUP_BASE") {
            self.paths.cgroup_base = v;
        }
        if let Some(v) = env_str("PROC_BASE") {
            self.paths.proc_base = v;
        }
        // Downward-API identity, present in any normally-configured pod.
        if let Some(v) = env_str("POD_NAME") {
            self.monitor.pod_name = v;
        }
        if let Some(v) = env_str("POD_NAMESPACE") {
            self.monitor.namespace = v;
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = env_str(name)?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            log::warn!("ignoring {name}={other:?}: not a boolean");
            None
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_str(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {name}={raw:?}: unparsable value");
            None
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlertConfig {
    #[serde(default = "default_alerting_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub chat_webhook_url: Option<String>,
    #[serde(default)]
    pub chat_channel: String,
    #[serde(default)]
    pub siem_enabled: bool,
    #[serde(default)]
    pub siem_endpoint: Option<String>,
    #[serde(default)]
    pub siem_token: Option<String>,
    #[serde(default)]
    pub alerts_file: Option<String>,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    #[serde(default = "default_min_severity")]
    pub min_severity: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: default_alerting_enabled(),
            webhook_url: None,
            chat_webhook_url: None,
            chat_channel: String::new(),
            siem_enabled: false,
            siem_endpoint: None,
            siem_token: None,
            alerts_file: None,
            dedup_window_secs: default_dedup_window_secs(),
            rate_limit: default_rate_limit(),
            http_timeout_secs: default_http_timeout_secs(),
            max_retries: default_max_retries(),
            max_payload_size: default_max_payload_size(),
            min_severity: default_min_severity(),
        }
    }
}

fn default_alerting_enabled() -> bool {
    true
}
fn default_dedup_window_secs() -> u64 {
    300
}
fn default_rate_limit() -> usize {
    10
}
fn default_http_timeout_secs() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_payload_size() -> usize {
    1024 * 1024
}
fn default_min_severity() -> String {
    "warning".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_cache_max_size(),
            ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

fn default_cache_max_size() -> usize {
    10_000
}
fn default_cache_ttl_seconds() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
    #[serde(default = "default_error_backoff_enabled")]
    pub error_backoff_enabled: bool,
    #[serde(default = "default_circuit_breaker_enabled")]
    pub circuit_breaker_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer_size(),
            error_backoff_enabled: default_error_backoff_enabled(),
            circuit_breaker_enabled: default_circuit_breaker_enabled(),
        }
    }
}

fn default_event_buffer_size() -> usize {
    8192
}
fn default_error_backoff_enabled() -> bool {
    true
}
fn default_circuit_breaker_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Cgroup of the monitored pod, relative to the cgroup base
    /// (e.g. `kubepods/burstable/pod1234`). Empty disables the monitor and
    /// the membership filter.
    #[serde(default)]
    pub cgroup_path: String,
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub namespace: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cgroup_path: String::new(),
            interval_secs: default_monitor_interval_secs(),
            pod_name: String::new(),
            namespace: String::new(),
        }
    }
}

fn default_monitor_interval_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_cgroup_base")]
    pub cgroup_base: String,
    #[serde(default = "default_proc_base")]
    pub proc_base: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cgroup_base: default_cgroup_base(),
            proc_base: default_proc_base(),
        }
    }
}

fn default_cgroup_base() -> String {
    "/sys/fs/cgroup".to_string()
}
fn default_proc_base() -> String {
    "/proc".to_string()
}
