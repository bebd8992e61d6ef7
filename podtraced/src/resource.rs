//! Cgroup resource monitor.
//!
//! Polls the pod's cgroup directory (v1 or v2 layout) for CPU, memory and IO
//! limits and usage, computes utilisation, publishes gauges, raises alerts on
//! band crossings and emits a synthetic event so downstream consumers see
//! throttling next to the traffic that caused it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use podtrace_ebpf_common::{EventKind, alert_level, resource_id};

use crate::alerts::{Alert, AlertPipeline, Severity};
use crate::event::TraceEvent;
use crate::metrics::Metrics;
use crate::probes::{AlertLevelMap, cgroup_inode};

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Memory limit files report this when the cgroup is unconstrained.
const UNLIMITED: u64 = u64::MAX;
/// v1 memory hierarchies report "no limit" as a page-rounded i64::MAX.
const V1_MEMORY_UNLIMITED_FLOOR: u64 = 0x7FFF_FFFF_FFFF_F000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cpu,
    Memory,
    Io,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Cpu, ResourceKind::Memory, ResourceKind::Io];

    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Io => "io",
        }
    }

    pub const fn id(self) -> u32 {
        match self {
            ResourceKind::Cpu => resource_id::CPU,
            ResourceKind::Memory => resource_id::MEMORY,
            ResourceKind::Io => resource_id::IO,
        }
    }

    /// Rate-based resources compare a usage delta against the limit; memory
    /// compares the instantaneous value.
    const fn is_rate(self) -> bool {
        !matches!(self, ResourceKind::Memory)
    }
}

/// One record per resource type: the configured limit and the last usage
/// sample.
#[derive(Copy, Clone, Debug, Default)]
pub struct ResourceLimit {
    pub limit_bytes: u64,
    pub usage_bytes: u64,
    pub last_update_ns: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CgroupVersion {
    V1,
    V2,
}

/// Utilisation band thresholds in percent.
pub fn alert_band(utilization: f64) -> u8 {
    if utilization >= 95.0 {
        alert_level::EMERGENCY
    } else if utilization >= 90.0 {
        alert_level::CRITICAL
    } else if utilization >= 80.0 {
        alert_level::WARNING
    } else {
        alert_level::NONE
    }
}

fn band_threshold(band: u8) -> u8 {
    match band {
        alert_level::EMERGENCY => 95,
        alert_level::CRITICAL => 90,
        alert_level::WARNING => 80,
        _ => 0,
    }
}

fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

pub struct ResourceMonitor {
    cgroup_base: PathBuf,
    cgroup_rel: String,
    cgroup_inode: u64,
    pod_name: String,
    namespace: String,
    interval: Duration,
    limits: Mutex<HashMap<ResourceKind, ResourceLimit>>,
    prev_usage: Mutex<HashMap<ResourceKind, (u64, Instant)>>,
    pipeline: Arc<AlertPipeline>,
    events: mpsc::Sender<TraceEvent>,
    alert_map: Option<Arc<dyn AlertLevelMap>>,
    metrics: Arc<Metrics>,
}

impl ResourceMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cgroup_base: impl Into<PathBuf>,
        cgroup_rel: impl Into<String>,
        pod_name: String,
        namespace: String,
        interval: Duration,
        pipeline: Arc<AlertPipeline>,
        events: mpsc::Sender<TraceEvent>,
        alert_map: Option<Arc<dyn AlertLevelMap>>,
        metrics: Arc<Metrics>,
    ) -> ResourceMonitor {
        let cgroup_base = cgroup_base.into();
        let cgroup_rel = cgroup_rel.into().trim_matches('/').to_string();
        let interval = if interval.is_zero() {
            DEFAULT_MONITOR_INTERVAL
        } else {
            interval
        };

        let v2_dir = cgroup_base.join(&cgroup_rel);
        let cgroup_inode = match cgroup_inode(&v2_dir) {
            Ok(inode) => inode,
            Err(err) => {
                log::warn!(
                    "cannot resolve cgroup inode for {}: {err}; kernel alert map disabled",
                    v2_dir.display()
                );
                0
            }
        };

        let monitor = ResourceMonitor {
            cgroup_base,
            cgroup_rel,
            cgroup_inode,
            pod_name,
            namespace,
            interval,
            limits: Mutex::new(HashMap::new()),
            prev_usage: Mutex::new(HashMap::new()),
            pipeline,
            events,
            alert_map,
            metrics,
        };
        monitor.read_limits();
        monitor
    }

    pub fn cgroup_inode(&self) -> u64 {
        self.cgroup_inode
    }

    pub fn limit(&self, kind: ResourceKind) -> Option<ResourceLimit> {
        self.limits.lock().unwrap().get(&kind).copied()
    }

    fn v2_dir(&self) -> PathBuf {
        self.cgroup_base.join(&self.cgroup_rel)
    }

    fn v1_dir(&self, controller: &str) -> PathBuf {
        self.cgroup_base.join(controller).join(&self.cgroup_rel)
    }

    fn detect_version(&self) -> anyhow::Result<CgroupVersion> {
        if self.v2_dir().join("cgroup.controllers").exists() {
            Ok(CgroupVersion::V2)
        } else if self.v1_dir("cpu").is_dir() || self.v1_dir("memory").is_dir() {
            Ok(CgroupVersion::V1)
        } else {
            anyhow::bail!(
                "no cgroup v1 or v2 layout for {:?} under {}",
                self.cgroup_rel,
                self.cgroup_base.display()
            )
        }
    }

    /// Read the configured limits, replacing the limit table. Unreadable
    /// files are not fatal; the affected resource simply has no record and
    /// is skipped by the sampler.
    pub fn read_limits(&self) {
        let version = match self.detect_version() {
            Ok(version) => version,
            Err(err) => {
                log::warn!("resource limits unavailable: {err}");
                return;
            }
        };
        let now_ns = unix_now_ns();
        let mut table = HashMap::new();
        for kind in ResourceKind::ALL {
            if let Some(limit_bytes) = self.read_limit(version, kind) {
                table.insert(
                    kind,
                    ResourceLimit {
                        limit_bytes,
                        usage_bytes: 0,
                        last_update_ns: now_ns,
                    },
                );
            }
        }
        log::info!(
            "cgroup {:?} ({version:?}): {} limited resource(s)",
            self.cgroup_rel,
            table.len()
        );
        *self.limits.lock().unwrap() = table;
    }

    /// Returns None for unlimited resources, which carry no record at all.
    fn read_limit(&self, version: CgroupVersion, kind: ResourceKind) -> Option<u64> {
        match (version, kind) {
            (CgroupVersion::V2, ResourceKind::Cpu) => {
                parse_cpu_max(&read(self.v2_dir().join("cpu.max"))?)
            }
            (CgroupVersion::V2, ResourceKind::Memory) => {
                parse_memory_max(&read(self.v2_dir().join("memory.max"))?)
            }
            (CgroupVersion::V2, ResourceKind::Io) => {
                parse_io_max(&read(self.v2_dir().join("io.max"))?)
            }
            (CgroupVersion::V1, ResourceKind::Cpu) => parse_v1_cpu_quota(
                &read(self.v1_dir("cpu").join("cpu.cfs_quota_us"))?,
                &read(self.v1_dir("cpu").join("cpu.cfs_period_us"))?,
            ),
            (CgroupVersion::V1, ResourceKind::Memory) => {
                parse_v1_memory_limit(&read(self.v1_dir("memory").join("memory.limit_in_bytes"))?)
            }
            (CgroupVersion::V1, ResourceKind::Io) => {
                let read_bps = read(self.v1_dir("blkio").join("blkio.throttle.read_bps_device"))
                    .and_then(|raw| parse_blkio_bps(&raw));
                let write_bps = read(self.v1_dir("blkio").join("blkio.throttle.write_bps_device"))
                    .and_then(|raw| parse_blkio_bps(&raw));
                match (read_bps, write_bps) {
                    (Some(r), Some(w)) => Some(r.max(w)),
                    (one, other) => one.or(other),
                }
            }
        }
    }

    fn read_usage(&self, version: CgroupVersion, kind: ResourceKind) -> Option<u64> {
        match (version, kind) {
            (CgroupVersion::V2, ResourceKind::Cpu) => {
                parse_cpu_stat_usage(&read(self.v2_dir().join("cpu.stat"))?)
            }
            (CgroupVersion::V2, ResourceKind::Memory) => {
                read(self.v2_dir().join("memory.current"))?.trim().parse().ok()
            }
            (CgroupVersion::V2, ResourceKind::Io) => {
                Some(parse_io_stat_usage(&read(self.v2_dir().join("io.stat"))?))
            }
            (CgroupVersion::V1, ResourceKind::Cpu) => {
                // cpuacct reports nanoseconds; the limit is usec-per-second.
                let ns: u64 = read(self.v1_dir("cpu").join("cpuacct.usage"))?
                    .trim()
                    .parse()
                    .ok()?;
                Some(ns / 1_000)
            }
            (CgroupVersion::V1, ResourceKind::Memory) => {
                read(self.v1_dir("memory").join("memory.usage_in_bytes"))?
                    .trim()
                    .parse()
                    .ok()
            }
            (CgroupVersion::V1, ResourceKind::Io) => Some(parse_blkio_service_bytes(&read(
                self.v1_dir("blkio").join("blkio.io_service_bytes"),
            )?)),
        }
    }

    /// Utilisation percent for the sample, or None when this is the first
    /// observation of a rate-based resource (no delta yet).
    fn utilization_for(&self, kind: ResourceKind, limit: u64, usage: u64) -> Option<f64> {
        if limit == 0 || limit == UNLIMITED {
            return None;
        }
        if !kind.is_rate() {
            return Some(((usage as f64) * 100.0 / limit as f64).min(100.0));
        }

        let now = Instant::now();
        let mut prev = self.prev_usage.lock().unwrap();
        let previous = prev.insert(kind, (usage, now));
        let (prev_usage, prev_at) = previous?;
        let elapsed = now.duration_since(prev_at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let delta = usage.saturating_sub(prev_usage) as f64;
        Some((delta * 100.0 / (limit as f64 * elapsed)).min(100.0))
    }

    /// One poll pass: read usage per limited resource, publish gauges, raise
    /// bands.
    pub fn sample(&self) {
        let version = match self.detect_version() {
            Ok(version) => version,
            Err(err) => {
                log::warn!("resource sample skipped: {err}");
                return;
            }
        };

        for kind in ResourceKind::ALL {
            let Some(record) = self.limit(kind) else {
                continue;
            };
            if record.limit_bytes == 0 || record.limit_bytes == UNLIMITED {
                continue;
            }
            let Some(usage) = self.read_usage(version, kind) else {
                continue;
            };

            {
                let mut table = self.limits.lock().unwrap();
                if let Some(entry) = table.get_mut(&kind) {
                    entry.usage_bytes = usage;
                    entry.last_update_ns = unix_now_ns();
                }
            }

            let Some(utilization) = self.utilization_for(kind, record.limit_bytes, usage) else {
                continue;
            };
            self.metrics.set_utilization(kind.id(), utilization);

            let band = alert_band(utilization);
            if band != alert_level::NONE {
                self.publish(kind, band, utilization, record.limit_bytes, usage);
            }
        }
    }

    fn publish(&self, kind: ResourceKind, band: u8, utilization: f64, limit: u64, usage: u64) {
        // Mirror the band into the kernel-side map first so the probes can
        // tag events from the throttled cgroup. Best effort.
        if let Some(map) = &self.alert_map
            && self.cgroup_inode != 0
            && let Err(err) = map.set_level(self.cgroup_inode, band)
        {
            log::warn!("kernel alert map update failed: {err:#}");
        }

        self.metrics.inc_resource_alert();
        self.pipeline
            .submit(self.compose_alert(kind, band, utilization, limit, usage));

        let event = self.synthetic_event(kind, utilization, limit, usage);
        if let Err(mpsc::error::TrySendError::Full(_)) = self.events.try_send(event) {
            self.metrics.inc_resource_event_drop();
            log::debug!("event queue full; resource event dropped");
        }
    }

    fn compose_alert(
        &self,
        kind: ResourceKind,
        band: u8,
        utilization: f64,
        limit: u64,
        usage: u64,
    ) -> Alert {
        let severity = Severity::from_kernel_level(band);
        let mut alert = Alert::new(
            severity,
            format!(
                "{} utilisation above {}%",
                kind.as_str(),
                band_threshold(band)
            ),
            format!(
                "{} usage is at {utilization:.1}% of the configured limit",
                kind.as_str()
            ),
            "resource_monitor",
        );
        if !self.pod_name.is_empty() {
            alert.pod_name = self.pod_name.clone();
        }
        alert.namespace = self.namespace.clone();
        alert.context.insert("resource".into(), kind.as_str().into());
        alert
            .context
            .insert("utilisation_percent".into(), format!("{utilization:.1}").into());
        alert.context.insert("limit".into(), limit.into());
        alert.context.insert("usage".into(), usage.into());
        alert
            .context
            .insert("cgroup".into(), self.cgroup_rel.clone().into());
        alert.recommendations = vec![
            "Check for resource leaks".to_string(),
            "Review resource limits".to_string(),
            "Consider scaling up pod resources".to_string(),
        ];
        if utilization >= 95.0 {
            alert
                .recommendations
                .push("Immediate action required — resource exhaustion imminent".to_string());
        }
        alert
    }

    fn synthetic_event(
        &self,
        kind: ResourceKind,
        utilization: f64,
        limit: u64,
        usage: u64,
    ) -> TraceEvent {
        let mut event = TraceEvent::synthetic(EventKind::ResourceLimit, unix_now_ns());
        event.cgroup_id = self.cgroup_inode;
        event.bytes = usage;
        event.tcp_state = kind.id();
        event.target = self.cgroup_rel.clone();
        event.details = format!(
            "{} util={utilization:.1}% usage={usage} limit={limit}",
            kind.as_str()
        );
        event
    }

    /// Poll until cancelled. The first tick fires immediately, which doubles
    /// as the post-construction usage baseline for rate resources.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        log::info!(
            "resource monitor started for {:?} every {:?}",
            self.cgroup_rel,
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sample(),
            }
        }
        log::info!("resource monitor stopped");
    }
}

fn read(path: PathBuf) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

/// `cpu.max` holds `"<quota> <period>"` or `"max"`. The limit is normalised
/// to microseconds of CPU per second of wall clock, comparable with the
/// `usage_usec` delta rate.
pub fn parse_cpu_max(raw: &str) -> Option<u64> {
    let mut parts = raw.split_whitespace();
    let quota = parts.next()?;
    if quota == "max" {
        return None;
    }
    let quota: u64 = quota.parse().ok()?;
    let period: u64 = parts.next().unwrap_or("100000").parse().ok()?;
    if period == 0 {
        return None;
    }
    Some(quota * 1_000_000 / period)
}

/// `memory.max` holds a byte count or `"max"`.
pub fn parse_memory_max(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw == "max" {
        return None;
    }
    raw.parse().ok()
}

/// `io.max` lines look like `"8:0 rbps=1048576 wbps=max riops=max wiops=max"`.
/// The larger of rbps/wbps wins; the maximum across devices is the limit.
pub fn parse_io_max(raw: &str) -> Option<u64> {
    let mut best: Option<u64> = None;
    for line in raw.lines() {
        for part in line.split_whitespace() {
            if let Some((key, value)) = part.split_once('=')
                && matches!(key, "rbps" | "wbps")
                && let Ok(bps) = value.parse::<u64>()
            {
                best = Some(best.map_or(bps, |b| b.max(bps)));
            }
        }
    }
    best
}

/// `usage_usec` field of `cpu.stat`.
pub fn parse_cpu_stat_usage(raw: &str) -> Option<u64> {
    raw.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        (parts.next() == Some("usage_usec"))
            .then(|| parts.next()?.parse().ok())
            .flatten()
    })
}

/// Sum of `rbytes` and `wbytes` across all devices in `io.stat`.
pub fn parse_io_stat_usage(raw: &str) -> u64 {
    let mut total = 0u64;
    for line in raw.lines() {
        for part in line.split_whitespace() {
            if let Some((key, value)) = part.split_once('=')
                && matches!(key, "rbytes" | "wbytes")
                && let Ok(bytes) = value.parse::<u64>()
            {
                total += bytes;
            }
        }
    }
    total
}

/// v1 quota/period pair; quota -1 means unlimited.
pub fn parse_v1_cpu_quota(quota_raw: &str, period_raw: &str) -> Option<u64> {
    let quota: i64 = quota_raw.trim().parse().ok()?;
    if quota <= 0 {
        return None;
    }
    let period: u64 = period_raw.trim().parse().ok()?;
    if period == 0 {
        return None;
    }
    Some(quota as u64 * 1_000_000 / period)
}

/// v1 memory limit; the kernel reports "unlimited" as a page-rounded huge
/// value rather than a sentinel string.
pub fn parse_v1_memory_limit(raw: &str) -> Option<u64> {
    let limit: u64 = raw.trim().parse().ok()?;
    (limit < V1_MEMORY_UNLIMITED_FLOOR).then_some(limit)
}

/// `blkio.throttle.*_bps_device` lines are `"MAJ:MIN <bps>"`; the largest
/// device limit wins.
pub fn parse_blkio_bps(raw: &str) -> Option<u64> {
    raw.lines()
        .filter_map(|line| line.split_whitespace().nth(1)?.parse().ok())
        .max()
}

/// Sum Read and Write rows of `blkio.io_service_bytes` across devices.
pub fn parse_blkio_service_bytes(raw: &str) -> u64 {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _device = parts.next()?;
            let op = parts.next()?;
            if matches!(op, "Read" | "Write") {
                parts.next()?.parse::<u64>().ok()
            } else {
                None
            }
        })
        .sum()
}
