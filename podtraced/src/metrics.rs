use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Global counters for the tracer daemon.
///
/// Counters are updated from the hot path so all fields are atomic; the
/// labelled error samples sit behind a mutex because they are written only
/// when an event carries a non-zero error code.
pub struct Metrics {
    pub events_total: AtomicU64,
    pub start_time: SystemTime,
    // Per-second tracking
    events_this_sec: AtomicU64,
    events_per_sec: AtomicU64,
    // Ingest path
    ring_read_errors: AtomicU64,
    event_drops: AtomicU64,
    parse_failures: AtomicU64,
    queue_drops: AtomicU64,
    // Caches
    name_cache_hits: AtomicU64,
    name_cache_misses: AtomicU64,
    path_cache_hits: AtomicU64,
    path_cache_misses: AtomicU64,
    // Alert pipeline
    alerts_submitted: AtomicU64,
    alerts_delivered: AtomicU64,
    alerts_retried: AtomicU64,
    alerts_failed: AtomicU64,
    alerts_deduplicated: AtomicU64,
    alerts_rate_limited: AtomicU64,
    alerts_severity_gated: AtomicU64,
    // Error control
    breaker_opens: AtomicU64,
    // Resource monitor: utilisation percent x100, one slot per resource type
    utilization_centi: [AtomicU64; 3],
    resource_alerts: AtomicU64,
    resource_event_drops: AtomicU64,
    // (event_type, error_code) samples from events that reported a failure
    error_samples: Mutex<HashMap<(u32, i32), u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            start_time: SystemTime::now(),
            events_this_sec: AtomicU64::new(0),
            events_per_sec: AtomicU64::new(0),
            ring_read_errors: AtomicU64::new(0),
            event_drops: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            queue_drops: AtomicU64::new(0),
            name_cache_hits: AtomicU64::new(0),
            name_cache_misses: AtomicU64::new(0),
            path_cache_hits: AtomicU64::new(0),
            path_cache_misses: AtomicU64::new(0),
            alerts_submitted: AtomicU64::new(0),
            alerts_delivered: AtomicU64::new(0),
            alerts_retried: AtomicU64::new(0),
            alerts_failed: AtomicU64::new(0),
            alerts_deduplicated: AtomicU64::new(0),
            alerts_rate_limited: AtomicU64::new(0),
            alerts_severity_gated: AtomicU64::new(0),
            breaker_opens: AtomicU64::new(0),
            utilization_centi: std::array::from_fn(|_| AtomicU64::new(0)),
            resource_alerts: AtomicU64::new(0),
            resource_event_drops: AtomicU64::new(0),
            error_samples: Mutex::new(HashMap::new()),
        }
    }

    /// Record a delivered event.
    pub fn record_event(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.events_this_sec.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once a second to refresh the events-per-second metric.
    pub fn rollup(&self) {
        let per_sec = self.events_this_sec.swap(0, Ordering::Relaxed);
        self.events_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn events_per_sec(&self) -> u64 {
        self.events_per_sec.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn inc_ring_read_error(&self) {
        self.ring_read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ring_read_errors(&self) -> u64 {
        self.ring_read_errors.load(Ordering::Relaxed)
    }

    pub fn inc_event_drop(&self) {
        self.event_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_drops(&self) -> u64 {
        self.event_drops.load(Ordering::Relaxed)
    }

    pub fn inc_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    pub fn inc_queue_drop(&self) {
        self.queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_drops(&self) -> u64 {
        self.queue_drops.load(Ordering::Relaxed)
    }

    pub fn inc_name_cache_hit(&self) {
        self.name_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_name_cache_miss(&self) {
        self.name_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn name_cache_hits(&self) -> u64 {
        self.name_cache_hits.load(Ordering::Relaxed)
    }

    pub fn name_cache_misses(&self) -> u64 {
        self.name_cache_misses.load(Ordering::Relaxed)
    }

    pub fn inc_path_cache_hit(&self) {
        self.path_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_path_cache_miss(&self) {
        self.path_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_alert_submitted(&self) {
        self.alerts_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alerts_submitted(&self) -> u64 {
        self.alerts_submitted.load(Ordering::Relaxed)
    }

    pub fn inc_alert_delivered(&self) {
        self.alerts_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alerts_delivered(&self) -> u64 {
        self.alerts_delivered.load(Ordering::Relaxed)
    }

    pub fn inc_alert_retried(&self) {
        self.alerts_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alerts_retried(&self) -> u64 {
        self.alerts_retried.load(Ordering::Relaxed)
    }

    pub fn inc_alert_failed(&self) {
        self.alerts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alerts_failed(&self) -> u64 {
        self.alerts_failed.load(Ordering::Relaxed)
    }

    pub fn inc_alert_deduplicated(&self) {
        self.alerts_deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alerts_deduplicated(&self) -> u64 {
        self.alerts_deduplicated.load(Ordering::Relaxed)
    }

    pub fn inc_alert_rate_limited(&self) {
        self.alerts_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alerts_rate_limited(&self) -> u64 {
        self.alerts_rate_limited.load(Ordering::Relaxed)
    }

    pub fn inc_alert_severity_gated(&self) {
        self.alerts_severity_gated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_breaker_open(&self) {
        self.breaker_opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn breaker_opens(&self) -> u64 {
        self.breaker_opens.load(Ordering::Relaxed)
    }

    /// Store a utilisation gauge as percent x100 for the given resource slot.
    pub fn set_utilization(&self, resource: u32, percent: f64) {
        if let Some(slot) = self.utilization_centi.get(resource as usize) {
            slot.store((percent * 100.0) as u64, Ordering::Relaxed);
        }
    }

    pub fn utilization(&self, resource: u32) -> f64 {
        self.utilization_centi
            .get(resource as usize)
            .map(|slot| slot.load(Ordering::Relaxed) as f64 / 100.0)
            .unwrap_or(0.0)
    }

    pub fn inc_resource_alert(&self) {
        self.resource_alerts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resource_alerts(&self) -> u64 {
        self.resource_alerts.load(Ordering::Relaxed)
    }

    pub fn inc_resource_event_drop(&self) {
        self.resource_event_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an `(event_type, error_code)` sample for an event that reported
    /// a failure.
    pub fn record_error_sample(&self, event_type: u32, error_code: i32) {
        if let Ok(mut samples) = self.error_samples.lock() {
            *samples.entry((event_type, error_code)).or_default() += 1;
        }
    }

    pub fn error_samples(&self) -> Vec<((u32, i32), u64)> {
        self.error_samples
            .lock()
            .map(|samples| samples.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_resets_per_second_counter() {
        let m = Metrics::new();
        for _ in 0..7 {
            m.record_event();
        }
        m.rollup();
        assert_eq!(m.events_per_sec(), 7);
        m.rollup();
        assert_eq!(m.events_per_sec(), 0);
        assert_eq!(m.events_total.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn error_samples_accumulate_per_label() {
        let m = Metrics::new();
        m.record_error_sample(3, -110);
        m.record_error_sample(3, -110);
        m.record_error_sample(5, -13);
        let mut samples = m.error_samples();
        samples.sort();
        assert_eq!(samples, vec![((3, -110), 2), ((5, -13), 1)]);
    }

    #[test]
    fn utilization_gauge_round_trips() {
        let m = Metrics::new();
        m.set_utilization(1, 87.25);
        assert!((m.utilization(1) - 87.25).abs() < 0.01);
        // Out-of-range slots read back as zero rather than panicking.
        m.set_utilization(9, 50.0);
        assert_eq!(m.utilization(9), 0.0);
    }
}
