//! Ring-buffer ingest loop.
//!
//! One dedicated blocking task reads fixed-layout records off the kernel
//! ring, parses and enriches them, filters to the monitored cgroup and hands
//! them to the bounded output queue. Read errors never kill the loop: they
//! are classified, counted in the sliding window and logged through the
//! adaptive limiter, with the circuit breaker cutting that work off entirely
//! when the ring is persistently unhealthy.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use podtrace_ebpf_common::{DISCONNECTED_TARGET, MAX_STACK_DEPTH};

use crate::cache::{PathCache, ProcessNameCache};
use crate::critical_path::CriticalPathAnalyzer;
use crate::errors::{CircuitBreaker, ErrorWindow, LogRateLimiter, classify};
use crate::event::TraceEvent;
use crate::metrics::Metrics;
use crate::probes::{CgroupFilter, RingRead, RingReader, StackTable};

/// Read-error rate (per sliding window) above which failures log at warn
/// instead of error: at that volume the interesting signal is the rate, not
/// each instance.
pub const HIGH_ERROR_THRESHOLD: u64 = 100;

const LOG_MIN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
const LOG_MAX_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

pub struct Ingestor {
    name_cache: Arc<ProcessNameCache>,
    path_cache: Arc<PathCache>,
    stack_table: Option<Arc<dyn StackTable>>,
    filter: Arc<dyn CgroupFilter>,
    analyzer: Option<Arc<CriticalPathAnalyzer>>,
    out: mpsc::Sender<TraceEvent>,
    metrics: Arc<Metrics>,
    breaker: CircuitBreaker,
    window: ErrorWindow,
    log_limiter: LogRateLimiter,
    cancel: CancellationToken,
}

impl Ingestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name_cache: Arc<ProcessNameCache>,
        path_cache: Arc<PathCache>,
        stack_table: Option<Arc<dyn StackTable>>,
        filter: Arc<dyn CgroupFilter>,
        analyzer: Option<Arc<CriticalPathAnalyzer>>,
        out: mpsc::Sender<TraceEvent>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
        circuit_breaker_enabled: bool,
        error_backoff_enabled: bool,
    ) -> Ingestor {
        Ingestor {
            name_cache,
            path_cache,
            stack_table,
            filter,
            analyzer,
            out,
            metrics,
            breaker: CircuitBreaker::new(
                crate::errors::DEFAULT_BREAKER_THRESHOLD,
                crate::errors::DEFAULT_BREAKER_TIMEOUT,
                circuit_breaker_enabled,
            ),
            window: ErrorWindow::default(),
            log_limiter: LogRateLimiter::new(
                LOG_MIN_INTERVAL,
                LOG_MAX_INTERVAL,
                error_backoff_enabled,
            ),
            cancel,
        }
    }

    /// Consume the ring until it closes or the token cancels. Blocking; run
    /// on `tokio::task::spawn_blocking`. The orchestrator unblocks a stuck
    /// read by closing the ring handle.
    pub fn run(mut self, mut ring: Box<dyn RingReader>) {
        log::info!("ring ingest loop started");
        while !self.cancel.is_cancelled() {
            match ring.read() {
                Ok(RingRead::Closed) => break,
                Ok(RingRead::Record(record)) => {
                    self.breaker.record_success();
                    self.handle_record(&record);
                }
                Err(err) => self.on_read_error(err),
            }
        }
        log::info!("ring ingest loop stopped");
    }

    fn on_read_error(&mut self, err: io::Error) {
        self.metrics.inc_ring_read_error();
        self.metrics.inc_event_drop();
        if !self.breaker.can_proceed() {
            return;
        }

        let opens_before = self.breaker.opens();
        self.breaker.record_failure(classify(Some(&err)));
        if self.breaker.opens() > opens_before {
            self.metrics.inc_breaker_open();
            log::warn!("ring read circuit breaker opened");
        }

        self.window.add_error();
        let rate = self.window.rate();
        if self.log_limiter.should_log() {
            if rate > HIGH_ERROR_THRESHOLD {
                log::warn!("ring read errors elevated ({rate} in window): {err}");
            } else {
                log::error!("ring read failed: {err}");
            }
        }
    }

    fn handle_record(&mut self, record: &Bytes) {
        let Some(mut event) = TraceEvent::parse(record) else {
            self.metrics.inc_parse_failure();
            return;
        };

        if event.stack_key != 0
            && let Some(table) = &self.stack_table
            && let Some(mut stack) = table.lookup(event.stack_key)
        {
            // The kernel table is lossy; a missing key just means no stack.
            stack.truncate(MAX_STACK_DEPTH);
            event.stack = stack;
        }

        event.process_name = self.name_cache.resolve(event.pid);

        if !event.target.is_empty() && event.target != DISCONNECTED_TARGET {
            let key = format!("{}:{}", event.pid, event.target);
            let enriched = self
                .path_cache
                .get_or_insert_with(&key, || canonical_target(&event.target));
            event.enriched_target = enriched;
        }

        if event.error_code != 0 {
            self.metrics
                .record_error_sample(event.kind as u32, event.error_code);
        }

        // Not a member of the monitored cgroup: out of scope by design, so
        // no drop metric either.
        if !self.filter.contains(event.pid) {
            return;
        }

        // Cancellation between read and dispatch releases the event here.
        if self.cancel.is_cancelled() {
            return;
        }

        if let Some(analyzer) = &self.analyzer {
            analyzer.feed(&event);
        }

        match self.out.try_send(event) {
            Ok(()) => self.metrics.record_event(),
            Err(mpsc::error::TrySendError::Full(_)) => self.metrics.inc_queue_drop(),
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Lexical canonicalisation of a target string. Paths lose duplicate and
/// `.` segments; dotted hostnames are lowercased with the trailing root dot
/// removed. Anything else (SQL fragments, method names) passes through.
pub fn canonical_target(target: &str) -> String {
    let target = target.trim();
    if target.starts_with('/') {
        let mut out = String::with_capacity(target.len());
        for segment in target.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }
            out.push('/');
            out.push_str(segment);
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    } else if target.contains('.') && !target.contains(char::is_whitespace) {
        target.trim_end_matches('.').to_ascii_lowercase()
    } else {
        target.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_CACHE_TTL;
    use crate::probes::{AllowAllFilter, LoopbackProducer, LoopbackRing};
    use podtrace_ebpf_common::{EventKind, RawEventV2};

    fn record(pid: u32, kind: EventKind) -> Bytes {
        let mut raw = RawEventV2::zeroed();
        raw.timestamp_ns = 1;
        raw.pid = pid;
        raw.kind = kind as u32;
        Bytes::copy_from_slice(bytemuck::bytes_of(&raw))
    }

    fn record_with(pid: u32, kind: EventKind, edit: impl FnOnce(&mut RawEventV2)) -> Bytes {
        let mut raw = RawEventV2::zeroed();
        raw.timestamp_ns = 1;
        raw.pid = pid;
        raw.kind = kind as u32;
        edit(&mut raw);
        Bytes::copy_from_slice(bytemuck::bytes_of(&raw))
    }

    struct Rig {
        producer: LoopbackProducer,
        rx: mpsc::Receiver<TraceEvent>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
        worker: std::thread::JoinHandle<()>,
        _proc_dir: tempfile::TempDir,
    }

    fn rig_with(
        queue: usize,
        filter: Arc<dyn CgroupFilter>,
        stack_table: Option<Arc<dyn StackTable>>,
    ) -> Rig {
        rig_full(queue, filter, stack_table, None)
    }

    fn rig_full(
        queue: usize,
        filter: Arc<dyn CgroupFilter>,
        stack_table: Option<Arc<dyn StackTable>>,
        analyzer: Option<Arc<CriticalPathAnalyzer>>,
    ) -> Rig {
        let proc_dir = tempfile::tempdir().unwrap();
        let pid_dir = proc_dir.path().join("42");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("comm"), "worker\n").unwrap();

        let metrics = Arc::new(Metrics::new());
        let name_cache = Arc::new(ProcessNameCache::new(
            64,
            DEFAULT_CACHE_TTL,
            proc_dir.path(),
            Arc::clone(&metrics),
        ));
        let path_cache = Arc::new(PathCache::new(DEFAULT_CACHE_TTL, Arc::clone(&metrics)));
        let (tx, rx) = mpsc::channel(queue);
        let cancel = CancellationToken::new();
        let ingestor = Ingestor::new(
            name_cache,
            path_cache,
            stack_table,
            filter,
            analyzer,
            tx,
            Arc::clone(&metrics),
            cancel.clone(),
            true,
            true,
        );

        let (producer, ring) = LoopbackRing::channel();
        let worker = std::thread::spawn(move || ingestor.run(Box::new(ring)));
        Rig {
            producer,
            rx,
            metrics,
            cancel,
            worker,
            _proc_dir: proc_dir,
        }
    }

    fn rig(queue: usize) -> Rig {
        rig_with(queue, Arc::new(AllowAllFilter), None)
    }

    #[test]
    fn parses_enriches_and_delivers() {
        let mut rig = rig(8);
        rig.producer.push(record_with(42, EventKind::Open, |raw| {
            raw.target[..10].copy_from_slice(b"/var//log\0");
        }));

        let event = rig.rx.blocking_recv().expect("event delivered");
        assert_eq!(event.pid, 42);
        assert_eq!(event.kind, EventKind::Open);
        assert_eq!(event.process_name, "worker");
        assert_eq!(event.enriched_target.as_deref(), Some("/var/log"));
        assert_eq!(rig.metrics.events_total.load(std::sync::atomic::Ordering::Relaxed), 1);

        drop(rig.producer);
        rig.worker.join().unwrap();
    }

    #[test]
    fn survives_sustained_read_errors() {
        let mut rig = rig(8);
        for _ in 0..200 {
            rig.producer
                .fail(io::Error::other("map lookup fault"));
        }
        rig.producer.push(record(42, EventKind::Read));

        let event = rig.rx.blocking_recv().expect("loop still alive");
        assert_eq!(event.pid, 42);
        assert_eq!(rig.metrics.event_drops(), 200, "one drop per error");
        assert_eq!(rig.metrics.ring_read_errors(), 200);
        assert_eq!(rig.metrics.breaker_opens(), 1);

        drop(rig.producer);
        rig.worker.join().unwrap();
    }

    #[test]
    fn short_records_count_as_parse_failures() {
        let rig = rig(8);
        rig.producer.push(Bytes::from_static(&[0u8; 16]));
        rig.producer.push(record(42, EventKind::Read));

        let mut rx = rig.rx;
        rx.blocking_recv().expect("valid record still flows");
        assert_eq!(rig.metrics.parse_failures(), 1);

        drop(rig.producer);
        rig.worker.join().unwrap();
    }

    struct DenyAll;
    impl CgroupFilter for DenyAll {
        fn contains(&self, _pid: u32) -> bool {
            false
        }
    }

    #[test]
    fn out_of_cgroup_events_are_dropped_silently() {
        let mut rig = rig_with(8, Arc::new(DenyAll), None);
        rig.producer.push(record(42, EventKind::Read));
        drop(rig.producer);
        rig.worker.join().unwrap();

        assert!(rig.rx.try_recv().is_err());
        assert_eq!(rig.metrics.event_drops(), 0, "membership drops are unmetered");
        assert_eq!(rig.metrics.queue_drops(), 0);
    }

    #[test]
    fn full_queue_drops_newest() {
        let rig = rig(1);
        rig.producer.push(record(42, EventKind::Read));
        rig.producer.push(record(42, EventKind::Write));
        drop(rig.producer);
        rig.worker.join().unwrap();

        assert_eq!(rig.metrics.queue_drops(), 1);
        let mut rx = rig.rx;
        let first = rx.blocking_recv().unwrap();
        assert_eq!(first.kind, EventKind::Read, "oldest survives");
        assert!(rx.blocking_recv().is_none());
    }

    struct FixedStacks;
    impl StackTable for FixedStacks {
        fn lookup(&self, stack_key: u64) -> Option<Vec<u64>> {
            (stack_key == 7).then(|| (0..100u64).collect())
        }
    }

    #[test]
    fn stacks_resolve_and_truncate() {
        let mut rig = rig_with(8, Arc::new(AllowAllFilter), Some(Arc::new(FixedStacks)));
        rig.producer
            .push(record_with(42, EventKind::LockContention, |raw| {
                raw.stack_key = 7;
            }));
        rig.producer
            .push(record_with(42, EventKind::LockContention, |raw| {
                raw.stack_key = 9; // missing from the table: not an error
            }));

        let with_stack = rig.rx.blocking_recv().unwrap();
        assert_eq!(with_stack.stack.len(), MAX_STACK_DEPTH);
        let without = rig.rx.blocking_recv().unwrap();
        assert!(without.stack.is_empty());

        drop(rig.producer);
        rig.worker.join().unwrap();
    }

    #[test]
    fn error_codes_feed_metric_samples() {
        let mut rig = rig(8);
        rig.producer.push(record_with(42, EventKind::Connect, |raw| {
            raw.error_code = -111;
        }));
        rig.rx.blocking_recv().unwrap();
        assert_eq!(
            rig.metrics.error_samples(),
            vec![((EventKind::Connect as u32, -111), 1)]
        );

        drop(rig.producer);
        rig.worker.join().unwrap();
    }

    #[test]
    fn disconnected_sentinel_skips_path_cache() {
        let mut rig = rig(8);
        rig.producer.push(record_with(42, EventKind::TcpSend, |raw| {
            let sentinel = DISCONNECTED_TARGET.as_bytes();
            raw.target[..sentinel.len()].copy_from_slice(sentinel);
        }));
        let event = rig.rx.blocking_recv().unwrap();
        assert!(event.enriched_target.is_none());

        drop(rig.producer);
        rig.worker.join().unwrap();
    }

    #[test]
    fn cancellation_stops_the_loop() {
        let rig = rig(8);
        rig.cancel.cancel();
        // close() sends a wakeup error so a blocked read returns.
        use crate::probes::RingHandle;
        rig.producer.close();
        rig.worker.join().unwrap();
    }

    #[test]
    fn latency_events_reach_the_analyzer() {
        let paths = Arc::new(std::sync::Mutex::new(Vec::new()));
        let paths_clone = Arc::clone(&paths);
        let analyzer = Arc::new(CriticalPathAnalyzer::new(
            std::time::Duration::from_secs(5),
            Box::new(move |path| paths_clone.lock().unwrap().push(path)),
        ));

        let mut rig = rig_full(8, Arc::new(AllowAllFilter), None, Some(analyzer));
        rig.producer.push(record_with(42, EventKind::DbQuery, |raw| {
            raw.latency_ns = 3_000_000;
        }));
        rig.producer.push(record_with(42, EventKind::HttpResp, |raw| {
            raw.latency_ns = 1_000_000;
        }));

        rig.rx.blocking_recv().unwrap();
        rig.rx.blocking_recv().unwrap();
        drop(rig.producer);
        rig.worker.join().unwrap();

        let paths = paths.lock().unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].pid, 42);
        assert_eq!(paths[0].total_latency_ns, 4_000_000);
    }

    #[test]
    fn canonical_target_rules() {
        assert_eq!(canonical_target("/var//log/./app.log"), "/var/log/app.log");
        assert_eq!(canonical_target("//"), "/");
        assert_eq!(canonical_target("API.Example.COM."), "api.example.com");
        assert_eq!(canonical_target("SELECT * FROM t"), "SELECT * FROM t");
        assert_eq!(canonical_target("orders-db:5432"), "orders-db:5432");
    }

    #[test]
    fn proc_filter_is_honoured() {
        let proc_dir = tempfile::tempdir().unwrap();
        let pid_dir = proc_dir.path().join("42");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("cgroup"), "0::/otherpod\n").unwrap();

        let filter = crate::probes::ProcCgroupFilter::new(proc_dir.path(), "mypod");
        let mut rig = rig_with(8, Arc::new(filter), None);
        rig.producer.push(record(42, EventKind::Read));
        drop(rig.producer);
        rig.worker.join().unwrap();
        assert!(rig.rx.try_recv().is_err());
    }
}
