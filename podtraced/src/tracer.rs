//! Tracer orchestrator: owns start-up and shutdown of the probe set
//! consumers, the resource monitor and the periodic housekeeping ticks, and
//! hands the bounded event queue to whoever consumes it downstream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerts::AlertPipeline;
use crate::cache::{PathCache, ProcessNameCache};
use crate::config::Config;
use crate::critical_path::CriticalPathAnalyzer;
use crate::event::TraceEvent;
use crate::ingest::Ingestor;
use crate::metrics::Metrics;
use crate::probes::{
    AlertLevelMap, AllowAllFilter, CgroupFilter, LoopbackProducer, LoopbackRing, ProcCgroupFilter,
    RingHandle, RingReader, StackTable,
};
use crate::resource::ResourceMonitor;

/// Drain budget for graceful shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const ROLLUP_INTERVAL: Duration = Duration::from_secs(1);
const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);
const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const EVICT_INTERVAL: Duration = Duration::from_millis(250);
const DEDUP_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Everything the probe loader hands over: the ring reader plus the optional
/// kernel-side tables.
pub struct ProbeSet {
    pub ring: Box<dyn RingReader>,
    pub ring_handle: Arc<dyn RingHandle>,
    pub stack_table: Option<Arc<dyn StackTable>>,
    pub alert_map: Option<Arc<dyn AlertLevelMap>>,
}

impl ProbeSet {
    /// Userspace-only mode: a loopback ring and no kernel tables. The
    /// producer handle lives inside the set, so the reader blocks idle until
    /// shutdown closes it.
    pub fn disabled() -> ProbeSet {
        let (_, set) = ProbeSet::loopback();
        set
    }

    /// Loopback pair for tests and demos: push records through the returned
    /// producer and they flow through the whole pipeline.
    pub fn loopback() -> (LoopbackProducer, ProbeSet) {
        let (producer, ring) = LoopbackRing::channel();
        let set = ProbeSet {
            ring: Box::new(ring),
            ring_handle: Arc::new(producer.clone()),
            stack_table: None,
            alert_map: None,
        };
        (producer, set)
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer").finish()
    }
}

pub struct Tracer {
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
    pipeline: Arc<AlertPipeline>,
    name_cache: Arc<ProcessNameCache>,
    path_cache: Arc<PathCache>,
    analyzer: Arc<CriticalPathAnalyzer>,
    monitor: Option<Arc<ResourceMonitor>>,
    ring: Option<Box<dyn RingReader>>,
    ring_handle: Arc<dyn RingHandle>,
    stack_table: Option<Arc<dyn StackTable>>,
    filter: Arc<dyn CgroupFilter>,
    events_tx: mpsc::Sender<TraceEvent>,
    events_rx: Option<mpsc::Receiver<TraceEvent>>,
    circuit_breaker_enabled: bool,
    error_backoff_enabled: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl Tracer {
    /// Wire the pipeline from configuration. Must run inside the runtime.
    /// Errors here are fatal bootstrap failures (bad sink URLs, missing SIEM
    /// credentials); the caller aborts start-up.
    pub fn new(
        config: &Config,
        probes: ProbeSet,
        on_path: crate::critical_path::EmitFn,
    ) -> anyhow::Result<Tracer> {
        let metrics = Arc::new(Metrics::new());
        let cancel = CancellationToken::new();

        let pipeline =
            AlertPipeline::from_config(&config.alerts, Arc::clone(&metrics), cancel.child_token())?;

        let cache_ttl = Duration::from_secs(config.cache.ttl_seconds.max(1));
        let name_cache = Arc::new(ProcessNameCache::new(
            config.cache.max_size,
            cache_ttl,
            config.paths.proc_base.clone(),
            Arc::clone(&metrics),
        ));
        let path_cache = Arc::new(PathCache::new(cache_ttl, Arc::clone(&metrics)));

        let analyzer = Arc::new(CriticalPathAnalyzer::new(
            crate::critical_path::DEFAULT_WINDOW_TIMEOUT,
            on_path,
        ));

        let (events_tx, events_rx) =
            mpsc::channel(config.runtime.event_buffer_size.max(1));

        let filter: Arc<dyn CgroupFilter> = if config.monitor.cgroup_path.is_empty() {
            Arc::new(AllowAllFilter)
        } else {
            Arc::new(ProcCgroupFilter::new(
                config.paths.proc_base.clone(),
                config.monitor.cgroup_path.clone(),
            ))
        };

        let monitor = if config.monitor.cgroup_path.is_empty() {
            log::info!("no cgroup configured; resource monitor disabled");
            None
        } else {
            Some(Arc::new(ResourceMonitor::new(
                config.paths.cgroup_base.clone(),
                config.monitor.cgroup_path.clone(),
                config.monitor.pod_name.clone(),
                config.monitor.namespace.clone(),
                Duration::from_secs(config.monitor.interval_secs.max(1)),
                Arc::clone(&pipeline),
                events_tx.clone(),
                probes.alert_map.clone(),
                Arc::clone(&metrics),
            )))
        };

        Ok(Tracer {
            cancel,
            metrics,
            pipeline,
            name_cache,
            path_cache,
            analyzer,
            monitor,
            ring: Some(probes.ring),
            ring_handle: probes.ring_handle,
            stack_table: probes.stack_table,
            filter,
            events_tx,
            events_rx: Some(events_rx),
            circuit_breaker_enabled: config.runtime.circuit_breaker_enabled,
            error_backoff_enabled: config.runtime.error_backoff_enabled,
            tasks: Vec::new(),
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn pipeline(&self) -> Arc<AlertPipeline> {
        Arc::clone(&self.pipeline)
    }

    /// Bounded FIFO of enriched events; take it once, before `start`.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TraceEvent>> {
        self.events_rx.take()
    }

    /// Spawn the worker tasks: the blocking ingest loop, the resource
    /// monitor and the periodic ticks.
    pub fn start(&mut self) {
        let ring = match self.ring.take() {
            Some(ring) => ring,
            None => {
                log::warn!("tracer already started");
                return;
            }
        };

        let ingestor = Ingestor::new(
            Arc::clone(&self.name_cache),
            Arc::clone(&self.path_cache),
            self.stack_table.clone(),
            Arc::clone(&self.filter),
            Some(Arc::clone(&self.analyzer)),
            self.events_tx.clone(),
            Arc::clone(&self.metrics),
            self.cancel.clone(),
            self.circuit_breaker_enabled,
            self.error_backoff_enabled,
        );
        self.tasks
            .push(tokio::task::spawn_blocking(move || ingestor.run(ring)));

        if let Some(monitor) = &self.monitor {
            let monitor = Arc::clone(monitor);
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(monitor.run(cancel)));
        }

        // Metrics rollup every second.
        {
            let metrics = Arc::clone(&self.metrics);
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(ROLLUP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => metrics.rollup(),
                    }
                }
            }));
        }

        // Periodic metrics summary line.
        {
            let metrics = Arc::clone(&self.metrics);
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(SUMMARY_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            log::info!(
                                "metrics: events/s={} drops={} queue_drops={} alerts={} cache_miss={}",
                                metrics.events_per_sec(),
                                metrics.event_drops(),
                                metrics.queue_drops(),
                                metrics.alerts_submitted(),
                                metrics.name_cache_misses(),
                            );
                        }
                    }
                }
            }));
        }

        // Critical-path eviction tick.
        {
            let analyzer = Arc::clone(&self.analyzer);
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(EVICT_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => analyzer.evict(),
                    }
                }
            }));
        }

        // Cache sweeps.
        {
            let name_cache = Arc::clone(&self.name_cache);
            let path_cache = Arc::clone(&self.path_cache);
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(CACHE_CLEANUP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            name_cache.cleanup();
                            path_cache.cleanup();
                        }
                    }
                }
            }));
        }

        // Hourly dedup-map sweep.
        {
            let pipeline = Arc::clone(&self.pipeline);
            let cancel = self.cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(DEDUP_CLEANUP_INTERVAL);
                tick.tick().await; // the immediate first tick has nothing to sweep
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => pipeline.dedup_cleanup(),
                    }
                }
            }));
        }

        log::info!("tracer started ({} tasks)", self.tasks.len());
    }

    /// Cancel everything, unblock the ring reader and drain the tasks within
    /// the shutdown budget.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.ring_handle.close();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        for task in self.tasks.drain(..) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                log::warn!("task did not drain within the shutdown budget");
            }
        }
        log::info!("tracer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use bytes::Bytes;
    use podtrace_ebpf_common::{EventKind, RawEventV2};
    use std::sync::Mutex;

    fn record(pid: u32, kind: EventKind, latency_ns: u64) -> Bytes {
        let mut raw = RawEventV2::zeroed();
        raw.timestamp_ns = 1;
        raw.pid = pid;
        raw.kind = kind as u32;
        raw.latency_ns = latency_ns;
        Bytes::copy_from_slice(bytemuck::bytes_of(&raw))
    }

    fn test_config(proc_base: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.alerts.enabled = false;
        config.paths.proc_base = proc_base.display().to_string();
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn events_flow_end_to_end_and_shutdown_drains() {
        let proc_dir = tempfile::tempdir().unwrap();
        let pid_dir = proc_dir.path().join("42");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("comm"), "app\n").unwrap();

        let paths = Arc::new(Mutex::new(Vec::new()));
        let paths_clone = Arc::clone(&paths);

        let (producer, probes) = ProbeSet::loopback();
        let mut tracer = Tracer::new(
            &test_config(proc_dir.path()),
            probes,
            Box::new(move |path| paths_clone.lock().unwrap().push(path)),
        )
        .unwrap();
        let mut events = tracer.take_events().unwrap();
        tracer.start();

        producer.push(record(42, EventKind::DbQuery, 2_000_000));
        producer.push(record(42, EventKind::HttpResp, 2_000_000));

        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::DbQuery);
        assert_eq!(first.process_name, "app");
        let second = events.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::HttpResp);

        assert_eq!(paths.lock().unwrap().len(), 1, "boundary closed the window");

        tokio::time::timeout(Duration::from_secs(10), tracer.shutdown())
            .await
            .expect("shutdown drains within the budget");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disabled_probe_set_idles_until_shutdown() {
        let proc_dir = tempfile::tempdir().unwrap();
        let mut tracer = Tracer::new(
            &test_config(proc_dir.path()),
            ProbeSet::disabled(),
            Box::new(|_| {}),
        )
        .unwrap();
        tracer.start();
        tokio::time::timeout(Duration::from_secs(10), tracer.shutdown())
            .await
            .expect("idle tracer shuts down cleanly");
    }

    #[tokio::test]
    async fn bad_sink_configuration_fails_bootstrap() {
        let mut config = Config::default();
        config.alerts.enabled = true;
        config.alerts.webhook_url = Some("ftp://example.com/hook".to_string());

        let err = Tracer::new(&config, ProbeSet::disabled(), Box::new(|_| {})).unwrap_err();
        assert!(err.to_string().contains("webhook"));
    }

    #[tokio::test]
    async fn take_events_is_single_use() {
        let proc_dir = tempfile::tempdir().unwrap();
        let mut tracer = Tracer::new(
            &test_config(proc_dir.path()),
            ProbeSet::disabled(),
            Box::new(|_| {}),
        )
        .unwrap();
        assert!(tracer.take_events().is_some());
        assert!(tracer.take_events().is_none());
    }
}
