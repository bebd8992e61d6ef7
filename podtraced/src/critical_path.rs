//! Per-request critical-path accounting.
//!
//! Latency-bearing events accumulate into a per-PID window; a response
//! boundary (HTTP, FastCGI, gRPC) closes the window and emits the fractional
//! breakdown. Windows nobody closes are flushed by the periodic evict tick.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::event::TraceEvent;

pub const DEFAULT_WINDOW_TIMEOUT: Duration = Duration::from_millis(500);

/// One latency contribution within a request.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Segment {
    pub label: String,
    pub latency_ns: u64,
    /// Share of the total; all fractions of a path sum to 1.0.
    pub fraction: f64,
}

/// Finished breakdown for one request on one PID.
#[derive(Clone, Debug, serde::Serialize)]
pub struct CriticalPath {
    pub pid: u32,
    pub total_latency_ns: u64,
    pub segments: Vec<Segment>,
}

struct Window {
    segments: Vec<(String, u64)>,
    last_seen: Instant,
}

pub type EmitFn = Box<dyn Fn(CriticalPath) + Send + Sync>;

/// Correlates latency-bearing events by PID. Feed and evict may race from
/// different tasks; all mutation is serialised on one lock, and the emit
/// callback always runs with the lock released.
pub struct CriticalPathAnalyzer {
    windows: Mutex<HashMap<u32, Window>>,
    timeout: Duration,
    emit: EmitFn,
}

impl CriticalPathAnalyzer {
    /// `timeout` of zero substitutes the 500 ms default.
    pub fn new(timeout: Duration, emit: EmitFn) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_WINDOW_TIMEOUT
        } else {
            timeout
        };
        Self {
            windows: Mutex::new(HashMap::new()),
            timeout,
            emit,
        }
    }

    /// Record one event. Zero-latency events are ignored; a boundary event
    /// finalises the window for its PID.
    pub fn feed(&self, event: &TraceEvent) {
        if event.latency_ns == 0 {
            return;
        }

        let finished = {
            let mut windows = self.windows.lock().unwrap();
            let window = windows.entry(event.pid).or_insert_with(|| Window {
                segments: Vec::new(),
                last_seen: Instant::now(),
            });
            window
                .segments
                .push((event.segment_label().to_string(), event.latency_ns));
            window.last_seen = Instant::now();

            if event.kind.is_boundary() {
                windows.remove(&event.pid)
            } else {
                None
            }
        };

        if let Some(window) = finished
            && let Some(path) = finalize(event.pid, window)
        {
            (self.emit)(path);
        }
    }

    /// Flush every window idle for longer than the timeout. Called from the
    /// periodic tick.
    pub fn evict(&self) {
        let expired: Vec<(u32, Window)> = {
            let mut windows = self.windows.lock().unwrap();
            let stale: Vec<u32> = windows
                .iter()
                .filter(|(_, w)| w.last_seen.elapsed() > self.timeout)
                .map(|(pid, _)| *pid)
                .collect();
            stale
                .into_iter()
                .filter_map(|pid| windows.remove(&pid).map(|w| (pid, w)))
                .collect()
        };

        for (pid, window) in expired {
            if let Some(path) = finalize(pid, window) {
                (self.emit)(path);
            }
        }
    }

    pub fn open_windows(&self) -> usize {
        self.windows.lock().unwrap().len()
    }
}

/// Sum the segments and compute fractions. Windows with no accumulated
/// latency emit nothing.
fn finalize(pid: u32, window: Window) -> Option<CriticalPath> {
    let total: u64 = window.segments.iter().map(|(_, ns)| ns).sum();
    if total == 0 {
        return None;
    }
    let segments = window
        .segments
        .into_iter()
        .map(|(label, latency_ns)| Segment {
            label,
            latency_ns,
            fraction: latency_ns as f64 / total as f64,
        })
        .collect();
    Some(CriticalPath {
        pid,
        total_latency_ns: total,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use podtrace_ebpf_common::EventKind;
    use std::sync::{Arc, Mutex as StdMutex};

    fn event(kind: EventKind, pid: u32, latency_ns: u64) -> TraceEvent {
        let mut e = TraceEvent::synthetic(kind, 0);
        e.pid = pid;
        e.latency_ns = latency_ns;
        e
    }

    fn collector() -> (Arc<StdMutex<Vec<CriticalPath>>>, EmitFn) {
        let sink = Arc::new(StdMutex::new(Vec::new()));
        let sink_clone = Arc::clone(&sink);
        let emit: EmitFn = Box::new(move |path| sink_clone.lock().unwrap().push(path));
        (sink, emit)
    }

    #[test]
    fn happy_path_fractions() {
        let (sink, emit) = collector();
        let analyzer = CriticalPathAnalyzer::new(DEFAULT_WINDOW_TIMEOUT, emit);

        analyzer.feed(&event(EventKind::DbQuery, 42, 5_000_000));
        analyzer.feed(&event(EventKind::RedisCmd, 42, 1_000_000));
        analyzer.feed(&event(EventKind::HttpResp, 42, 10_000_000));

        let paths = sink.lock().unwrap();
        assert_eq!(paths.len(), 1);
        let path = &paths[0];
        assert_eq!(path.pid, 42);
        assert_eq!(path.total_latency_ns, 16_000_000);
        assert_eq!(path.segments.len(), 3);
        assert!((path.segments[0].fraction - 5.0 / 16.0).abs() < 0.001);
        assert!((path.segments[1].fraction - 1.0 / 16.0).abs() < 0.001);
        assert!((path.segments[2].fraction - 10.0 / 16.0).abs() < 0.001);
        assert_eq!(path.segments[0].label, "db_query");

        let sum: f64 = path.segments.iter().map(|s| s.fraction).sum();
        assert!((sum - 1.0).abs() < 0.001);
        assert_eq!(analyzer.open_windows(), 0);
    }

    #[test]
    fn windows_are_separated_by_pid() {
        let (sink, emit) = collector();
        let analyzer = CriticalPathAnalyzer::new(DEFAULT_WINDOW_TIMEOUT, emit);

        analyzer.feed(&event(EventKind::DbQuery, 1, 1_000_000));
        analyzer.feed(&event(EventKind::DbQuery, 2, 2_000_000));
        analyzer.feed(&event(EventKind::HttpResp, 1, 3_000_000));
        analyzer.feed(&event(EventKind::GrpcMethod, 2, 4_000_000));

        let paths = sink.lock().unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].pid, 1);
        assert_eq!(paths[0].total_latency_ns, 4_000_000);
        assert_eq!(paths[1].pid, 2);
        assert_eq!(paths[1].total_latency_ns, 6_000_000);
    }

    #[test]
    fn zero_latency_events_are_ignored() {
        let (sink, emit) = collector();
        let analyzer = CriticalPathAnalyzer::new(DEFAULT_WINDOW_TIMEOUT, emit);

        analyzer.feed(&event(EventKind::DbQuery, 1, 0));
        analyzer.feed(&event(EventKind::HttpResp, 1, 5_000_000));

        let paths = sink.lock().unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].segments.len(), 1);
        assert_eq!(paths[0].segments[0].fraction, 1.0);
    }

    #[test]
    fn label_prefers_details() {
        let (sink, emit) = collector();
        let analyzer = CriticalPathAnalyzer::new(DEFAULT_WINDOW_TIMEOUT, emit);

        let mut first = event(EventKind::DbQuery, 9, 1_000);
        first.details = "SELECT 1".to_string();
        analyzer.feed(&first);
        analyzer.feed(&event(EventKind::HttpResp, 9, 1_000));

        let paths = sink.lock().unwrap();
        assert_eq!(paths[0].segments[0].label, "SELECT 1");
        assert_eq!(paths[0].segments[1].label, "http_resp");
    }

    #[test]
    fn evict_flushes_idle_windows() {
        let (sink, emit) = collector();
        let analyzer = CriticalPathAnalyzer::new(Duration::from_millis(1), emit);

        analyzer.feed(&event(EventKind::DbQuery, 99, 1_000_000));
        std::thread::sleep(Duration::from_millis(5));
        analyzer.evict();

        let paths = sink.lock().unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].pid, 99);
        assert_eq!(analyzer.open_windows(), 0);
    }

    #[test]
    fn evict_keeps_fresh_windows() {
        let (sink, emit) = collector();
        let analyzer = CriticalPathAnalyzer::new(Duration::from_secs(60), emit);

        analyzer.feed(&event(EventKind::DbQuery, 5, 1_000));
        analyzer.evict();

        assert!(sink.lock().unwrap().is_empty());
        assert_eq!(analyzer.open_windows(), 1);
    }

    #[test]
    fn zero_timeout_uses_default() {
        let (_, emit) = collector();
        let analyzer = CriticalPathAnalyzer::new(Duration::ZERO, emit);
        assert_eq!(analyzer.timeout, DEFAULT_WINDOW_TIMEOUT);
    }
}
