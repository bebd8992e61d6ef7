//! Hot-path caches: PID -> process name (TTL + LRU, bounded) and
//! `{pid}:{target}` -> canonical target (TTL, swept periodically).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::metrics::Metrics;
use crate::validation;

pub const DEFAULT_CACHE_MAX: usize = 10_000;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

struct NameEntry {
    value: String,
    inserted: Instant,
}

/// Bounded PID -> sanitised process-name cache.
///
/// Both reads and writes promote the entry to most-recently-used; entries
/// past the TTL count as misses and are evicted on access, with a periodic
/// sweep for the ones nobody asks about.
pub struct ProcessNameCache {
    inner: Mutex<LruCache<u32, NameEntry>>,
    ttl: Duration,
    proc_base: PathBuf,
    metrics: Arc<Metrics>,
}

impl ProcessNameCache {
    pub fn new(
        max_entries: usize,
        ttl: Duration,
        proc_base: impl Into<PathBuf>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1))
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CACHE_MAX).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
            proc_base: proc_base.into(),
            metrics,
        }
    }

    /// Resolve a PID to its sanitised process name, reading through to the
    /// process filesystem on a miss. Out-of-range PIDs short-circuit to an
    /// empty name without touching the cache.
    pub fn resolve(&self, pid: u32) -> String {
        if !validation::pid_in_range(pid) {
            return String::new();
        }
        if let Some(name) = self.get(pid) {
            return name;
        }
        let name = validation::sanitize_identifier(
            &lookup_proc_name(&self.proc_base, pid).unwrap_or_default(),
        );
        if !name.is_empty() {
            self.insert(pid, name.clone());
        }
        name
    }

    pub fn get(&self, pid: u32) -> Option<String> {
        let mut cache = self.inner.lock().unwrap();
        let fresh = match cache.get(&pid) {
            Some(entry) if entry.inserted.elapsed() <= self.ttl => Some(entry.value.clone()),
            Some(_) => None,
            None => {
                self.metrics.inc_name_cache_miss();
                return None;
            }
        };
        match fresh {
            Some(value) => {
                self.metrics.inc_name_cache_hit();
                Some(value)
            }
            None => {
                // Past the TTL: treat as a miss and evict lazily.
                cache.pop(&pid);
                self.metrics.inc_name_cache_miss();
                None
            }
        }
    }

    pub fn insert(&self, pid: u32, value: String) {
        let mut cache = self.inner.lock().unwrap();
        cache.put(
            pid,
            NameEntry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    /// Drop every expired entry. Called from the periodic cleanup tick.
    pub fn cleanup(&self) {
        let mut cache = self.inner.lock().unwrap();
        let expired: Vec<u32> = cache
            .iter()
            .filter(|(_, entry)| entry.inserted.elapsed() > self.ttl)
            .map(|(pid, _)| *pid)
            .collect();
        for pid in expired {
            cache.pop(&pid);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolve a process name from `/proc/<pid>/`, most reliable source first:
/// cmdline (argv0 basename), stat (comm field, parenthesised), comm.
fn lookup_proc_name(proc_base: &Path, pid: u32) -> Option<String> {
    let dir = proc_base.join(pid.to_string());

    if let Ok(raw) = std::fs::read(dir.join("cmdline"))
        && let Some(name) = name_from_cmdline(&raw)
    {
        return Some(name);
    }
    if let Ok(raw) = std::fs::read_to_string(dir.join("stat"))
        && let Some(name) = name_from_stat(&raw)
    {
        return Some(name);
    }
    if let Ok(raw) = std::fs::read_to_string(dir.join("comm"))
        && let Some(name) = name_from_comm(&raw)
    {
        return Some(name);
    }
    None
}

/// argv is NUL-separated; keep the basename of the first token.
fn name_from_cmdline(raw: &[u8]) -> Option<String> {
    let first = raw.split(|b| *b == 0).next()?;
    let text = String::from_utf8_lossy(first);
    let base = text.rsplit('/').next().unwrap_or(&text).trim();
    (!base.is_empty()).then(|| base.to_string())
}

/// The comm field sits between the first `(` and the *last* `)`, which keeps
/// names containing parentheses intact.
fn name_from_stat(raw: &str) -> Option<String> {
    let open = raw.find('(')?;
    let close = raw.rfind(')')?;
    if close <= open {
        return None;
    }
    let name = raw[open + 1..close].trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn name_from_comm(raw: &str) -> Option<String> {
    let name = raw.trim();
    (!name.is_empty()).then(|| name.to_string())
}

struct PathEntry {
    value: Arc<str>,
    inserted: Instant,
}

/// TTL-bounded `{pid}:{target}` -> canonical target map. Unbounded in count;
/// growth is held down by the periodic cleanup pass. Empty values are never
/// stored.
pub struct PathCache {
    inner: Mutex<HashMap<String, PathEntry>>,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl PathCache {
    pub fn new(ttl: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            metrics,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        let mut map = self.inner.lock().unwrap();
        let fresh = match map.get(key) {
            Some(entry) if entry.inserted.elapsed() <= self.ttl => {
                Some(Arc::clone(&entry.value))
            }
            Some(_) => None,
            None => {
                self.metrics.inc_path_cache_miss();
                return None;
            }
        };
        match fresh {
            Some(value) => {
                self.metrics.inc_path_cache_hit();
                Some(value)
            }
            None => {
                map.remove(key);
                self.metrics.inc_path_cache_miss();
                None
            }
        }
    }

    pub fn insert(&self, key: String, value: &str) -> Option<Arc<str>> {
        if value.is_empty() {
            return None;
        }
        let shared: Arc<str> = Arc::from(value);
        let mut map = self.inner.lock().unwrap();
        map.insert(
            key,
            PathEntry {
                value: Arc::clone(&shared),
                inserted: Instant::now(),
            },
        );
        Some(shared)
    }

    pub fn get_or_insert_with(
        &self,
        key: &str,
        compute: impl FnOnce() -> String,
    ) -> Option<Arc<str>> {
        if let Some(value) = self.get(key) {
            return Some(value);
        }
        self.insert(key.to_string(), &compute())
    }

    pub fn cleanup(&self) {
        let mut map = self.inner.lock().unwrap();
        map.retain(|_, entry| entry.inserted.elapsed() <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
