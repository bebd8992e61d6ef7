//! Contracts toward the kernel side.
//!
//! The probe programs and their loader live outside this crate; the tracer
//! only needs a blocking record source, a lossy stack table, a best-effort
//! per-cgroup alert map and a PID membership filter. Each is a trait here so
//! the loader can hand in whatever the running kernel supports.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use bytes::Bytes;

/// Result of one blocking ring read.
pub enum RingRead {
    /// One complete record, still in wire layout.
    Record(Bytes),
    /// The producer side is gone; the ingest loop exits cleanly.
    Closed,
}

/// Blocking reader over the kernel event ring. `read` parks the calling
/// thread until a record, an error or closure; dropping or closing the
/// paired handle must unblock it.
pub trait RingReader: Send {
    fn read(&mut self) -> io::Result<RingRead>;
}

/// Handle the orchestrator keeps to unblock a reader stuck in the kernel.
pub trait RingHandle: Send + Sync {
    fn close(&self);
}

/// Secondary lookup of call stacks captured by the probes. The kernel table
/// is lossy; a missing key is not an error.
pub trait StackTable: Send + Sync {
    fn lookup(&self, stack_key: u64) -> Option<Vec<u64>>;
}

/// Kernel-side map of alert levels keyed by cgroup inode, mirrored by the
/// resource monitor so the probes can tag events from throttled cgroups.
pub trait AlertLevelMap: Send + Sync {
    fn set_level(&self, cgroup_inode: u64, level: u8) -> anyhow::Result<()>;
}

/// Membership test: is this PID currently part of the monitored cgroup?
pub trait CgroupFilter: Send + Sync {
    fn contains(&self, pid: u32) -> bool;
}

/// Filter that admits everything; used when no cgroup scoping is configured.
pub struct AllowAllFilter;

impl CgroupFilter for AllowAllFilter {
    fn contains(&self, _pid: u32) -> bool {
        true
    }
}

/// Production filter: reads `/proc/<pid>/cgroup` and matches the monitored
/// cgroup path. Kernel-v2 lines look like `0::/kubepods/burstable/pod…`;
/// v1 lines carry a controller list in the middle field.
pub struct ProcCgroupFilter {
    proc_base: PathBuf,
    cgroup_path: String,
}

impl ProcCgroupFilter {
    pub fn new(proc_base: impl Into<PathBuf>, cgroup_path: impl Into<String>) -> Self {
        let cgroup_path = cgroup_path.into();
        let cgroup_path = format!("/{}", cgroup_path.trim_matches('/'));
        Self {
            proc_base: proc_base.into(),
            cgroup_path,
        }
    }

    fn matches(&self, contents: &str) -> bool {
        contents.lines().any(|line| {
            line.rsplit(':').next().is_some_and(|path| {
                path == self.cgroup_path
                    || path
                        .strip_prefix(self.cgroup_path.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
        })
    }
}

impl CgroupFilter for ProcCgroupFilter {
    fn contains(&self, pid: u32) -> bool {
        let path = self.proc_base.join(pid.to_string()).join("cgroup");
        match std::fs::read_to_string(path) {
            Ok(contents) => self.matches(&contents),
            // The process exited between the event and the lookup.
            Err(_) => false,
        }
    }
}

/// Resolve the inode of a cgroup directory; it keys the kernel-side maps.
pub fn cgroup_inode(path: &Path) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(path)?.ino())
}

/// In-process ring used when no kernel probe set is attached (userspace-only
/// mode) and by the tests: a producer handle feeding a blocking reader over
/// a channel.
pub struct LoopbackRing {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

#[derive(Clone)]
pub struct LoopbackProducer {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl LoopbackRing {
    pub fn channel() -> (LoopbackProducer, LoopbackRing) {
        let (tx, rx) = mpsc::channel();
        (LoopbackProducer { tx }, LoopbackRing { rx })
    }
}

impl RingReader for LoopbackRing {
    fn read(&mut self) -> io::Result<RingRead> {
        match self.rx.recv() {
            Ok(Ok(record)) => Ok(RingRead::Record(record)),
            Ok(Err(err)) => Err(err),
            // All producers dropped: end of stream.
            Err(_) => Ok(RingRead::Closed),
        }
    }
}

impl LoopbackProducer {
    pub fn push(&self, record: Bytes) {
        let _ = self.tx.send(Ok(record));
    }

    pub fn fail(&self, err: io::Error) {
        let _ = self.tx.send(Err(err));
    }
}

impl RingHandle for LoopbackProducer {
    fn close(&self) {
        // Nothing to do beyond dropping senders; the reader observes Closed
        // once every clone of this handle is gone. Send a sentinel so a
        // reader blocked on an otherwise-idle ring wakes promptly.
        let _ = self
            .tx
            .send(Err(io::Error::new(io::ErrorKind::Other, "ring closed")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_filter_matches_v2_lines() {
        let filter = ProcCgroupFilter::new("/proc", "kubepods/burstable/pod1234");
        assert!(filter.matches("0::/kubepods/burstable/pod1234/container-a\n"));
        assert!(filter.matches("0::/kubepods/burstable/pod1234\n"));
        assert!(!filter.matches("0::/kubepods/burstable/pod9999/container-a\n"));
        assert!(!filter.matches("0::/kubepods/burstable/pod1234x\n"));
    }

    #[test]
    fn proc_filter_matches_v1_lines() {
        let filter = ProcCgroupFilter::new("/proc", "kubepods/pod42");
        let contents = "12:memory:/kubepods/pod42/ctr\n11:cpu,cpuacct:/kubepods/pod42/ctr\n";
        assert!(filter.matches(contents));
    }

    #[test]
    fn proc_filter_reads_proc_tree() {
        let proc_dir = tempfile::tempdir().unwrap();
        let pid_dir = proc_dir.path().join("321");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("cgroup"), "0::/mypod/web\n").unwrap();

        let filter = ProcCgroupFilter::new(proc_dir.path(), "mypod");
        assert!(filter.contains(321));
        assert!(!filter.contains(999), "missing pid means not a member");
    }

    #[test]
    fn loopback_ring_delivers_then_closes() {
        let (producer, mut ring) = LoopbackRing::channel();
        producer.push(Bytes::from_static(b"abc"));
        match ring.read().unwrap() {
            RingRead::Record(record) => assert_eq!(&record[..], b"abc"),
            RingRead::Closed => panic!("expected a record"),
        }

        drop(producer);
        assert!(matches!(ring.read().unwrap(), RingRead::Closed));
    }

    #[test]
    fn cgroup_inode_of_missing_path_errors() {
        assert!(cgroup_inode(Path::new("/definitely/not/here")).is_err());
    }
}
