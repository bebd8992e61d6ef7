#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

#[cfg(test)]
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

// =============================================================================
// KERNEL/USER EVENT WIRE FORMAT - Shared Protocol Definitions
// =============================================================================
//
// The kernel probes write fixed-layout records into a single-producer /
// single-consumer ring shared with userspace. Two record versions exist on the
// wire, distinguished purely by total length:
//
//   v1 (312 bytes): header without cgroup_id (legacy probes)
//   v2 (320 bytes): header with cgroup_id at offset 56
//
// HEADER LAYOUT (little-endian, explicit padding):
//   [0..8]    timestamp_ns: u64   - host monotonic nanoseconds
//   [8..12]   pid: u32            - tgid, valid range 1..=PID_MAX
//   [12..16]  kind: u32           - EventKind tag
//   [16..24]  latency_ns: u64     - 0 means "not a timed event"
//   [24..28]  error_code: i32     - 0 means success
//   [28..32]  _pad0
//   [32..40]  bytes: u64          - byte count associated with the event
//   [40..44]  tcp_state: u32      - payload repurposed per kind (TCP state,
//                                   fd kind, resource-type identifier)
//   [44..48]  _pad1
//   [48..56]  stack_key: u64      - key into the kernel stack table, 0 = none
//   [56..64]  cgroup_id: u64      - v2 only
//   [..+128]  target: [u8; 128]   - NUL-terminated printable text
//   [..+128]  details: [u8; 128]  - NUL-terminated printable text
// =============================================================================

/// Fixed capacity of the `target` text field.
pub const TARGET_LEN: usize = 128;

/// Fixed capacity of the `details` text field.
pub const DETAILS_LEN: usize = 128;

/// Largest PID the kernel side will ever report (2^22 - 1, the kernel's
/// PID_MAX_LIMIT). Anything outside 1..=PID_MAX is a malformed record.
pub const PID_MAX: u32 = (1 << 22) - 1;

/// Upper bound on frames copied out of the kernel stack table.
pub const MAX_STACK_DEPTH: usize = 32;

/// Sentinel written by the socket probes when the peer is gone; never
/// resolved through the path cache.
pub const DISCONNECTED_TARGET: &str = "<disconnected>";

/// v1 record: 56-byte header + target + details.
pub const EVENT_SIZE_V1: usize = 56 + TARGET_LEN + DETAILS_LEN;

/// v2 record: 64-byte header (adds cgroup_id) + target + details.
pub const EVENT_SIZE_V2: usize = 64 + TARGET_LEN + DETAILS_LEN;

/// Legacy wire record without cgroup_id.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct RawEventV1 {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub kind: u32,
    pub latency_ns: u64,
    pub error_code: i32,
    pub _pad0: u32,
    pub bytes: u64,
    pub tcp_state: u32,
    pub _pad1: u32,
    pub stack_key: u64,
    pub target: [u8; TARGET_LEN],
    pub details: [u8; DETAILS_LEN],
}

/// Current wire record; cgroup_id lands between stack_key and target.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct RawEventV2 {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub kind: u32,
    pub latency_ns: u64,
    pub error_code: i32,
    pub _pad0: u32,
    pub bytes: u64,
    pub tcp_state: u32,
    pub _pad1: u32,
    pub stack_key: u64,
    pub cgroup_id: u64,
    pub target: [u8; TARGET_LEN],
    pub details: [u8; DETAILS_LEN],
}

impl RawEventV2 {
    pub const fn zeroed() -> Self {
        Self {
            timestamp_ns: 0,
            pid: 0,
            kind: 0,
            latency_ns: 0,
            error_code: 0,
            _pad0: 0,
            bytes: 0,
            tcp_state: 0,
            _pad1: 0,
            stack_key: 0,
            cgroup_id: 0,
            target: [0; TARGET_LEN],
            details: [0; DETAILS_LEN],
        }
    }
}

impl From<RawEventV1> for RawEventV2 {
    fn from(v1: RawEventV1) -> Self {
        Self {
            timestamp_ns: v1.timestamp_ns,
            pid: v1.pid,
            kind: v1.kind,
            latency_ns: v1.latency_ns,
            error_code: v1.error_code,
            _pad0: 0,
            bytes: v1.bytes,
            tcp_state: v1.tcp_state,
            _pad1: 0,
            stack_key: v1.stack_key,
            cgroup_id: 0,
            target: v1.target,
            details: v1.details,
        }
    }
}

// Wire layout is load-bearing; catch accidental field reordering at compile
// time rather than at the first corrupt parse.
const _: () = {
    assert!(core::mem::size_of::<RawEventV1>() == EVENT_SIZE_V1);
    assert!(core::mem::size_of::<RawEventV2>() == EVENT_SIZE_V2);
};

/// Event tags emitted by the probe set. Numeric values are assigned at build
/// time and shared with the kernel objects; they are stable within a build
/// but not across builds.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    Dns = 0,
    Connect = 1,
    TcpSend = 2,
    TcpRecv = 3,
    Write = 4,
    Read = 5,
    Fsync = 6,
    SchedSwitch = 7,
    TcpState = 8,
    PageFault = 9,
    OomKill = 10,
    UdpSend = 11,
    UdpRecv = 12,
    HttpReq = 13,
    HttpResp = 14,
    LockContention = 15,
    TcpRetrans = 16,
    NetDevError = 17,
    DbQuery = 18,
    Exec = 19,
    Fork = 20,
    Open = 21,
    Close = 22,
    TlsHandshake = 23,
    TlsError = 24,
    ResourceLimit = 25,
    PoolAcquire = 26,
    PoolRelease = 27,
    PoolExhausted = 28,
    RedisCmd = 29,
    MemcachedCmd = 30,
    FastcgiResp = 31,
    GrpcMethod = 32,
}

impl EventKind {
    pub const fn from_u32(raw: u32) -> Option<Self> {
        if raw <= EventKind::GrpcMethod as u32 {
            // Tags are dense starting at 0, so the bound check is the whole
            // validity test.
            Some(unsafe { core::mem::transmute::<u32, EventKind>(raw) })
        } else {
            None
        }
    }

    /// Stable lower-case name, used as metric label and as the fallback
    /// critical-path segment label when `details` is empty.
    pub const fn name(self) -> &'static str {
        match self {
            EventKind::Dns => "dns",
            EventKind::Connect => "connect",
            EventKind::TcpSend => "tcp_send",
            EventKind::TcpRecv => "tcp_recv",
            EventKind::Write => "write",
            EventKind::Read => "read",
            EventKind::Fsync => "fsync",
            EventKind::SchedSwitch => "sched_switch",
            EventKind::TcpState => "tcp_state",
            EventKind::PageFault => "page_fault",
            EventKind::OomKill => "oom_kill",
            EventKind::UdpSend => "udp_send",
            EventKind::UdpRecv => "udp_recv",
            EventKind::HttpReq => "http_req",
            EventKind::HttpResp => "http_resp",
            EventKind::LockContention => "lock_contention",
            EventKind::TcpRetrans => "tcp_retrans",
            EventKind::NetDevError => "net_dev_error",
            EventKind::DbQuery => "db_query",
            EventKind::Exec => "exec",
            EventKind::Fork => "fork",
            EventKind::Open => "open",
            EventKind::Close => "close",
            EventKind::TlsHandshake => "tls_handshake",
            EventKind::TlsError => "tls_error",
            EventKind::ResourceLimit => "resource_limit",
            EventKind::PoolAcquire => "pool_acquire",
            EventKind::PoolRelease => "pool_release",
            EventKind::PoolExhausted => "pool_exhausted",
            EventKind::RedisCmd => "redis_cmd",
            EventKind::MemcachedCmd => "memcached_cmd",
            EventKind::FastcgiResp => "fastcgi_resp",
            EventKind::GrpcMethod => "grpc_method",
        }
    }

    /// Boundary events close a critical-path window.
    pub const fn is_boundary(self) -> bool {
        matches!(
            self,
            EventKind::HttpResp | EventKind::FastcgiResp | EventKind::GrpcMethod
        )
    }
}

/// Alert levels written by the kernel side into the per-cgroup alert map.
/// Userspace mirrors the same values back when it raises a band.
pub mod alert_level {
    pub const NONE: u8 = 0;
    pub const WARNING: u8 = 1;
    pub const CRITICAL: u8 = 2;
    pub const EMERGENCY: u8 = 3;
}

/// Resource-type identifiers carried in `tcp_state` for ResourceLimit events.
pub mod resource_id {
    pub const CPU: u32 = 0;
    pub const MEMORY: u32 = 1;
    pub const IO: u32 = 2;
}
