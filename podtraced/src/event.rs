//! User-space event model: parsing the kernel wire record and carrying the
//! enrichment added on the way to the output queue.

use std::sync::Arc;

use podtrace_ebpf_common::{
    EVENT_SIZE_V1, EVENT_SIZE_V2, EventKind, RawEventV1, RawEventV2,
};

use crate::validation;

/// One observed operation, parsed from the ring and enriched.
///
/// Every field is copy-valued; once an event is handed to the output queue
/// it is immutable for readers and ownership moves with it.
#[derive(Clone, Debug, serde::Serialize)]
pub struct TraceEvent {
    pub timestamp_ns: u64,
    pub pid: u32,
    pub cgroup_id: u64,
    pub kind: EventKind,
    pub latency_ns: u64,
    pub error_code: i32,
    pub bytes: u64,
    /// Payload repurposed per kind: TCP state number, fd kind or
    /// resource-type identifier.
    pub tcp_state: u32,
    pub stack_key: u64,
    pub target: String,
    pub details: String,
    // Enrichment, filled by the ingestor.
    pub process_name: String,
    pub stack: Vec<u64>,
    pub enriched_target: Option<Arc<str>>,
}

impl TraceEvent {
    /// Interpret a raw ring record. Records shorter than the v1 layout are
    /// discarded, as are records with an out-of-range PID or an unknown tag.
    pub fn parse(data: &[u8]) -> Option<TraceEvent> {
        let raw: RawEventV2 = if data.len() >= EVENT_SIZE_V2 {
            bytemuck::pod_read_unaligned(&data[..EVENT_SIZE_V2])
        } else if data.len() >= EVENT_SIZE_V1 {
            let v1: RawEventV1 = bytemuck::pod_read_unaligned(&data[..EVENT_SIZE_V1]);
            RawEventV2::from(v1)
        } else {
            return None;
        };

        if !validation::pid_in_range(raw.pid) {
            return None;
        }
        let kind = EventKind::from_u32(raw.kind)?;

        Some(TraceEvent {
            timestamp_ns: raw.timestamp_ns,
            pid: raw.pid,
            cgroup_id: raw.cgroup_id,
            kind,
            latency_ns: raw.latency_ns,
            error_code: raw.error_code,
            bytes: raw.bytes,
            tcp_state: raw.tcp_state,
            stack_key: raw.stack_key,
            target: wire_str(&raw.target),
            details: wire_str(&raw.details),
            process_name: String::new(),
            stack: Vec::new(),
            enriched_target: None,
        })
    }

    /// Synthetic event constructor used by the resource monitor; bypasses the
    /// wire parser.
    pub fn synthetic(kind: EventKind, timestamp_ns: u64) -> TraceEvent {
        TraceEvent {
            timestamp_ns,
            pid: 0,
            cgroup_id: 0,
            kind,
            latency_ns: 0,
            error_code: 0,
            bytes: 0,
            tcp_state: 0,
            stack_key: 0,
            target: String::new(),
            details: String::new(),
            process_name: String::new(),
            stack: Vec::new(),
            enriched_target: None,
        }
    }

    /// Segment label for critical-path accounting: `details` when the probe
    /// filled it, otherwise the tag name.
    pub fn segment_label(&self) -> &str {
        if self.details.is_empty() {
            self.kind.name()
        } else {
            &self.details
        }
    }
}

/// Decode a NUL-terminated wire text field. Everything after the first NUL
/// is probe scratch; the result never contains an embedded zero byte.
fn wire_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use podtrace_ebpf_common::{DETAILS_LEN, TARGET_LEN};

    fn raw_event(pid: u32, kind: EventKind) -> RawEventV2 {
        let mut raw = RawEventV2::zeroed();
        raw.timestamp_ns = 1_000;
        raw.pid = pid;
        raw.kind = kind as u32;
        raw
    }

    fn set_text(field: &mut [u8], text: &str) {
        field[..text.len()].copy_from_slice(text.as_bytes());
    }

    #[test]
    fn parses_v2_record() {
        let mut raw = raw_event(42, EventKind::DbQuery);
        raw.latency_ns = 5_000_000;
        raw.cgroup_id = 77;
        set_text(&mut raw.target, "orders-db:5432");
        set_text(&mut raw.details, "SELECT");

        let event = TraceEvent::parse(bytemuck::bytes_of(&raw)).unwrap();
        assert_eq!(event.pid, 42);
        assert_eq!(event.kind, EventKind::DbQuery);
        assert_eq!(event.cgroup_id, 77);
        assert_eq!(event.target, "orders-db:5432");
        assert_eq!(event.details, "SELECT");
        assert!(!event.target.contains('\0'));
    }

    #[test]
    fn parses_v1_record_without_cgroup() {
        let raw = raw_event(42, EventKind::Dns);
        let bytes = bytemuck::bytes_of(&raw);
        // A v1 record is the v2 layout with the cgroup_id word spliced out.
        let mut v1 = Vec::with_capacity(312);
        v1.extend_from_slice(&bytes[..56]);
        v1.extend_from_slice(&bytes[64..]);
        assert_eq!(v1.len(), 312);

        let event = TraceEvent::parse(&v1).unwrap();
        assert_eq!(event.pid, 42);
        assert_eq!(event.cgroup_id, 0, "legacy records report cgroup 0");
    }

    #[test]
    fn discards_short_records() {
        assert!(TraceEvent::parse(&[0u8; 55]).is_none());
        assert!(TraceEvent::parse(&[0u8; 311]).is_none());
    }

    #[test]
    fn discards_out_of_range_pids() {
        let raw = raw_event(0, EventKind::Dns);
        assert!(TraceEvent::parse(bytemuck::bytes_of(&raw)).is_none());

        let raw = raw_event(1 << 22, EventKind::Dns);
        assert!(TraceEvent::parse(bytemuck::bytes_of(&raw)).is_none());
    }

    #[test]
    fn discards_unknown_tags() {
        let mut raw = raw_event(42, EventKind::Dns);
        raw.kind = 9_999;
        assert!(TraceEvent::parse(bytemuck::bytes_of(&raw)).is_none());
    }

    #[test]
    fn label_falls_back_to_tag_name() {
        let mut raw = raw_event(42, EventKind::RedisCmd);
        let event = TraceEvent::parse(bytemuck::bytes_of(&raw)).unwrap();
        assert_eq!(event.segment_label(), "redis_cmd");

        set_text(&mut raw.details, "GET user:42");
        let event = TraceEvent::parse(bytemuck::bytes_of(&raw)).unwrap();
        assert_eq!(event.segment_label(), "GET user:42");
    }

    #[test]
    fn trims_wire_text() {
        let mut field = [0u8; TARGET_LEN];
        field[..8].copy_from_slice(b"  /tmp \0");
        assert_eq!(wire_str(&field), "/tmp");
        assert_eq!(wire_str(&[0u8; DETAILS_LEN]), "");
    }
}
