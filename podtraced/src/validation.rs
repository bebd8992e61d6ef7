//! Input validation and string hygiene for identifiers that end up in
//! metric labels, log lines and outgoing alert payloads.

use podtrace_ebpf_common::PID_MAX;

/// Marker appended when a field is cut down to its bound.
pub const ELLIPSIS: &str = "...";

/// Kernel PIDs are 1..=PID_MAX; 0 and anything above the kernel's
/// PID_MAX_LIMIT never identifies a real task.
pub fn pid_in_range(pid: u32) -> bool {
    pid >= 1 && pid <= PID_MAX
}

/// Strip characters that must never reach a label or a shell-adjacent
/// context: control bytes, `%`, backticks, `$` and `;`.
pub fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control() && !matches!(c, '%' | '`' | '$' | ';'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Truncate `value` to at most `max` bytes, ending in the three-character
/// ellipsis marker. Idempotent: a string already within the bound is
/// returned unchanged, so re-sanitising an alert is a no-op.
pub fn truncate_ellipsis(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    if max <= ELLIPSIS.len() {
        return ELLIPSIS[..max].to_string();
    }
    let keep = max - ELLIPSIS.len();
    // Back off to a char boundary so multi-byte text cannot be split.
    let mut end = keep;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &value[..end], ELLIPSIS)
}
