//! MQ-031: Append-only JSONL event log and request identifiers.

use super::event::{decode_line, encode_line, Decoded, Envelope};
use chrono::{SecondsFormat, Utc};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// RFC 3339 UTC timestamp with milliseconds.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a request ID, unique within the process.
pub fn generate_request_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = blake3::Hasher::new();
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&count.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    let hex = hasher.finalize().to_hex();
    format!("q-{}", &hex.as_str()[..12])
}

/// Append one envelope to a JSONL log, creating parent directories.
pub fn append_event(path: &Path, envelope: &Envelope) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("cannot create log dir: {}", e))?;
        }
    }
    let line = encode_line(envelope)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;
    writeln!(file, "{}", line).map_err(|e| format!("write error: {}", e))?;
    Ok(())
}

/// Read a JSONL log. Blank lines are skipped; unknown tags are kept as `Unknown`.
pub fn read_events(path: &Path) -> Result<Vec<Decoded>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read event log {}: {}", path.display(), e))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| decode_line(line).map_err(|e| format!("line {}: {}", i + 1, e)))
        .collect()
}

/// Known envelopes for one request, in log order.
pub fn request_events(decoded: &[Decoded], request_id: &str) -> Vec<Envelope> {
    decoded
        .iter()
        .filter_map(|d| match d {
            Decoded::Known(e) if e.request_id == request_id => Some(e.clone()),
            _ => None,
        })
        .collect()
}
