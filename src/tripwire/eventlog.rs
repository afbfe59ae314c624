//! Append-only JSONL provenance log, one file per stack.

use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const EVENT_LOG_FILE: &str = "events.jsonl";

/// Current UTC time as ISO 8601 (`YYYY-MM-DDTHH:MM:SSZ`).
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_utc(secs)
}

/// Format seconds since the Unix epoch as ISO 8601 UTC.
pub fn format_utc(secs: u64) -> String {
    let (y, m, d) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Proleptic Gregorian date for a day count since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

/// Run ID shared by every event of one deploy or destroy.
pub fn generate_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Event log path for a stack.
pub fn event_log_path(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(stack).join(EVENT_LOG_FILE)
}

/// Append an event to the stack's log.
pub fn append_event(state_dir: &Path, stack: &str, event: ProvenanceEvent) -> Result<(), String> {
    let path = event_log_path(state_dir, stack);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create state dir: {}", e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;
    writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

/// Read a stack's events, oldest first. A missing log reads as empty.
pub fn read_events(state_dir: &Path, stack: &str) -> Result<Vec<TimestampedEvent>, String> {
    let path = event_log_path(state_dir, stack);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| format!("{}:{}: invalid event: {}", path.display(), i + 1, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_utc_known_instants() {
        assert_eq!(format_utc(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_utc(951_782_400), "2000-02-29T00:00:00Z");
        assert_eq!(format_utc(1_771_250_400), "2026-02-16T14:00:00Z");
        assert_eq!(format_utc(4_102_444_799), "2099-12-31T23:59:59Z");
    }

    #[test]
    fn test_civil_from_days_leap_rules() {
        // 2100 is not a leap year: Feb 28 is followed by Mar 1
        let feb28_2100 = 47_540;
        assert_eq!(civil_from_days(feb28_2100), (2100, 2, 28));
        assert_eq!(civil_from_days(feb28_2100 + 1), (2100, 3, 1));
        assert_eq!(civil_from_days(-1), (1969, 12, 31));
    }

    #[test]
    fn test_now_iso8601_shape() {
        let ts = now_iso8601();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn test_generate_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_event_log_path() {
        let p = event_log_path(Path::new("/state"), "WipercheckVpcStack");
        assert_eq!(p, PathBuf::from("/state/WipercheckVpcStack/events.jsonl"));
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        append_event(
            dir.path(),
            "S",
            ProvenanceEvent::DeployStarted {
                stack: "S".to_string(),
                run_id: "r-abc".to_string(),
                tool_version: "0.3.0".to_string(),
            },
        )
        .unwrap();
        append_event(
            dir.path(),
            "S",
            ProvenanceEvent::StackFailed {
                stack: "S".to_string(),
                error: "exit 255".to_string(),
            },
        )
        .unwrap();

        let raw = std::fs::read_to_string(event_log_path(dir.path(), "S")).unwrap();
        assert!(raw.lines().next().unwrap().contains("\"event\":\"deploy_started\""));

        let events = read_events(dir.path(), "S").unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1].event,
            ProvenanceEvent::StackFailed { ref error, .. } if error == "exit 255"
        ));
    }

    #[test]
    fn test_read_missing_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(dir.path(), "ghost").unwrap().is_empty());

        let path = event_log_path(dir.path(), "S");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{\"ts\":\"x\"}\n").unwrap();
        let err = read_events(dir.path(), "S").unwrap_err();
        assert!(err.contains(":1: invalid event"));
    }
}
