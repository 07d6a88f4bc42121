//! JSONL telemetry log for skill-bus dispatch events.
//!
//! Every dispatch appends `match`, `condition_skip`, `no_match`, and
//! `skill_complete` events to a project-scoped JSONL file. A stable
//! per-process session id groups the events from one dispatch invocation
//! together; logging failures never propagate — telemetry is best-effort
//! and must never break a skill dispatch.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use skill_bus_types::Settings;

const DEFAULT_TELEMETRY_FILE: &str = ".claude/skill-bus-telemetry.jsonl";

fn session_id() -> &'static str {
    static ID: OnceLock<String> = OnceLock::new();
    ID.get_or_init(|| {
        let full = uuid::Uuid::new_v4().simple().to_string();
        full[..8].to_string()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Match,
    ConditionSkip,
    NoMatch,
    SkillComplete,
}

/// One line of the telemetry log. Fields unused by a given [`EventKind`]
/// are simply omitted from the serialized JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl TelemetryEvent {
    fn new(event: EventKind) -> Self {
        Self {
            ts: Utc::now(),
            session_id: session_id().to_string(),
            event,
            skill: None,
            insert: None,
            pattern: None,
            timing: None,
            source: None,
        }
    }

    pub fn skill(mut self, skill: impl Into<String>) -> Self {
        self.skill = Some(skill.into());
        self
    }

    pub fn insert(mut self, insert: impl Into<String>) -> Self {
        self.insert = Some(insert.into());
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn timing(mut self, timing: impl Into<String>) -> Self {
        self.timing = Some(timing.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

pub fn event(kind: EventKind) -> TelemetryEvent {
    TelemetryEvent::new(kind)
}

/// Resolve the telemetry file path: `settings.telemetry_path` (relative to
/// `cwd` unless absolute) if set, otherwise `<cwd>/.claude/skill-bus-telemetry.jsonl`.
pub fn resolve_telemetry_path(cwd: &Path, settings: &Settings) -> PathBuf {
    if !settings.telemetry_path.is_empty() {
        let configured = Path::new(&settings.telemetry_path);
        if configured.is_absolute() {
            return configured.to_path_buf();
        }
        return cwd.join(configured);
    }
    cwd.join(DEFAULT_TELEMETRY_FILE)
}

/// Truncate the log to its newest half if it exceeds `max_size_kb`. A
/// single line over the limit is left alone — it can't be halved.
fn maybe_rotate(path: &Path, max_size_kb: u64) {
    let Ok(meta) = fs::metadata(path) else { return };
    if meta.len() / 1024 <= max_size_kb {
        return;
    }
    let Ok(contents) = fs::read_to_string(path) else { return };
    let lines: Vec<&str> = contents.lines().collect();
    let keep = &lines[lines.len() / 2..];
    if keep.len() == lines.len() {
        return;
    }
    let _ = fs::write(path, keep.join("\n") + "\n");
}

/// Append one telemetry event. Best-effort: any I/O failure is silently
/// swallowed so a broken telemetry path never aborts a dispatch.
pub fn log_event(cwd: &Path, settings: &Settings, ev: TelemetryEvent) {
    if !settings.telemetry {
        return;
    }
    let path = resolve_telemetry_path(cwd, settings);
    let Some(parent) = path.parent() else { return };
    if !parent.as_os_str().is_empty() && fs::create_dir_all(parent).is_err() {
        return;
    }
    if settings.max_log_size_kb > 0 {
        maybe_rotate(&path, settings.max_log_size_kb);
    }
    let Ok(line) = serde_json::to_string(&ev) else { return };
    let file = OpenOptions::new().create(true).append(true).open(&path);
    if let Ok(mut file) = file {
        let _ = writeln!(file, "{line}");
    }
}

/// Read and parse the telemetry log, optionally filtered by session id or
/// by age. Malformed lines are skipped rather than aborting the read.
pub fn read_telemetry(
    cwd: &Path,
    settings: &Settings,
    session_filter: Option<&str>,
    days_filter: Option<i64>,
) -> Vec<TelemetryEvent> {
    let path = resolve_telemetry_path(cwd, settings);
    let Ok(file) = File::open(&path) else { return Vec::new() };
    let cutoff = days_filter.map(|days| Utc::now() - chrono::Duration::days(days));

    let mut events = Vec::new();
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<TelemetryEvent>(line) else { continue };
        if let Some(filter) = session_filter {
            if entry.session_id != filter {
                continue;
            }
        }
        if let Some(cutoff) = cutoff {
            if entry.ts < cutoff {
                continue;
            }
        }
        events.push(entry);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings_with_telemetry() -> Settings {
        let mut s = Settings::default();
        s.telemetry = true;
        s
    }

    #[test]
    fn default_path_is_dotclaude() {
        let td = tempdir().unwrap();
        let path = resolve_telemetry_path(td.path(), &Settings::default());
        assert_eq!(path, td.path().join(".claude/skill-bus-telemetry.jsonl"));
    }

    #[test]
    fn configured_relative_path_is_relative_to_cwd() {
        let td = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.telemetry_path = "logs/tele.jsonl".to_string();
        let path = resolve_telemetry_path(td.path(), &settings);
        assert_eq!(path, td.path().join("logs/tele.jsonl"));
    }

    #[test]
    fn disabled_telemetry_does_not_write() {
        let td = tempdir().unwrap();
        let settings = Settings::default();
        log_event(td.path(), &settings, event(EventKind::Match).skill("foo"));
        let path = resolve_telemetry_path(td.path(), &settings);
        assert!(!path.exists());
    }

    #[test]
    fn enabled_telemetry_writes_and_reads_back() {
        let td = tempdir().unwrap();
        let settings = settings_with_telemetry();
        log_event(td.path(), &settings, event(EventKind::Match).skill("foo").insert("ctx"));
        let events = read_telemetry(td.path(), &settings, None, None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].skill.as_deref(), Some("foo"));
        assert_eq!(events[0].event, EventKind::Match);
    }

    #[test]
    fn session_filter_excludes_other_sessions() {
        let td = tempdir().unwrap();
        let settings = settings_with_telemetry();
        log_event(td.path(), &settings, event(EventKind::NoMatch).skill("bar"));
        let events = read_telemetry(td.path(), &settings, Some("not-a-real-session"), None);
        assert!(events.is_empty());
    }

    #[test]
    fn rotation_discards_older_half() {
        let td = tempdir().unwrap();
        let path = td.path().join(".claude/skill-bus-telemetry.jsonl");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let line = "x".repeat(200);
        let mut contents = String::new();
        for i in 0..20 {
            contents.push_str(&format!("{{\"n\":{i},\"pad\":\"{line}\"}}\n"));
        }
        fs::write(&path, &contents).unwrap();
        maybe_rotate(&path, 1);
        let after = fs::read_to_string(&path).unwrap();
        assert!(after.lines().count() < 20);
    }

    #[test]
    fn missing_file_reads_empty() {
        let td = tempdir().unwrap();
        let events = read_telemetry(td.path(), &Settings::default(), None, None);
        assert!(events.is_empty());
    }
}
