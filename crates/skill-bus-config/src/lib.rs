//! Configuration file loading and merging (component B).
//!
//! Reads the global (`SKILL_BUS_GLOBAL_CONFIG`, default
//! `~/.claude/skill-bus.json`) and project (`<cwd>/.claude/skill-bus.json`)
//! config files and merges them into one [`MergedConfig`]: settings
//! key-by-key (project overrides global), inserts (project wins on name
//! collision), and subscriptions (override directives filter global
//! entries, then a reverse-scan dedup keeps the later — project — entry
//! for any repeated `(insert, on, when)` key while preserving order).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};

use skill_bus_types::{Insert, Scope, Settings, Subscription};

/// One config file's contents, straight off disk.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub settings: Map<String, Value>,
    #[serde(default)]
    pub inserts: HashMap<String, Insert>,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

/// The merged view fed to the matcher and assembler.
#[derive(Debug)]
pub struct MergedConfig {
    pub settings: Settings,
    pub inserts: HashMap<String, Insert>,
    pub subscriptions: Vec<Subscription>,
}

/// Default global config path, honoring `SKILL_BUS_GLOBAL_CONFIG`.
pub fn default_global_config_path() -> PathBuf {
    let raw = std::env::var("SKILL_BUS_GLOBAL_CONFIG")
        .unwrap_or_else(|_| "~/.claude/skill-bus.json".to_string());
    expand_tilde(&raw)
}

pub fn project_config_path(cwd: &Path) -> PathBuf {
    cwd.join(".claude").join("skill-bus.json")
}

fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Load and parse a config file. Missing files are `None` with no warning;
/// malformed JSON (or a JSON value that doesn't fit the schema) is `None`
/// with a warning.
pub fn load_config_file(path: &Path, warnings: &mut Vec<String>) -> Option<ConfigFile> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warnings.push(format!("failed to read {}: {e}", path.display()));
            return None;
        }
    };
    match serde_json::from_str::<ConfigFile>(&raw) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            warnings.push(format!(
                "{} has invalid JSON ({e}). Fix to restore subscriptions.",
                path.display()
            ));
            None
        }
    }
}

/// Merge settings, applying global then project on top of defaults, key by
/// key. Malformed values for a known key are reported and skipped (the
/// accumulated value from the previous layer, or the default, survives).
pub fn merge_settings(
    global: Option<&ConfigFile>,
    project: Option<&ConfigFile>,
    warnings: &mut Vec<String>,
) -> Settings {
    let mut settings = Settings::default();
    if let Some(cfg) = global {
        apply_settings(&mut settings, &cfg.settings, warnings);
    }
    if let Some(cfg) = project {
        apply_settings(&mut settings, &cfg.settings, warnings);
    }
    settings
}

fn apply_settings(settings: &mut Settings, raw: &Map<String, Value>, warnings: &mut Vec<String>) {
    apply_bool(&mut settings.enabled, raw, "enabled", warnings);
    apply_bool(&mut settings.show_console_echo, raw, "showConsoleEcho", warnings);
    apply_bool(&mut settings.disable_global, raw, "disableGlobal", warnings);
    apply_bool(
        &mut settings.monitor_slash_commands,
        raw,
        "monitorSlashCommands",
        warnings,
    );
    apply_bool(
        &mut settings.show_condition_skips,
        raw,
        "showConditionSkips",
        warnings,
    );
    apply_bool(&mut settings.telemetry, raw, "telemetry", warnings);
    apply_bool(&mut settings.observe_unmatched, raw, "observeUnmatched", warnings);
    apply_bool(&mut settings.completion_hooks, raw, "completionHooks", warnings);

    if let Some(v) = raw.get("maxMatchesPerSkill") {
        match v.as_i64() {
            Some(n) if n >= 1 => settings.max_matches_per_skill = n as u32,
            _ => {
                warnings.push(format!(
                    "invalid maxMatchesPerSkill={v}, using default {}",
                    Settings::default().max_matches_per_skill
                ));
                settings.max_matches_per_skill = Settings::default().max_matches_per_skill;
            }
        }
    }

    if let Some(v) = raw.get("telemetryPath") {
        match v.as_str() {
            Some(s) => settings.telemetry_path = s.to_string(),
            None => warnings.push(format!("setting 'telemetryPath' must be a string, got {v}")),
        }
    }

    if let Some(v) = raw.get("maxLogSizeKB") {
        match v.as_u64() {
            Some(n) => settings.max_log_size_kb = n,
            None => warnings.push(format!(
                "setting 'maxLogSizeKB' must be a non-negative integer, got {v}"
            )),
        }
    }
}

fn apply_bool(field: &mut bool, raw: &Map<String, Value>, key: &str, warnings: &mut Vec<String>) {
    if let Some(v) = raw.get(key) {
        match v.as_bool() {
            Some(b) => *field = b,
            None => warnings.push(format!("setting '{key}' must be a boolean, got {v}")),
        }
    }
}

/// Merge inserts: global first, project overwrites on name collision with
/// an informational warning.
pub fn merge_inserts(
    global: Option<&ConfigFile>,
    project: Option<&ConfigFile>,
    warnings: &mut Vec<String>,
) -> HashMap<String, Insert> {
    let mut merged = global.map(|c| c.inserts.clone()).unwrap_or_default();
    if let Some(cfg) = project {
        for (name, insert) in &cfg.inserts {
            if merged.contains_key(name) {
                warnings.push(format!(
                    "insert '{name}' defined in both scopes — using project version"
                ));
            }
            merged.insert(name.clone(), insert.clone());
        }
    }
    merged
}

/// Merge subscriptions per spec §4.2: partition project subscriptions into
/// override directives and active entries, filter global subscriptions
/// against the overrides, concatenate filtered-global then active-project,
/// then dedup by `(insert, on, when)` keeping the later occurrence while
/// preserving the original order of survivors.
pub fn merge_subscriptions(
    global: Vec<Subscription>,
    project: Vec<Subscription>,
    disable_global: bool,
    warnings: &mut Vec<String>,
) -> Vec<Subscription> {
    let global_subs = if disable_global { Vec::new() } else { global };

    let mut overrides_insert: HashSet<String> = HashSet::new();
    let mut overrides_specific: HashSet<(String, String, String)> = HashSet::new();
    let mut active_project = Vec::new();

    for sub in project {
        if sub.is_override_directive() {
            let insert = sub.insert.clone().unwrap_or_default();
            if sub.is_broad_override() {
                overrides_insert.insert(insert);
            } else {
                overrides_specific.insert((insert, sub.on().to_string(), sub.when().to_string()));
            }
            continue;
        }
        active_project.push(sub);
    }

    let mut filtered_global: Vec<Subscription> = global_subs
        .into_iter()
        .filter(|s| s.enabled)
        .filter(|s| !overrides_insert.contains(s.insert.as_deref().unwrap_or("")))
        .filter(|s| !overrides_specific.contains(&s.dedup_key()))
        .collect();

    for s in &mut filtered_global {
        s.scope = Scope::Global;
    }
    for s in &mut active_project {
        s.scope = Scope::Project;
    }

    let mut all: Vec<Subscription> = filtered_global.into_iter().chain(active_project).collect();

    // Reverse-scan dedup: later (project, if present) occurrence wins, but
    // restoring iteration order afterward preserves first-surviving-by-key
    // position, matching spec's "naive reverse-scan-and-reverse" note.
    let mut seen: HashMap<(String, String, String), Scope> = HashMap::new();
    let mut keep = vec![false; all.len()];
    for (idx, sub) in all.iter().enumerate().rev() {
        let key = sub.dedup_key();
        match seen.get(&key) {
            None => {
                seen.insert(key, sub.scope);
                keep[idx] = true;
            }
            Some(winner_scope) => {
                let label = format!("{} -> {} [{}]", key.0, key.1, key.2);
                if *winner_scope == sub.scope {
                    warnings.push(format!(
                        "duplicate subscription ({label}) in {} scope — deduplicating",
                        sub.scope.as_str()
                    ));
                } else {
                    warnings.push(format!(
                        "duplicate subscription ({label}) — using {} version",
                        winner_scope.as_str()
                    ));
                }
            }
        }
    }

    let mut kept = keep.into_iter();
    all.retain(|_| kept.next().unwrap());
    all
}

/// Run the full load-and-merge pipeline for one dispatch.
pub fn load_and_merge(
    global_path: &Path,
    project_path: &Path,
    warnings: &mut Vec<String>,
) -> MergedConfig {
    let global = load_config_file(global_path, warnings);
    let project = load_config_file(project_path, warnings);

    let settings = merge_settings(global.as_ref(), project.as_ref(), warnings);
    let inserts = merge_inserts(global.as_ref(), project.as_ref(), warnings);

    if !settings.enabled {
        return MergedConfig {
            settings,
            inserts,
            subscriptions: Vec::new(),
        };
    }

    let global_subs = global.map(|c| c.subscriptions).unwrap_or_default();
    let project_subs = project.map(|c| c.subscriptions).unwrap_or_default();
    let subscriptions = merge_subscriptions(
        global_subs,
        project_subs,
        settings.disable_global,
        warnings,
    );

    MergedConfig {
        settings,
        inserts,
        subscriptions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write(dir: &Path, name: &str, value: &Value) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, serde_json::to_string(value).unwrap()).unwrap();
        path
    }

    #[test]
    fn missing_files_yield_defaults_without_warnings() {
        let td = tempfile::tempdir().unwrap();
        let mut warnings = vec![];
        let merged = load_and_merge(
            &td.path().join("global.json"),
            &td.path().join("project.json"),
            &mut warnings,
        );
        assert!(warnings.is_empty());
        assert_eq!(merged.settings, Settings::default());
        assert!(merged.subscriptions.is_empty());
    }

    #[test]
    fn malformed_json_warns() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("global.json");
        fs::write(&path, "{ not json").unwrap();
        let mut warnings = vec![];
        let cfg = load_config_file(&path, &mut warnings);
        assert!(cfg.is_none());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn settings_override_per_key() {
        let td = tempfile::tempdir().unwrap();
        let global = write(
            td.path(),
            "global.json",
            &json!({"settings": {"enabled": true, "showConsoleEcho": false}}),
        );
        let project = write(
            td.path(),
            "project.json",
            &json!({"settings": {"showConsoleEcho": true}}),
        );
        let mut warnings = vec![];
        let global_cfg = load_config_file(&global, &mut warnings);
        let project_cfg = load_config_file(&project, &mut warnings);
        let settings = merge_settings(global_cfg.as_ref(), project_cfg.as_ref(), &mut warnings);
        assert!(settings.enabled);
        assert!(settings.show_console_echo);
    }

    #[test]
    fn broad_override_disables_all_matching_global_subs() {
        let global = vec![Subscription {
            insert: Some("ctx".into()),
            on: Some("foo".into()),
            when: Some("pre".into()),
            enabled: true,
            conditions: vec![],
            inherit_conditions: true,
            inject: None,
            scope: Scope::Global,
        }];
        let project = vec![Subscription {
            insert: Some("ctx".into()),
            on: None,
            when: None,
            enabled: false,
            conditions: vec![],
            inherit_conditions: true,
            inject: None,
            scope: Scope::Project,
        }];
        let mut warnings = vec![];
        let merged = merge_subscriptions(global, project, false, &mut warnings);
        assert!(merged.is_empty());
    }

    #[test]
    fn specific_override_disables_only_exact_triple() {
        let global = vec![
            Subscription {
                insert: Some("ctx".into()),
                on: Some("foo".into()),
                when: Some("pre".into()),
                enabled: true,
                conditions: vec![],
                inherit_conditions: true,
                inject: None,
                scope: Scope::Global,
            },
            Subscription {
                insert: Some("ctx".into()),
                on: Some("bar".into()),
                when: Some("pre".into()),
                enabled: true,
                conditions: vec![],
                inherit_conditions: true,
                inject: None,
                scope: Scope::Global,
            },
        ];
        let project = vec![Subscription {
            insert: Some("ctx".into()),
            on: Some("foo".into()),
            when: Some("pre".into()),
            enabled: false,
            conditions: vec![],
            inherit_conditions: true,
            inject: None,
            scope: Scope::Project,
        }];
        let mut warnings = vec![];
        let merged = merge_subscriptions(global, project, false, &mut warnings);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].on(), "bar");
    }

    #[test]
    fn dedup_keeps_project_and_preserves_order() {
        let global = vec![
            Subscription {
                insert: Some("a".into()),
                on: Some("x".into()),
                when: Some("pre".into()),
                enabled: true,
                conditions: vec![json!({"envSet": "GLOBAL"})],
                inherit_conditions: true,
                inject: None,
                scope: Scope::Global,
            },
            Subscription {
                insert: Some("b".into()),
                on: Some("y".into()),
                when: Some("pre".into()),
                enabled: true,
                conditions: vec![],
                inherit_conditions: true,
                inject: None,
                scope: Scope::Global,
            },
        ];
        let project = vec![Subscription {
            insert: Some("a".into()),
            on: Some("x".into()),
            when: Some("pre".into()),
            enabled: true,
            conditions: vec![json!({"envSet": "PROJECT"})],
            inherit_conditions: true,
            inject: None,
            scope: Scope::Project,
        }];
        let mut warnings = vec![];
        let merged = merge_subscriptions(global, project, false, &mut warnings);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].insert.as_deref(), Some("a"));
        assert_eq!(merged[0].conditions, vec![json!({"envSet": "PROJECT"})]);
        assert_eq!(merged[1].insert.as_deref(), Some("b"));
        assert!(warnings.iter().any(|w| w.contains("using project version")));
    }

    #[test]
    fn disable_global_drops_all_global_subs() {
        let global = vec![Subscription {
            insert: Some("a".into()),
            on: Some("x".into()),
            when: Some("pre".into()),
            enabled: true,
            conditions: vec![],
            inherit_conditions: true,
            inject: None,
            scope: Scope::Global,
        }];
        let mut warnings = vec![];
        let merged = merge_subscriptions(global, Vec::new(), true, &mut warnings);
        assert!(merged.is_empty());
    }
}
