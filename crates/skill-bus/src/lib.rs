//! # skill-bus
//!
//! Core dispatch orchestration for the skill-bus event bus: wires config
//! loading ([`skill_bus_config`]) into condition resolution and matching
//! ([`skill_bus_matcher`]) into output assembly ([`skill_bus_assembler`]),
//! with best-effort telemetry ([`skill_bus_events`]) along the way.
//!
//! ## Pipeline
//!
//! [`dispatch`] is the single entrypoint. For one skill event it:
//!
//! 1. Loads and merges the global and project config files.
//! 2. Resolves condition-gated subscriptions and matches them against the
//!    requested skill name and timing.
//! 3. Assembles the matched inserts into one `hookSpecificOutput` document,
//!    appending a completion-trigger instruction when applicable.
//! 4. Logs `match`/`condition_skip`/`no_match`/`skill_complete` telemetry
//!    when `telemetry` is enabled in settings.
//!
//! ## Modules
//!
//! - [`skill_bus_config`] — config file loading and merging
//! - [`skill_bus_condition`] — condition evaluation
//! - [`skill_bus_matcher`] — condition resolution and subscription matching
//! - [`skill_bus_assembler`] — output assembly, dynamic handlers, completion trigger
//! - [`skill_bus_events`] — JSONL telemetry log
//! - [`skill_bus_git`] — current-branch lookup used by the `gitBranch` condition

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub use skill_bus_assembler::DynamicHandler;
pub use skill_bus_types::{DispatchOutput, Settings, Source, Timing};

/// Soft deadline after which a dispatch warns that context may be
/// incomplete — mirrors the host's ~5s hook timeout with a 1s margin.
const SOFT_DEADLINE_SECS: f64 = 4.0;

/// Everything one `dispatch()` call needs beyond config defaults.
pub struct DispatchRequest<'a> {
    pub skill_name: &'a str,
    pub timing: Timing,
    pub source: Source,
    pub cwd: PathBuf,
}

/// State threaded through a single dispatch: warnings, the git-branch
/// cache, and the dynamic-handler registry. Kept as an explicit struct
/// (not globals) so tests can run multiple dispatches per process.
pub struct Dispatch {
    warnings: Vec<String>,
    branch_cache: HashMap<PathBuf, Option<String>>,
    handlers: HashMap<&'static str, DynamicHandler>,
}

impl Default for Dispatch {
    fn default() -> Self {
        let mut handlers: HashMap<&'static str, DynamicHandler> = HashMap::new();
        handlers.insert("session-stats", session_stats_handler as DynamicHandler);
        Self {
            warnings: Vec::new(),
            branch_cache: HashMap::new(),
            handlers,
        }
    }
}

impl Dispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an additional dynamic insert handler (or overwrite a
    /// built-in one, e.g. `session-stats`, in tests).
    pub fn register_handler(&mut self, name: &'static str, handler: DynamicHandler) {
        self.handlers.insert(name, handler);
    }
}

fn session_stats_handler(cwd: &Path, settings: &Settings) -> Option<String> {
    let events = skill_bus_events::read_telemetry(cwd, settings, None, None);
    if events.is_empty() {
        return None;
    }

    let matches: Vec<_> = events
        .iter()
        .filter(|e| e.event == skill_bus_events::EventKind::Match)
        .collect();
    let skips: Vec<_> = events
        .iter()
        .filter(|e| e.event == skill_bus_events::EventKind::ConditionSkip)
        .collect();
    let no_match: Vec<_> = events
        .iter()
        .filter(|e| e.event == skill_bus_events::EventKind::NoMatch)
        .collect();

    let matched_skills: std::collections::HashSet<&str> =
        matches.iter().map(|m| m.skill.as_deref().unwrap_or("?")).collect();

    let mut lines = vec!["[skill-bus session summary]".to_string()];
    lines.push(format!(
        "Skills intercepted: {} | Inserts injected: {}",
        matched_skills.len(),
        matches.len()
    ));

    if !skips.is_empty() {
        let mut by_insert: HashMap<&str, u32> = HashMap::new();
        for s in &skips {
            *by_insert.entry(s.insert.as_deref().unwrap_or("?")).or_insert(0) += 1;
        }
        let parts: Vec<String> = by_insert.iter().map(|(ins, cnt)| format!("{ins} ({cnt}x)")).collect();
        lines.push(format!("Condition skips: {}", parts.join(", ")));
    }

    if !no_match.is_empty() {
        let mut by_skill: HashMap<&str, u32> = HashMap::new();
        for n in &no_match {
            *by_skill.entry(n.skill.as_deref().unwrap_or("?")).or_insert(0) += 1;
        }
        let mut gaps: Vec<(&str, u32)> = by_skill.into_iter().filter(|(_, c)| *c >= 3).collect();
        if !gaps.is_empty() {
            gaps.sort_by(|a, b| b.1.cmp(&a.1));
            lines.push("Gaps:".to_string());
            for (skill, count) in gaps {
                lines.push(format!("  {skill} ran {count}x with no subscriptions"));
                lines.push(format!("  Suggestion: add a subscription for {skill}"));
            }
        }
    }

    Some(lines.join("\n"))
}

/// Parse the `_SB_CHAIN_DEPTH` environment variable set by the shell
/// wrapper on recursive completion dispatches. Invalid values default to
/// 0 and are reported through `warnings`.
fn parse_chain_depth(warnings: &mut Vec<String>) -> u32 {
    match std::env::var("_SB_CHAIN_DEPTH") {
        Err(_) => 0,
        Ok(raw) => match raw.parse::<u32>() {
            Ok(n) => n,
            Err(_) => {
                warnings.push(format!("invalid _SB_CHAIN_DEPTH={raw:?}, defaulting to 0"));
                0
            }
        },
    }
}

/// Run one dispatch. Returns `None` when there is nothing to print at all
/// (disabled, gated, or no matches and no warnings) — the caller should
/// simply exit without writing to stdout in that case.
pub fn dispatch(req: &DispatchRequest, state: &mut Dispatch) -> Option<DispatchOutput> {
    let start = Instant::now();
    state.warnings.clear();
    state.branch_cache.clear();

    tracing::debug!(skill = req.skill_name, timing = req.timing.as_str(), source = req.source.as_str(), "dispatch start");

    let global_path = skill_bus_config::default_global_config_path();
    let project_path = skill_bus_config::project_config_path(&req.cwd);
    let mut merged = skill_bus_config::load_and_merge(&global_path, &project_path, &mut state.warnings);

    let old_format_count = merged.subscriptions.iter().filter(|s| s.is_old_format()).count();
    if old_format_count > 0 {
        state.warnings.push(format!(
            "{old_format_count} subscription(s) use old 'inject' format — skipped. \
Migrate: extract inject text into an insert, replace 'inject' with 'insert' reference."
        ));
        merged.subscriptions.retain(|s| !s.is_old_format());
    }

    if !merged.settings.enabled {
        return Some(DispatchOutput {
            hook_specific_output: None,
            system_message: Some(
                "[skill-bus] Disabled via settings. Run /skill-bus:unpause-subs to re-enable.".to_string(),
            ),
        });
    }

    if req.timing == Timing::Complete && !merged.settings.completion_hooks {
        return None;
    }

    let cwd = Some(req.cwd.as_path());
    let match_outcome = match req.source {
        Source::Prompt => skill_bus_matcher::match_prompt(
            req.skill_name,
            &merged.subscriptions,
            &merged.inserts,
            &merged.settings,
            cwd,
            &mut state.branch_cache,
            &mut state.warnings,
        ),
        Source::Tool => skill_bus_matcher::match_tool(
            req.skill_name,
            req.timing,
            &merged.subscriptions,
            &merged.inserts,
            &merged.settings,
            cwd,
            &mut state.branch_cache,
            &mut state.warnings,
        ),
    };

    let mut completion_instruction = None;
    if req.timing == Timing::Pre && merged.settings.completion_hooks {
        if skill_bus_matcher::has_matching_complete_subscription(req.skill_name, &merged.subscriptions) {
            let depth = parse_chain_depth(&mut state.warnings);
            completion_instruction =
                Some(skill_bus_assembler::completion_instruction(req.skill_name, depth));
        }
    }

    if merged.settings.telemetry {
        for sub in &match_outcome.matched {
            skill_bus_events::log_event(
                &req.cwd,
                &merged.settings,
                skill_bus_events::event(skill_bus_events::EventKind::Match)
                    .skill(req.skill_name)
                    .insert(sub.insert.clone().unwrap_or_default())
                    .timing(req.timing.as_str())
                    .source(req.source.as_str()),
            );
        }
        for skip in &match_outcome.condition_skips {
            skill_bus_events::log_event(
                &req.cwd,
                &merged.settings,
                skill_bus_events::event(skill_bus_events::EventKind::ConditionSkip)
                    .skill(skip.skill.clone())
                    .insert(skip.insert.clone())
                    .pattern(skip.pattern.clone()),
            );
        }
        if req.timing == Timing::Complete && !match_outcome.matched.is_empty() {
            skill_bus_events::log_event(
                &req.cwd,
                &merged.settings,
                skill_bus_events::event(skill_bus_events::EventKind::SkillComplete)
                    .skill(req.skill_name)
                    .timing("complete")
                    .source(req.source.as_str()),
            );
        }
        if match_outcome.matched.is_empty() && merged.settings.observe_unmatched {
            skill_bus_events::log_event(
                &req.cwd,
                &merged.settings,
                skill_bus_events::event(skill_bus_events::EventKind::NoMatch)
                    .skill(req.skill_name)
                    .timing(req.timing.as_str())
                    .source(req.source.as_str()),
            );
        }
    }

    if match_outcome.matched.is_empty() && state.warnings.is_empty() && completion_instruction.is_none() {
        return None;
    }

    let elapsed = start.elapsed().as_secs_f64();
    if elapsed > SOFT_DEADLINE_SECS {
        tracing::warn!(elapsed, "dispatch exceeded soft deadline");
        state.warnings.push(format!(
            "dispatch took {elapsed:.1}s (5s timeout), context may be incomplete"
        ));
    }

    let assemble_input = skill_bus_assembler::AssembleInput {
        matched: &match_outcome.matched,
        timing: req.timing,
        source: req.source,
        settings: &merged.settings,
        inserts: &merged.inserts,
        cwd: &req.cwd,
        handlers: &state.handlers,
    };
    let mut output = skill_bus_assembler::build_output(assemble_input, &mut state.warnings);

    if let Some(out) = &mut output {
        skill_bus_assembler::append_truncation_note(out, &state.warnings);
    }

    if let Some(instruction) = completion_instruction {
        output = Some(skill_bus_assembler::inject_completion(
            output,
            &instruction,
            req.source,
            &state.warnings,
        ));
    } else if output.is_none() && !state.warnings.is_empty() {
        output = Some(DispatchOutput {
            hook_specific_output: None,
            system_message: Some(state.warnings.join(" | ")),
        });
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_project_config(cwd: &Path, value: &serde_json::Value) {
        let dir = cwd.join(".claude");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("skill-bus.json"), serde_json::to_string(value).unwrap()).unwrap();
    }

    #[test]
    fn no_config_yields_no_output() {
        let td = tempfile::tempdir().unwrap();
        temp_env::with_var("SKILL_BUS_GLOBAL_CONFIG", Some(td.path().join("nope.json").to_str().unwrap()), || {
            let mut state = Dispatch::new();
            let req = DispatchRequest {
                skill_name: "foo",
                timing: Timing::Pre,
                source: Source::Tool,
                cwd: td.path().to_path_buf(),
            };
            assert!(dispatch(&req, &mut state).is_none());
        });
    }

    #[test]
    fn basic_match_produces_output() {
        let td = tempfile::tempdir().unwrap();
        write_project_config(
            td.path(),
            &serde_json::json!({
                "inserts": {"ctx": {"text": "hello"}},
                "subscriptions": [{"insert": "ctx", "on": "foo", "when": "pre"}]
            }),
        );
        temp_env::with_var("SKILL_BUS_GLOBAL_CONFIG", Some(td.path().join("nope.json").to_str().unwrap()), || {
            let mut state = Dispatch::new();
            let req = DispatchRequest {
                skill_name: "foo",
                timing: Timing::Pre,
                source: Source::Tool,
                cwd: td.path().to_path_buf(),
            };
            let output = dispatch(&req, &mut state).expect("should match");
            let hso = output.hook_specific_output.expect("has context");
            assert_eq!(hso.additional_context, "hello");
        });
    }

    #[test]
    fn complete_timing_gated_without_completion_hooks() {
        let td = tempfile::tempdir().unwrap();
        write_project_config(
            td.path(),
            &serde_json::json!({
                "inserts": {"ctx": {"text": "hello"}},
                "subscriptions": [{"insert": "ctx", "on": "foo", "when": "complete"}]
            }),
        );
        temp_env::with_var("SKILL_BUS_GLOBAL_CONFIG", Some(td.path().join("nope.json").to_str().unwrap()), || {
            let mut state = Dispatch::new();
            let req = DispatchRequest {
                skill_name: "foo",
                timing: Timing::Complete,
                source: Source::Tool,
                cwd: td.path().to_path_buf(),
            };
            assert!(dispatch(&req, &mut state).is_none());
        });
    }

    #[test]
    fn completion_hooks_inject_trigger_instruction() {
        let td = tempfile::tempdir().unwrap();
        write_project_config(
            td.path(),
            &serde_json::json!({
                "settings": {"completionHooks": true},
                "inserts": {"ctx": {"text": "hello"}},
                "subscriptions": [
                    {"insert": "ctx", "on": "foo", "when": "pre"},
                    {"insert": "ctx", "on": "foo", "when": "complete"}
                ]
            }),
        );
        temp_env::with_var("SKILL_BUS_GLOBAL_CONFIG", Some(td.path().join("nope.json").to_str().unwrap()), || {
            let mut state = Dispatch::new();
            let req = DispatchRequest {
                skill_name: "foo",
                timing: Timing::Pre,
                source: Source::Tool,
                cwd: td.path().to_path_buf(),
            };
            let output = dispatch(&req, &mut state).expect("should match");
            let hso = output.hook_specific_output.expect("has context");
            assert!(hso.additional_context.contains("COMPLETION TRIGGER"));
        });
    }

    #[test]
    fn old_format_subscriptions_are_filtered_before_matching_not_at_cap() {
        let td = tempfile::tempdir().unwrap();
        write_project_config(
            td.path(),
            &serde_json::json!({
                "settings": {"maxMatchesPerSkill": 2},
                "inserts": {"a": {"text": "a"}, "b": {"text": "b"}, "c": {"text": "c"}},
                "subscriptions": [
                    {"insert": "a", "on": "foo", "when": "pre"},
                    {"inject": {"text": "legacy"}, "on": "foo", "when": "pre"},
                    {"insert": "b", "on": "foo", "when": "pre"},
                    {"insert": "c", "on": "foo", "when": "pre"}
                ]
            }),
        );
        temp_env::with_var("SKILL_BUS_GLOBAL_CONFIG", Some(td.path().join("nope.json").to_str().unwrap()), || {
            let mut state = Dispatch::new();
            let req = DispatchRequest {
                skill_name: "foo",
                timing: Timing::Pre,
                source: Source::Tool,
                cwd: td.path().to_path_buf(),
            };
            let output = dispatch(&req, &mut state).expect("should match");
            let hso = output.hook_specific_output.expect("has context");
            // The old-format sub never occupies a cap slot, so both real
            // subs ("a" and "b") survive the cap of 2 — "c" is the one
            // truncated, not "b".
            assert!(hso.additional_context.contains('a'));
            assert!(hso.additional_context.contains('b'));
            let msg = output.system_message.unwrap_or_default();
            assert!(msg.contains("1 subscription(s) use old 'inject' format"));
        });
    }
}
