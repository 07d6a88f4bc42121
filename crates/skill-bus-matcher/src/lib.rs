//! Condition resolution (component C) and subscription matching
//! (component D).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use skill_bus_condition::ConditionContext;
use skill_bus_types::{Insert, Settings, Subscription, Timing};

/// Resolve the effective, ordered condition list for a subscription:
/// insert-level conditions first (unless opted out via
/// `inheritConditions: false`), then the subscription's own conditions.
/// Missing inserts contribute no conditions — the dangling reference is
/// reported later, at output-assembly time.
pub fn resolve_effective_conditions(
    sub: &Subscription,
    inserts: &HashMap<String, Insert>,
) -> Vec<serde_json::Value> {
    let mut effective = Vec::new();
    if sub.inherit_conditions {
        if let Some(name) = &sub.insert {
            if let Some(insert) = inserts.get(name) {
                effective.extend(insert.conditions.iter().cloned());
            }
        }
    }
    effective.extend(sub.conditions.iter().cloned());
    effective
}

/// A condition that failed, recorded so the caller can decide whether to
/// write it to telemetry.
#[derive(Debug, Clone)]
pub struct ConditionSkip {
    pub skill: String,
    pub insert: String,
    pub pattern: String,
}

#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub matched: Vec<Subscription>,
    pub truncated: bool,
    pub total_matching: usize,
    pub condition_skips: Vec<ConditionSkip>,
}

fn show_condition_skips(settings: &Settings) -> bool {
    settings.show_condition_skips || std::env::var("SKILL_BUS_DEBUG").as_deref() == Ok("1")
}

struct Gate<'a> {
    max_matches: usize,
    cwd: Option<&'a Path>,
    branch_cache: &'a mut HashMap<PathBuf, Option<String>>,
    warnings: &'a mut Vec<String>,
}

fn conditions_pass(
    sub: &Subscription,
    inserts: &HashMap<String, Insert>,
    gate: &mut Gate,
) -> Result<(), ()> {
    let effective = resolve_effective_conditions(sub, inserts);
    if effective.is_empty() {
        return Ok(());
    }
    let Some(cwd) = gate.cwd else {
        gate.warnings
            .push("conditions present but no CWD, skipping subscription".to_string());
        return Err(());
    };
    let mut ctx = ConditionContext {
        cwd,
        warnings: gate.warnings,
        branch_cache: gate.branch_cache,
    };
    if skill_bus_condition::evaluate_all(&effective, &mut ctx) {
        Ok(())
    } else {
        Err(())
    }
}

/// Match subscriptions for a tool-invoked skill event: `when` must equal
/// the requested timing exactly, `on` is glob-matched against the skill
/// name verbatim.
#[allow(clippy::too_many_arguments)]
pub fn match_tool(
    skill_name: &str,
    timing: Timing,
    subscriptions: &[Subscription],
    inserts: &HashMap<String, Insert>,
    settings: &Settings,
    cwd: Option<&Path>,
    branch_cache: &mut HashMap<PathBuf, Option<String>>,
    warnings: &mut Vec<String>,
) -> MatchOutcome {
    let max_matches = settings.max_matches_per_skill as usize;
    let mut outcome = MatchOutcome::default();
    let mut gate = Gate { max_matches, cwd, branch_cache, warnings };

    for sub in subscriptions {
        let Some(when) = Timing::parse(sub.when()) else {
            gate.warnings.push(format!(
                "subscription '{}' has invalid 'when' value: {:?}. Use 'pre', 'post', or 'complete'.",
                sub.insert.as_deref().unwrap_or("unnamed"),
                sub.when()
            ));
            continue;
        };
        if when != timing {
            continue;
        }
        if !glob_matches(sub.on(), skill_name) {
            continue;
        }
        record_candidate(sub, skill_name, None, inserts, &mut gate, &mut outcome);
    }

    finish(settings, &mut outcome, &mut gate);
    outcome
}

/// Match subscriptions for a prompt-sourced slash command. Only
/// `when == pre` participates. Unprefixed skill names match a pattern's
/// suffix after `:` (excluding catch-all suffixes `*`/`**`); namespaced
/// skill names match the pattern as-is.
#[allow(clippy::too_many_arguments)]
pub fn match_prompt(
    cmd_name: &str,
    subscriptions: &[Subscription],
    inserts: &HashMap<String, Insert>,
    settings: &Settings,
    cwd: Option<&Path>,
    branch_cache: &mut HashMap<PathBuf, Option<String>>,
    warnings: &mut Vec<String>,
) -> MatchOutcome {
    let max_matches = settings.max_matches_per_skill as usize;
    let mut outcome = MatchOutcome::default();
    let mut gate = Gate { max_matches, cwd, branch_cache, warnings };
    let has_prefix = cmd_name.contains(':');

    for sub in subscriptions {
        if sub.when() != "pre" {
            continue;
        }
        let pattern = sub.on();
        let matched = if has_prefix {
            glob_matches(pattern, cmd_name)
        } else if let Some((_, suffix)) = pattern.split_once(':') {
            if suffix == "*" || suffix == "**" {
                false
            } else {
                glob_matches(suffix, cmd_name)
            }
        } else {
            glob_matches(pattern, cmd_name)
        };
        if !matched {
            continue;
        }
        record_candidate(sub, cmd_name, Some("prompt"), inserts, &mut gate, &mut outcome);
    }

    finish(settings, &mut outcome, &mut gate);
    outcome
}

fn record_candidate(
    sub: &Subscription,
    skill_name: &str,
    _source: Option<&str>,
    inserts: &HashMap<String, Insert>,
    gate: &mut Gate,
    outcome: &mut MatchOutcome,
) {
    let insert_name = sub.insert.clone().unwrap_or_else(|| "unnamed".to_string());
    if conditions_pass(sub, inserts, gate).is_err() {
        outcome.condition_skips.push(ConditionSkip {
            skill: skill_name.to_string(),
            insert: insert_name,
            pattern: sub.on().to_string(),
        });
        return;
    }
    outcome.total_matching += 1;
    if outcome.matched.len() < gate.max_matches {
        outcome.matched.push(sub.clone());
    }
}

fn finish(settings: &Settings, outcome: &mut MatchOutcome, gate: &mut Gate) {
    if outcome.total_matching > gate.max_matches {
        outcome.truncated = true;
        gate.warnings.push(format!(
            "{} subs matched but maxMatchesPerSkill={}, showing first {}",
            outcome.total_matching, gate.max_matches, gate.max_matches
        ));
    }
    if !outcome.condition_skips.is_empty() && show_condition_skips(settings) {
        let names: Vec<&str> = outcome.condition_skips.iter().map(|s| s.insert.as_str()).collect();
        gate.warnings.push(format!(
            "conditions not met, skipped: {}",
            names.join(", ")
        ));
    }
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(candidate))
        .unwrap_or(false)
}

/// Whether `skill_name` has at least one `when == complete` subscription
/// whose pattern matches — used to decide whether to inject the
/// completion-trigger instruction (component E).
pub fn has_matching_complete_subscription(skill_name: &str, subscriptions: &[Subscription]) -> bool {
    subscriptions
        .iter()
        .any(|s| s.when() == "complete" && glob_matches(s.on(), skill_name))
}
