//! Condition evaluation (component A).
//!
//! A condition is a JSON object with exactly one key naming its kind. We
//! take the raw [`serde_json::Value`] rather than a strict enum so a
//! malformed shape degrades to "warn and evaluate false" instead of
//! aborting config load — see `skill-bus-types` for the rationale.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

const MAX_FILE_CONTAINS_BYTES: u64 = 1_000_000;
const MAX_REGEX_PATTERN_LEN: usize = 500;

/// Threaded through one dispatch: the git-branch cache and the warning
/// channel. Kept as explicit fields (not globals) so multiple dispatches
/// can run in one process — e.g. in tests — without leaking state.
pub struct ConditionContext<'a> {
    pub cwd: &'a Path,
    pub warnings: &'a mut Vec<String>,
    pub branch_cache: &'a mut HashMap<PathBuf, Option<String>>,
}

impl<'a> ConditionContext<'a> {
    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    fn branch(&mut self) -> Option<String> {
        let key = self.cwd.to_path_buf();
        if let Some(cached) = self.branch_cache.get(&key) {
            return cached.clone();
        }
        let branch = skill_bus_git::current_branch(&key);
        self.branch_cache.insert(key, branch.clone());
        branch
    }
}

fn resolve_path(raw: &str, cwd: &Path) -> PathBuf {
    let expanded = expand_tilde(raw);
    if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    }
}

fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return Path::new(&home).join(rest);
        }
    } else if raw == "~" {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home);
        }
    }
    PathBuf::from(raw)
}

/// Evaluate a single raw condition value. Always returns a boolean — never
/// propagates an error; malformed shapes warn and return `false`.
pub fn evaluate(value: &serde_json::Value, ctx: &mut ConditionContext) -> bool {
    let obj = match value.as_object() {
        Some(obj) if obj.len() == 1 => obj,
        _ => {
            ctx.warn(format!("malformed condition {value}, treating as false"));
            return false;
        }
    };
    let (kind, arg) = obj.iter().next().expect("len checked above");

    match kind.as_str() {
        "not" => eval_not(arg, ctx),
        "fileExists" => eval_file_exists(arg, ctx),
        "gitBranch" => eval_git_branch(arg, ctx),
        "envSet" => eval_env_set(arg, ctx),
        "envEquals" => eval_env_equals(arg, ctx),
        "fileContains" => eval_file_contains(arg, ctx),
        other => {
            ctx.warn(format!("unknown condition kind '{other}', treating as false"));
            false
        }
    }
}

fn eval_not(arg: &serde_json::Value, ctx: &mut ConditionContext) -> bool {
    if !arg.is_object() {
        ctx.warn(format!(
            "'not' condition must wrap a condition object, got {arg}"
        ));
        return false;
    }
    if arg.as_object().map(|o| o.contains_key("not")).unwrap_or(false) {
        ctx.warn("double negation in condition — likely a mistake");
    }
    !evaluate(arg, ctx)
}

fn eval_file_exists(arg: &serde_json::Value, ctx: &mut ConditionContext) -> bool {
    let Some(raw) = arg.as_str() else {
        ctx.warn(format!("fileExists requires a string path, got {arg}"));
        return false;
    };
    resolve_path(raw, ctx.cwd).exists()
}

fn eval_git_branch(arg: &serde_json::Value, ctx: &mut ConditionContext) -> bool {
    let Some(pattern) = arg.as_str() else {
        ctx.warn(format!("gitBranch requires a string glob, got {arg}"));
        return false;
    };
    let Some(branch) = ctx.branch() else {
        return false;
    };
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(&branch),
        Err(e) => {
            ctx.warn(format!("gitBranch pattern '{pattern}' is invalid: {e}"));
            false
        }
    }
}

fn eval_env_set(arg: &serde_json::Value, ctx: &mut ConditionContext) -> bool {
    let Some(name) = arg.as_str() else {
        ctx.warn(format!("envSet requires a string variable name, got {arg}"));
        return false;
    };
    std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false)
}

fn eval_env_equals(arg: &serde_json::Value, ctx: &mut ConditionContext) -> bool {
    let Some(obj) = arg.as_object() else {
        ctx.warn(format!(
            "envEquals requires {{\"var\": ..., \"value\": ...}}, got {arg}"
        ));
        return false;
    };
    let Some(var) = obj.get("var").and_then(|v| v.as_str()) else {
        ctx.warn("envEquals missing 'var' field");
        return false;
    };
    let Some(value_field) = obj.get("value") else {
        ctx.warn("envEquals missing 'value' field");
        return false;
    };
    let Some(expected) = value_field.as_str() else {
        ctx.warn(format!(
            "envEquals 'value' must be a string, got {value_field}. Use \"3000\" not 3000."
        ));
        return false;
    };
    std::env::var(var).map(|v| v == expected).unwrap_or(false)
}

fn eval_file_contains(arg: &serde_json::Value, ctx: &mut ConditionContext) -> bool {
    let Some(obj) = arg.as_object() else {
        ctx.warn(format!(
            "fileContains requires {{\"file\": ..., \"pattern\": ...}}, got {arg}"
        ));
        return false;
    };
    let Some(file) = obj.get("file").and_then(|v| v.as_str()) else {
        ctx.warn("fileContains missing 'file' or 'pattern' field");
        return false;
    };
    let Some(pattern) = obj.get("pattern").and_then(|v| v.as_str()) else {
        ctx.warn("fileContains missing 'file' or 'pattern' field");
        return false;
    };
    let use_regex = obj.get("regex").and_then(|v| v.as_bool()).unwrap_or(false);

    let compiled = if use_regex {
        if pattern.len() > MAX_REGEX_PATTERN_LEN {
            ctx.warn("fileContains regex pattern too long (>500 chars), skipping");
            return false;
        }
        match regex::Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                ctx.warn(format!("fileContains regex error: {e}"));
                return false;
            }
        }
    } else {
        None
    };

    let path = resolve_path(file, ctx.cwd);
    if path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with('.')) {
        ctx.warn(format!("fileContains references dotfile '{file}' — ensure this is intentional"));
    }
    if !path.is_file() {
        return false;
    }
    let Ok(meta) = std::fs::metadata(&path) else {
        return false;
    };
    if meta.len() > MAX_FILE_CONTAINS_BYTES {
        ctx.warn(format!(
            "fileContains skipped — file exceeds 1MiB size limit: {file}"
        ));
        return false;
    }
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return false;
    };
    for line in contents.lines() {
        let hit = match &compiled {
            Some(re) => re.is_match(line),
            None => line.contains(pattern),
        };
        if hit {
            return true;
        }
    }
    false
}

/// Evaluate a list of conditions as a left-to-right, short-circuit AND.
/// An empty list is vacuously true.
pub fn evaluate_all(conditions: &[serde_json::Value], ctx: &mut ConditionContext) -> bool {
    for condition in conditions {
        if !evaluate(condition, ctx) {
            return false;
        }
    }
    true
}
