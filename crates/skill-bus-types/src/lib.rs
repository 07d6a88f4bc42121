//! Core domain types for skill-bus.
//!
//! This crate defines the data model shared by every component of the
//! dispatcher: [`Settings`], [`Insert`], [`Subscription`], the raw JSON
//! condition representation, and the output document shape that goes back
//! to the host on stdout.
//!
//! Conditions are kept as raw [`serde_json::Value`] inside [`Insert`] and
//! [`Subscription`] rather than a strict enum: a malformed condition must
//! fail closed (warn, evaluate to `false`) without aborting the whole
//! config load, so parsing into a typed `Condition` happens lazily, at
//! evaluation time, in `skill-bus-condition`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scope a subscription survived the merge from. Not part of the wire
/// format — the merger tags each subscription with it and callers (the
/// matcher, the CLI's `list` subcommand) read it back without re-running
/// the merge, per the "scope attribution recoverable" requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    Global,
    Project,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Project => "project",
        }
    }
}

/// Lifecycle phase a subscription fires at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    Pre,
    Post,
    Complete,
}

impl Timing {
    /// Parse a `when` value. Returns `None` for anything outside
    /// `{pre, post, complete}` — the caller is responsible for warning
    /// and skipping, per spec.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pre" => Some(Timing::Pre),
            "post" => Some(Timing::Post),
            "complete" => Some(Timing::Complete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timing::Pre => "pre",
            Timing::Post => "post",
            Timing::Complete => "complete",
        }
    }
}

/// Where the skill event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Source {
    #[default]
    Tool,
    Prompt,
}

impl Source {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "tool" => Some(Source::Tool),
            "prompt" => Some(Source::Prompt),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Tool => "tool",
            Source::Prompt => "prompt",
        }
    }
}

/// Merged settings. Deserialization is permissive by design (see
/// `skill-bus-config`): a malformed value for a given key is replaced with
/// its default and a warning, rather than failing the whole config load.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub enabled: bool,
    pub max_matches_per_skill: u32,
    pub show_console_echo: bool,
    pub disable_global: bool,
    pub monitor_slash_commands: bool,
    pub show_condition_skips: bool,
    pub telemetry: bool,
    pub observe_unmatched: bool,
    pub completion_hooks: bool,
    pub telemetry_path: String,
    pub max_log_size_kb: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_matches_per_skill: 3,
            show_console_echo: true,
            disable_global: false,
            monitor_slash_commands: false,
            show_condition_skips: false,
            telemetry: false,
            observe_unmatched: false,
            completion_hooks: false,
            telemetry_path: String::new(),
            max_log_size_kb: 512,
        }
    }
}

/// A named chunk of injectable text.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Insert {
    pub text: Option<String>,
    #[serde(default)]
    pub conditions: Vec<serde_json::Value>,
    pub dynamic: Option<String>,
}

/// A rule tying a skill-name glob pattern to an insert.
///
/// `on` and `when` are kept as `Option<String>` (rather than defaulted at
/// parse time) so the merger can tell a broad override directive
/// (`insert` only) apart from a specific one (`insert` + `on` + `when`) —
/// both collapse to the same defaulted values once read through [`on`](Self::on)
/// and [`when`](Self::when).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub insert: Option<String>,
    pub on: Option<String>,
    pub when: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<serde_json::Value>,
    #[serde(default = "default_true", rename = "inheritConditions")]
    pub inherit_conditions: bool,
    /// Old-format field. Its presence alongside a missing `insert` marks a
    /// subscription that predates the insert-reference format.
    pub inject: Option<serde_json::Value>,
    /// Populated by the merger, never serialized back out.
    #[serde(skip)]
    pub scope: Scope,
}

fn default_true() -> bool {
    true
}

impl Subscription {
    pub fn on(&self) -> &str {
        self.on.as_deref().unwrap_or("")
    }

    pub fn when(&self) -> &str {
        self.when.as_deref().unwrap_or("pre")
    }

    /// A subscription with `enabled: false` that carries an `insert` is an
    /// override directive (broad or specific depending on whether `on`/`when`
    /// are present), not an active rule.
    pub fn is_override_directive(&self) -> bool {
        !self.enabled && self.insert.is_some()
    }

    /// A broad override directive suppresses every global subscription for
    /// its insert, regardless of `on`/`when`.
    pub fn is_broad_override(&self) -> bool {
        self.is_override_directive() && (self.on.is_none() || self.when.is_none())
    }

    /// Old-format subscription: carries `inject` but no `insert`.
    pub fn is_old_format(&self) -> bool {
        self.inject.is_some() && self.insert.is_none()
    }

    pub fn dedup_key(&self) -> (String, String, String) {
        (
            self.insert.clone().unwrap_or_default(),
            self.on().to_string(),
            self.when().to_string(),
        )
    }
}

/// One `hookSpecificOutput` + `systemMessage` document, printed as a single
/// line of JSON on stdout.
#[derive(Debug, Clone, Serialize, Default)]
pub struct DispatchOutput {
    #[serde(rename = "hookSpecificOutput", skip_serializing_if = "Option::is_none")]
    pub hook_specific_output: Option<HookSpecificOutput>,
    #[serde(rename = "systemMessage", skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HookSpecificOutput {
    #[serde(rename = "hookEventName")]
    pub hook_event_name: String,
    #[serde(rename = "additionalContext")]
    pub additional_context: String,
}

impl DispatchOutput {
    pub fn is_empty(&self) -> bool {
        self.hook_specific_output.is_none() && self.system_message.is_none()
    }
}

/// The small set of errors that abort a dispatch outright rather than
/// degrading to a warning. Everything else funnels into the warning
/// channel per spec §7.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to read config file {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("internal dispatcher error: {0}")]
    Internal(String),
}
