//! Output assembly (component E): turns a set of matched subscriptions
//! into the single `hookSpecificOutput` + `systemMessage` document printed
//! on stdout.

use std::collections::HashMap;
use std::path::Path;

use skill_bus_types::{DispatchOutput, HookSpecificOutput, Insert, Settings, Source, Subscription, Timing};

/// A dynamic insert's text resolver. Returning `None` falls back to the
/// insert's static `text` silently — only a *missing* handler name warns.
pub type DynamicHandler = fn(&Path, &Settings) -> Option<String>;

pub struct AssembleInput<'a> {
    pub matched: &'a [Subscription],
    pub timing: Timing,
    pub source: Source,
    pub settings: &'a Settings,
    pub inserts: &'a HashMap<String, Insert>,
    pub cwd: &'a Path,
    pub handlers: &'a HashMap<&'static str, DynamicHandler>,
}

fn hook_event_name(source: Source, timing: Timing) -> &'static str {
    match (source, timing) {
        (Source::Prompt, _) => "UserPromptSubmit",
        (_, Timing::Pre) | (_, Timing::Complete) => "PreToolUse",
        (_, Timing::Post) => "PostToolUse",
    }
}

fn resolve_text(insert: &Insert, input: &AssembleInput) -> Option<String> {
    if let Some(dynamic_type) = &insert.dynamic {
        match input.handlers.get(dynamic_type.as_str()) {
            Some(handler) => {
                if let Some(text) = handler(input.cwd, input.settings) {
                    return Some(text);
                }
            }
            None => return insert.text.clone().filter(|t| !t.is_empty()),
        }
    }
    insert.text.clone().filter(|t| !t.is_empty())
}

/// Build the combined output document from the already-matched
/// subscriptions. Returns `None` when no subscription contributed any
/// text — the caller falls back to a warnings-only document, if any.
pub fn build_output(input: AssembleInput, warnings: &mut Vec<String>) -> Option<DispatchOutput> {
    if input.matched.is_empty() {
        return None;
    }

    let mut context_parts = Vec::new();
    let mut sub_labels = Vec::new();
    let mut seen_inserts = std::collections::HashSet::new();

    for sub in input.matched {
        let Some(insert_name) = &sub.insert else {
            if sub.inject.is_some() {
                warnings.push("subscription uses old 'inject' format — skipped".to_string());
            }
            continue;
        };
        if !seen_inserts.insert(insert_name.clone()) {
            continue;
        }
        let Some(insert_def) = input.inserts.get(insert_name) else {
            warnings.push(format!("dangling insert reference '{insert_name}' — skipping"));
            continue;
        };
        if insert_def.dynamic.is_some()
            && !input.handlers.contains_key(insert_def.dynamic.as_deref().unwrap_or(""))
        {
            warnings.push(format!(
                "unknown dynamic handler '{}', using static text",
                insert_def.dynamic.as_deref().unwrap_or("")
            ));
        }
        let Some(text) = resolve_text(insert_def, &input) else { continue };

        let on_short = sub.on().rsplit(':').next().unwrap_or(sub.on());
        sub_labels.push(format!("{insert_name} -> {on_short} [{}]", sub.when()));
        context_parts.push(text);
    }

    if context_parts.is_empty() {
        return None;
    }

    let additional_context = context_parts.join("\n\n");
    let hook_event_name = hook_event_name(input.source, input.timing).to_string();

    let mut output = DispatchOutput {
        hook_specific_output: Some(HookSpecificOutput { hook_event_name, additional_context }),
        system_message: None,
    };

    if input.settings.show_console_echo {
        let label = match input.source {
            Source::Prompt => "[skill-bus] prompt-monitor:",
            Source::Tool => "[skill-bus]",
        };
        warnings.push(format!(
            "{label} {} sub(s) matched ({})",
            sub_labels.len(),
            sub_labels.join(", ")
        ));
    }
    if !warnings.is_empty() {
        output.system_message = Some(warnings.join(" | "));
    }

    Some(output)
}

/// Append the first `maxMatchesPerSkill` truncation warning into the
/// assembled context, so the model knows inserts were omitted.
pub fn append_truncation_note(output: &mut DispatchOutput, warnings: &[String]) {
    let Some(note) = warnings.iter().find(|w| w.contains("maxMatchesPerSkill")) else { return };
    if let Some(hso) = &mut output.hook_specific_output {
        hso.additional_context.push_str(&format!("\n\n[Note: {note}]"));
    }
}

/// The instruction text injected ahead of a skill with matching
/// `when: complete` subscriptions, telling the model to trigger
/// `skill-bus:complete` once it has fully finished the work.
pub fn completion_instruction(skill_name: &str, chain_depth: u32) -> String {
    let depth_arg = if chain_depth > 0 { format!(" --depth {chain_depth}") } else { String::new() };
    format!(
        "\n\n---\n[skill-bus] COMPLETION TRIGGER: When you have FULLY completed \
the work described by this skill — not begun it, FULLY delivered all \
outputs — you MUST invoke the Skill tool with skill: \"skill-bus:complete\" \
and args: \"{skill_name}{depth_arg}\" to trigger downstream subscriptions. \
Do NOT skip this step."
    )
}

/// Splice the completion instruction into an existing output, or build a
/// fresh instruction-only output when nothing else matched.
pub fn inject_completion(
    output: Option<DispatchOutput>,
    instruction: &str,
    source: Source,
    warnings: &[String],
) -> DispatchOutput {
    match output {
        Some(mut existing) => {
            if let Some(hso) = &mut existing.hook_specific_output {
                hso.additional_context.push_str(instruction);
            }
            existing
        }
        None => {
            let hook_event_name = match source {
                Source::Prompt => "UserPromptSubmit",
                Source::Tool => "PreToolUse",
            }
            .to_string();
            DispatchOutput {
                hook_specific_output: Some(HookSpecificOutput {
                    hook_event_name,
                    additional_context: instruction.trim_start_matches('\n').to_string(),
                }),
                system_message: if warnings.is_empty() { None } else { Some(warnings.join(" | ")) },
            }
        }
    }
}
