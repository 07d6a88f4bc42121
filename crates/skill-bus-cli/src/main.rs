use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use skill_bus::{Dispatch, DispatchRequest};
use skill_bus_types::{Settings, Source, Timing};

#[derive(Parser, Debug)]
#[command(name = "skill-bus", version, about = "Skill-lifecycle event bus dispatcher")]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Commands>,

    /// Lifecycle point being dispatched. Bypasses subcommand dispatch —
    /// present so a host can invoke the binary directly as the hook
    /// entrypoint without spelling out `dispatch`.
    #[arg(long, value_enum)]
    timing: Option<TimingArg>,

    /// Working directory the event originated from (defaults to cwd).
    #[arg(long)]
    cwd: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "tool")]
    source: SourceArg,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Route one skill event to matching subscriptions (the hook entrypoint).
    Dispatch {
        #[arg(long, value_enum)]
        timing: TimingArg,
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "tool")]
        source: SourceArg,
    },
    /// Print every surviving subscription after config merge, with its scope.
    List {
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
    /// One-line summary of the merged config.
    Status {
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
    /// Summarize the telemetry log (requires `telemetry: true`).
    Stats {
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum TimingArg {
    Pre,
    Post,
    Complete,
}

impl From<TimingArg> for Timing {
    fn from(t: TimingArg) -> Self {
        match t {
            TimingArg::Pre => Timing::Pre,
            TimingArg::Post => Timing::Post,
            TimingArg::Complete => Timing::Complete,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default)]
enum SourceArg {
    #[default]
    Tool,
    Prompt,
}

impl From<SourceArg> for Source {
    fn from(s: SourceArg) -> Self {
        match s {
            SourceArg::Tool => Source::Tool,
            SourceArg::Prompt => Source::Prompt,
        }
    }
}

fn init_tracing() {
    let default_level = if std::env::var("SKILL_BUS_DEBUG").as_deref() == Ok("1") {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The hook protocol never fails the host: any panic inside dispatch
/// logic is caught here and reported as a `systemMessage`, matching the
/// outer `try/except/finally sys.exit(0)` this dispatcher was distilled
/// from.
fn main() {
    init_tracing();
    let cli = Cli::parse();

    let resolved_cwd = |c: Option<PathBuf>| c.unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    let result = std::panic::catch_unwind(|| match cli.cmd {
        Some(Commands::Dispatch { timing, cwd, source }) => {
            run_dispatch(timing.into(), resolved_cwd(cwd), source.into())
        }
        Some(Commands::List { cwd }) => run_list(resolved_cwd(cwd)),
        Some(Commands::Status { cwd }) => run_status(resolved_cwd(cwd)),
        Some(Commands::Stats { cwd }) => run_stats(resolved_cwd(cwd)),
        None => match cli.timing {
            Some(timing) => run_dispatch(timing.into(), resolved_cwd(cli.cwd), cli.source.into()),
            None => Ok(()),
        },
    });

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            println!("{}", serde_json::json!({"systemMessage": format!("[skill-bus] ERROR - {e}")}));
        }
        Err(_) => {
            println!(
                "{}",
                serde_json::json!({"systemMessage": "[skill-bus] ERROR - internal panic during dispatch"})
            );
        }
    }
}

fn run_dispatch(timing: Timing, cwd: PathBuf, source: Source) -> Result<()> {
    let skill_name = std::env::var("SKILL_BUS_SKILL").unwrap_or_default();
    if skill_name.is_empty() {
        return Ok(());
    }

    let req = DispatchRequest { skill_name: &skill_name, timing, source, cwd };
    let mut state = Dispatch::new();
    if let Some(output) = skill_bus::dispatch(&req, &mut state) {
        println!("{}", serde_json::to_string(&output)?);
    }
    Ok(())
}

fn merged_config(cwd: &std::path::Path) -> skill_bus_config::MergedConfig {
    let mut warnings = Vec::new();
    let global_path = skill_bus_config::default_global_config_path();
    let project_path = skill_bus_config::project_config_path(cwd);
    skill_bus_config::load_and_merge(&global_path, &project_path, &mut warnings)
}

fn run_list(cwd: PathBuf) -> Result<()> {
    let merged = merged_config(&cwd);
    if merged.subscriptions.is_empty() {
        println!("(no subscriptions)");
        return Ok(());
    }
    for sub in &merged.subscriptions {
        println!(
            "{} -> {} [{}] ({})",
            sub.insert.as_deref().unwrap_or("?"),
            sub.on(),
            sub.when(),
            sub.scope.as_str()
        );
    }
    Ok(())
}

fn run_status(cwd: PathBuf) -> Result<()> {
    let merged = merged_config(&cwd);
    println!(
        "enabled={} subscriptions={} telemetry={}",
        merged.settings.enabled,
        merged.subscriptions.len(),
        merged.settings.telemetry
    );
    Ok(())
}

fn run_stats(cwd: PathBuf) -> Result<()> {
    let merged = merged_config(&cwd);
    if !merged.settings.telemetry {
        println!("telemetry is disabled — enable \"telemetry\": true to collect stats");
        return Ok(());
    }
    let settings: &Settings = &merged.settings;
    let events = skill_bus_events::read_telemetry(&cwd, settings, None, None);

    let matches = events.iter().filter(|e| e.event == skill_bus_events::EventKind::Match).count();
    let skips = events.iter().filter(|e| e.event == skill_bus_events::EventKind::ConditionSkip).count();
    let no_match = events.iter().filter(|e| e.event == skill_bus_events::EventKind::NoMatch).count();
    let completions = events
        .iter()
        .filter(|e| e.event == skill_bus_events::EventKind::SkillComplete)
        .count();

    println!("matches={matches} condition_skips={skips} no_match={no_match} completions={completions}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_arg_converts_to_types_timing() {
        assert_eq!(Timing::from(TimingArg::Pre), Timing::Pre);
        assert_eq!(Timing::from(TimingArg::Complete), Timing::Complete);
    }

    #[test]
    fn source_arg_converts_to_types_source() {
        assert_eq!(Source::from(SourceArg::Tool), Source::Tool);
        assert_eq!(Source::from(SourceArg::Prompt), Source::Prompt);
    }

    #[test]
    fn cli_parses_bare_timing_without_subcommand() {
        let cli = Cli::parse_from(["skill-bus", "--timing", "pre"]);
        assert!(cli.cmd.is_none());
        assert!(matches!(cli.timing, Some(TimingArg::Pre)));
    }

    #[test]
    fn cli_parses_dispatch_subcommand() {
        let cli = Cli::parse_from(["skill-bus", "dispatch", "--timing", "post"]);
        assert!(matches!(cli.cmd, Some(Commands::Dispatch { timing: TimingArg::Post, .. })));
    }

    #[test]
    fn cli_parses_list_subcommand() {
        let cli = Cli::parse_from(["skill-bus", "list", "--cwd", "/tmp"]);
        assert!(matches!(cli.cmd, Some(Commands::List { .. })));
    }
}
