//! Timeout-bounded current-branch lookup.
//!
//! `gitBranch` conditions need the repository's current branch, but a
//! dispatch only gets a 5-second end-to-end budget, so the child process
//! is killed after 2 seconds rather than left to block the whole pipeline.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// How long we let `git branch --show-current` run before killing it.
pub const BRANCH_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Current branch name for the repository at `cwd`, or `None` if `cwd`
/// isn't a repository, git isn't available, the query errors, or it
/// doesn't finish within [`BRANCH_QUERY_TIMEOUT`].
pub fn current_branch(cwd: &Path) -> Option<String> {
    let output = run_with_timeout("git", &["branch", "--show-current"], cwd, BRANCH_QUERY_TIMEOUT)?;
    if !output.success {
        return None;
    }
    let branch = output.stdout.trim();
    if branch.is_empty() {
        None
    } else {
        Some(branch.to_string())
    }
}

struct CommandOutput {
    success: bool,
    stdout: String,
}

fn run_with_timeout(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Option<CommandOutput> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .ok()?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait().ok()? {
            Some(status) => {
                let mut stdout_bytes = Vec::new();
                if let Some(mut out) = child.stdout.take() {
                    let _ = out.read_to_end(&mut stdout_bytes);
                }
                return Some(CommandOutput {
                    success: status.success(),
                    stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
                });
            }
            None => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_repo(dir: &Path) {
        StdCommand::new("git").args(["init", "-q"]).current_dir(dir).output().unwrap();
        StdCommand::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(dir)
            .output()
            .unwrap();
        StdCommand::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(dir)
            .output()
            .unwrap();
        StdCommand::new("git")
            .args(["commit", "--allow-empty", "-q", "-m", "init"])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    #[test]
    fn not_a_repo_returns_none() {
        let td = tempfile::tempdir().unwrap();
        assert_eq!(current_branch(td.path()), None);
    }

    #[test]
    fn finds_current_branch() {
        let td = tempfile::tempdir().unwrap();
        init_repo(td.path());
        let branch = current_branch(td.path());
        assert!(branch.is_some());
    }
}
