//! Restart supervision for the outer loop.
//!
//! An iteration error is never fatal on its own: in-progress work is committed,
//! a diagnostic bundle is written, and a configured coding agent gets one
//! attempt to fix the tree before the loop resumes from the new HEAD.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::io::config::CommandsConfig;
use crate::io::git::Git;
use crate::io::iteration_log::write_text;
use crate::io::layout::StatePaths;
use crate::io::process::{command_from_argv, run_command_with_timeout};

pub const WIP_COMMIT_MESSAGE: &str = "wip(fixloop): save progress before recovery";
pub const RECOVERY_COMMIT_MESSAGE: &str = "fix(fixloop): apply automated recovery fix";

/// Coding agent that gets a diagnostic bundle and tries to repair the tree.
pub trait FixAgent {
    /// Returns whether the agent reported success.
    fn attempt_fix(&self, diagnostics: &str) -> Result<bool>;
}

/// Runs the configured `fix_agent` command with the bundle on stdin; exit 0 is success.
#[derive(Debug, Clone)]
pub struct CommandFixAgent {
    argv: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit: usize,
}

impl CommandFixAgent {
    pub fn from_config(workdir: impl Into<PathBuf>, commands: &CommandsConfig) -> Self {
        Self {
            argv: commands.fix_agent.clone(),
            workdir: workdir.into(),
            timeout: commands.timeout(),
            output_limit: commands.output_limit_bytes,
        }
    }
}

impl FixAgent for CommandFixAgent {
    #[instrument(skip_all, fields(agent = self.argv.first().map(String::as_str).unwrap_or("")))]
    fn attempt_fix(&self, diagnostics: &str) -> Result<bool> {
        if self.argv.is_empty() {
            warn!("no fix agent configured; counting recovery as failed");
            return Ok(false);
        }
        let cmd = command_from_argv(&self.argv, &self.workdir)?;
        let output = run_command_with_timeout(
            cmd,
            Some(diagnostics.as_bytes()),
            self.timeout,
            self.output_limit,
        )
        .context("run fix agent")?;
        if !output.succeeded() {
            warn!(log = %output.combined_log("fix agent"), "fix agent failed");
        }
        Ok(output.succeeded())
    }
}

/// Repository state captured when an iteration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub error: String,
    pub status: String,
    pub log: String,
    pub diff: String,
}

impl Diagnostics {
    /// Git failures while capturing are folded into the bundle rather than raised.
    pub fn capture(git: &Git, err: &anyhow::Error) -> Self {
        let status = match git.status_porcelain() {
            Ok(entries) if entries.is_empty() => "clean".to_string(),
            Ok(entries) => entries
                .iter()
                .map(|e| format!("{} {}", e.code, e.path))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("unavailable: {e:#}"),
        };
        Self {
            error: format!("{err:#}"),
            status,
            log: git
                .recent_log(10)
                .unwrap_or_else(|e| format!("unavailable: {e:#}")),
            diff: git.diff().unwrap_or_else(|e| format!("unavailable: {e:#}")),
        }
    }

    pub fn render(&self, attempt: u32) -> String {
        format!(
            "# fixloop recovery {attempt}\n\n\
             captured: {}\n\n\
             ## Error\n\n```\n{}\n```\n\n\
             ## Status\n\n```\n{}\n```\n\n\
             ## Recent commits\n\n```\n{}\n```\n\n\
             ## Diff\n\n```diff\n{}\n```\n",
            Utc::now().to_rfc3339(),
            self.error.trim_end(),
            self.status.trim_end(),
            self.log.trim_end(),
            self.diff.trim_end(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Resume the loop from `baseline` (HEAD after recovery commits).
    Resumed { baseline: String, fixed: bool },
    /// Consecutive fix failures reached the ceiling.
    ManualIntervention { failures: u32 },
}

pub struct Recovery<'a> {
    git: &'a Git,
    state: &'a StatePaths,
    agent: &'a dyn FixAgent,
    max_fix_failures: u32,
    consecutive_failures: u32,
    attempts: u32,
}

impl<'a> Recovery<'a> {
    pub fn new(git: &'a Git, state: &'a StatePaths, agent: &'a dyn FixAgent, max_fix_failures: u32) -> Self {
        Self {
            git,
            state,
            agent,
            max_fix_failures,
            consecutive_failures: 0,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Commit in-progress work, write a diagnostic bundle, and run the fix agent once.
    #[instrument(skip_all, fields(attempt = self.attempts + 1))]
    pub fn recover(&mut self, err: &anyhow::Error) -> Result<RecoveryOutcome> {
        self.attempts += 1;
        warn!(err = %format!("{err:#}"), "iteration failed; starting recovery");

        let diagnostics = Diagnostics::capture(self.git, err);
        if self.git.commit_all(WIP_COMMIT_MESSAGE)? {
            info!("committed in-progress work");
        }

        let bundle = diagnostics.render(self.attempts);
        fs::create_dir_all(&self.state.diagnostics_dir)
            .with_context(|| format!("create {}", self.state.diagnostics_dir.display()))?;
        let bundle_path = self.state.diagnostics_dir.join(format!("{}.md", self.attempts));
        write_text(&bundle_path, &bundle)?;

        let fixed = match self.agent.attempt_fix(&bundle) {
            Ok(fixed) => fixed,
            Err(fix_err) => {
                warn!(err = %format!("{fix_err:#}"), "fix agent could not run");
                false
            }
        };

        if fixed {
            self.consecutive_failures = 0;
            if self.git.commit_all(RECOVERY_COMMIT_MESSAGE)? {
                info!("committed automated fix");
            }
        } else {
            let head = self.git.head_sha()?;
            self.git
                .reset_to(&head)
                .context("discard rejected fix attempt")?;
            self.consecutive_failures += 1;
            warn!(
                consecutive = self.consecutive_failures,
                max = self.max_fix_failures,
                "automated fix failed"
            );
            if self.consecutive_failures >= self.max_fix_failures {
                return Ok(RecoveryOutcome::ManualIntervention {
                    failures: self.consecutive_failures,
                });
            }
        }

        Ok(RecoveryOutcome::Resumed {
            baseline: self.git.head_sha()?,
            fixed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use anyhow::anyhow;
    use std::cell::RefCell;

    /// Fix agent with scripted verdicts that may edit the tree.
    struct ScriptedFixAgent {
        verdicts: RefCell<Vec<bool>>,
        seen: RefCell<Vec<String>>,
        edit: Option<(PathBuf, &'static str)>,
    }

    impl ScriptedFixAgent {
        fn new(verdicts: Vec<bool>) -> Self {
            Self {
                verdicts: RefCell::new(verdicts),
                seen: RefCell::new(Vec::new()),
                edit: None,
            }
        }
    }

    impl FixAgent for ScriptedFixAgent {
        fn attempt_fix(&self, diagnostics: &str) -> Result<bool> {
            self.seen.borrow_mut().push(diagnostics.to_string());
            if let Some((path, content)) = &self.edit {
                fs::write(path, content)?;
            }
            let mut verdicts = self.verdicts.borrow_mut();
            if verdicts.is_empty() {
                return Ok(false);
            }
            Ok(verdicts.remove(0))
        }
    }

    fn last_commit_subject(git: &Git) -> String {
        git.recent_log(1).expect("log")
    }

    #[test]
    fn commits_wip_and_writes_bundle() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let state = StatePaths::new(repo.root());
        repo.write("src/half.rs", "fn half() {\n").expect("write");
        let agent = ScriptedFixAgent::new(vec![true]);
        let mut recovery = Recovery::new(&git, &state, &agent, 3);

        let outcome = recovery.recover(&anyhow!("tool 'show_diff' is not permitted")).expect("recover");
        let head = git.head_sha().expect("sha");
        assert_eq!(outcome, RecoveryOutcome::Resumed { baseline: head, fixed: true });
        assert!(last_commit_subject(&git).contains("wip(fixloop): save progress before recovery"));

        let bundle = fs::read_to_string(state.diagnostics_dir.join("1.md")).expect("bundle");
        assert!(bundle.contains("tool 'show_diff' is not permitted"));
        assert!(bundle.contains("?? src/half.rs"));
        assert_eq!(agent.seen.borrow().len(), 1);
        assert_eq!(agent.seen.borrow()[0], bundle);
    }

    #[test]
    fn successful_fix_is_committed_and_resets_the_count() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let state = StatePaths::new(repo.root());
        let agent = ScriptedFixAgent {
            edit: Some((repo.root().join("README.md"), "repaired\n")),
            ..ScriptedFixAgent::new(vec![false, true])
        };
        let mut recovery = Recovery::new(&git, &state, &agent, 3);

        recovery.recover(&anyhow!("first")).expect("recover");
        assert_eq!(recovery.consecutive_failures(), 1);
        let readme = fs::read_to_string(repo.root().join("README.md")).expect("read");
        assert_eq!(readme, "hi\n");
        assert!(git.status_porcelain().expect("status").is_empty());

        recovery.recover(&anyhow!("second")).expect("recover");
        assert_eq!(recovery.consecutive_failures(), 0);
        assert!(last_commit_subject(&git).contains("apply automated recovery fix"));
        let readme = fs::read_to_string(repo.root().join("README.md")).expect("read");
        assert_eq!(readme, "repaired\n");
        assert!(state.diagnostics_dir.join("2.md").is_file());
    }

    #[test]
    fn rejected_fix_is_not_swept_into_the_next_wip_commit() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let state = StatePaths::new(repo.root());
        let agent = ScriptedFixAgent {
            edit: Some((repo.root().join("scratch.rs"), "fn broken(\n")),
            ..ScriptedFixAgent::new(vec![false])
        };
        let mut recovery = Recovery::new(&git, &state, &agent, 3);

        let before = git.head_sha().expect("sha");
        recovery.recover(&anyhow!("first")).expect("recover");
        assert!(!repo.root().join("scratch.rs").exists());
        assert_eq!(git.head_sha().expect("sha"), before);
    }

    #[test]
    fn ceiling_of_consecutive_failures_requires_manual_intervention() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let state = StatePaths::new(repo.root());
        let agent = ScriptedFixAgent::new(Vec::new());
        let mut recovery = Recovery::new(&git, &state, &agent, 2);

        assert!(matches!(
            recovery.recover(&anyhow!("boom")).expect("recover"),
            RecoveryOutcome::Resumed { fixed: false, .. }
        ));
        assert_eq!(
            recovery.recover(&anyhow!("boom")).expect("recover"),
            RecoveryOutcome::ManualIntervention { failures: 2 }
        );
        assert_eq!(recovery.attempts(), 2);
    }

    #[test]
    fn command_agent_reads_bundle_on_stdin() {
        let repo = TestRepo::new().expect("repo");
        let commands = CommandsConfig {
            fix_agent: vec![
                "sh".to_string(),
                "-c".to_string(),
                "grep -q 'Error' && touch fixed.marker".to_string(),
            ],
            ..CommandsConfig::default()
        };
        let agent = CommandFixAgent::from_config(repo.root(), &commands);
        assert!(agent.attempt_fix("## Error\nboom\n").expect("run"));
        assert!(repo.root().join("fixed.marker").exists());
        assert!(!agent.attempt_fix("nothing relevant").expect("run"));

        let unconfigured = CommandFixAgent::from_config(repo.root(), &CommandsConfig::default());
        assert!(!unconfigured.attempt_fix("## Error").expect("run"));
    }
}
