//! Best-effort persona mode.
//!
//! Persona commands run concurrently against the shared working tree, one
//! thread each. All builder personas finish and their changes are committed
//! before any reviewer persona starts; the last writer wins at each commit.

use std::fmt;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::config::FixloopConfig;
use crate::io::git::Git;
use crate::io::process::{command_from_argv, run_command_with_timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Builders,
    Reviewers,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Builders => "builders",
            Phase::Reviewers => "reviewers",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaRun {
    pub index: usize,
    pub program: String,
    pub ok: bool,
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub runs: Vec<PersonaRun>,
    /// Whether the phase's changes produced a commit.
    pub committed: bool,
}

fn brief(phase: Phase, index: usize, total: usize) -> String {
    format!("phase: {phase}\npersona: {} of {total}\n", index + 1)
}

/// Run every command of one phase concurrently and wait for all of them.
#[instrument(skip_all, fields(phase = %phase, personas = commands.len()))]
pub fn run_phase(
    root: &Path,
    phase: Phase,
    commands: &[Vec<String>],
    timeout: Duration,
    output_limit: usize,
) -> Result<Vec<PersonaRun>> {
    let total = commands.len();
    thread::scope(|scope| {
        let handles: Vec<_> = commands
            .iter()
            .enumerate()
            .map(|(index, argv)| {
                scope.spawn(move || -> Result<PersonaRun> {
                    let cmd = command_from_argv(argv, root)?;
                    let stdin = brief(phase, index, total);
                    let output = run_command_with_timeout(cmd, Some(stdin.as_bytes()), timeout, output_limit)?;
                    let program = argv.first().cloned().unwrap_or_default();
                    Ok(PersonaRun {
                        index,
                        log: output.combined_log(&program),
                        ok: output.succeeded(),
                        program,
                    })
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow!("{phase} persona thread panicked"))?
            })
            .collect()
    })
}

/// Builders, commit, reviewers, commit.
pub fn run_personas(root: &Path, cfg: &FixloopConfig) -> Result<Vec<PhaseReport>> {
    let git = Git::new(root);
    let timeout = cfg.commands.timeout();
    let limit = cfg.commands.output_limit_bytes;
    let phases = [
        (Phase::Builders, &cfg.personas.builders),
        (Phase::Reviewers, &cfg.personas.reviewers),
    ];

    let mut reports = Vec::new();
    for (phase, commands) in phases {
        if commands.is_empty() {
            continue;
        }
        let runs = run_phase(root, phase, commands, timeout, limit)?;
        for run in runs.iter().filter(|r| !r.ok) {
            warn!(%phase, index = run.index, program = %run.program, "persona failed");
        }
        let committed = git.commit_all(&format!("chore(fixloop): {phase} personas"))?;
        info!(%phase, committed, "phase finished");
        reports.push(PhaseReport {
            phase,
            runs,
            committed,
        });
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::PersonasConfig;
    use crate::test_support::TestRepo;
    use std::fs;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn builders_commit_before_reviewers_start() {
        let repo = TestRepo::new().expect("repo");
        let cfg = FixloopConfig {
            personas: PersonasConfig {
                builders: vec![
                    sh("cat > one.txt"),
                    sh("echo two > two.txt"),
                ],
                reviewers: vec![sh("git log -1 --format=%s > seen.txt && test -f one.txt && test -f two.txt")],
            },
            ..FixloopConfig::default()
        };

        let reports = run_personas(repo.root(), &cfg).expect("personas");
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].phase, Phase::Builders);
        assert!(reports[0].committed);
        assert!(reports.iter().all(|r| r.runs.iter().all(|run| run.ok)));

        let first = fs::read_to_string(repo.root().join("one.txt")).expect("read");
        assert_eq!(first, "phase: builders\npersona: 1 of 2\n");
        let seen = fs::read_to_string(repo.root().join("seen.txt")).expect("read");
        assert_eq!(seen.trim(), "chore(fixloop): builders personas");
    }

    #[test]
    fn failed_persona_does_not_block_the_phase() {
        let repo = TestRepo::new().expect("repo");
        let runs = run_phase(
            repo.root(),
            Phase::Builders,
            &[sh("exit 3"), sh("echo fine")],
            Duration::from_secs(10),
            10_000,
        )
        .expect("phase");
        assert_eq!(runs.len(), 2);
        assert!(!runs[0].ok);
        assert!(runs[1].ok);
        assert!(runs[1].log.contains("fine"));
    }

    #[test]
    fn empty_phases_are_skipped() {
        let repo = TestRepo::new().expect("repo");
        let reports = run_personas(repo.root(), &FixloopConfig::default()).expect("personas");
        assert!(reports.is_empty());
    }
}
