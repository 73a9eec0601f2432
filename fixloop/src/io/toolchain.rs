//! Build/test adapter for the validation step of each iteration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::io::config::CommandsConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Result of one build or test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRun {
    pub ok: bool,
    /// Combined stdout/stderr with exit status.
    pub log: String,
}

pub trait Toolchain {
    fn build(&self) -> Result<CheckRun>;
    fn test(&self) -> Result<CheckRun>;
}

/// Runs the configured build and test commands in the repository root.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    workdir: PathBuf,
    build: Vec<String>,
    test: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandToolchain {
    pub fn from_config(workdir: impl Into<PathBuf>, commands: &CommandsConfig) -> Self {
        Self {
            workdir: workdir.into(),
            build: commands.build.clone(),
            test: commands.test.clone(),
            timeout: commands.timeout(),
            output_limit_bytes: commands.output_limit_bytes,
        }
    }
}

impl Toolchain for CommandToolchain {
    fn build(&self) -> Result<CheckRun> {
        run_check("build", &self.build, &self.workdir, self.timeout, self.output_limit_bytes)
    }

    fn test(&self) -> Result<CheckRun> {
        run_check("test", &self.test, &self.workdir, self.timeout, self.output_limit_bytes)
    }
}

/// Run `argv` in `workdir`; success means exit 0 within the timeout.
#[instrument(skip_all, fields(label))]
pub fn run_check(
    label: &str,
    argv: &[String],
    workdir: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CheckRun> {
    let cmd = command_from_argv(argv, workdir)?;
    let out = run_command_with_timeout(cmd, None, timeout, output_limit_bytes)?;
    let ok = out.succeeded();
    debug!(label, ok, "check finished");
    Ok(CheckRun {
        ok,
        log: out.combined_log(label),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn build_and_test_report_exit_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let commands = CommandsConfig {
            build: sh("echo compiled"),
            test: sh("echo 'test math::adds ... FAILED'; exit 101"),
            ..CommandsConfig::default()
        };
        let toolchain = CommandToolchain::from_config(temp.path(), &commands);

        let build = toolchain.build().expect("build");
        assert!(build.ok);
        assert!(build.log.contains("compiled"));

        let test = toolchain.test().expect("test");
        assert!(!test.ok);
        assert!(test.log.contains("math::adds"));
        assert!(test.log.contains("[test exit code Some(101)]"));
    }

    #[test]
    fn timeout_is_a_failed_check() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = run_check(
            "test",
            &sh("sleep 5"),
            temp.path(),
            Duration::from_millis(100),
            1_000,
        )
        .expect("run");
        assert!(!run.ok);
        assert!(run.log.contains("[test timed out]"));
    }

    #[test]
    fn commands_run_in_workdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("marker.txt"), "x").expect("write");
        let run = run_check("build", &sh("test -f marker.txt"), temp.path(), Duration::from_secs(10), 1_000)
            .expect("run");
        assert!(run.ok);
    }
}
