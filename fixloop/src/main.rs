//! fixloop: autonomous code-repair loop.
//!
//! Runs builder, judge, and reviewer agents against a git repository until its
//! build and tests pass, the tree stops changing, or a limit is reached.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use fixloop::exit_codes;
use fixloop::io::config::{LlmEnv, load_config};
use fixloop::io::layout::{StatePaths, init_state_dir};
use fixloop::logging;
use fixloop::personas::run_personas;
use fixloop::run::{RunOptions, execute_run, tier_status};

#[derive(Parser)]
#[command(name = "fixloop", version, about = "Autonomous code-repair loop")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.fixloop/` with a default `config.toml`.
    Init {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the repair loop on a branch until fixed, converged, or out of budget.
    Run {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        branch: String,
        /// Override `loop.max_loops`.
        #[arg(long)]
        max_loops: Option<u32>,
        /// Debug-level tracing (unless `RUST_LOG` is set).
        #[arg(long)]
        debug: bool,
    },
    /// Run the configured persona commands: builders, commit, reviewers, commit.
    Personas {
        #[arg(long)]
        repo: PathBuf,
    },
    /// Print provider tier state.
    Tiers {
        #[arg(long)]
        repo: PathBuf,
    },
}

impl Command {
    fn log_level(&self) -> &'static str {
        match self {
            Command::Run { debug: true, .. } => "debug",
            Command::Run { .. } | Command::Personas { .. } => "info",
            Command::Init { .. } | Command::Tiers { .. } => "warn",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.command.log_level());
    match dispatch(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Init { repo, force } => cmd_init(&repo, force),
        Command::Run {
            repo,
            branch,
            max_loops,
            debug: _,
        } => cmd_run(&repo, RunOptions { branch, max_loops }),
        Command::Personas { repo } => cmd_personas(&repo),
        Command::Tiers { repo } => {
            print!("{}", tier_status(&repo)?);
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(repo: &Path, force: bool) -> Result<i32> {
    let paths = init_state_dir(repo, force)?;
    println!("init: config={}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(repo: &Path, options: RunOptions) -> Result<i32> {
    let env = LlmEnv::from_env()?;
    let outcome = execute_run(repo, &options, &env, |report| {
        let detail = report.detail.as_deref().unwrap_or("");
        println!("iteration {}: {} {}", report.iter, report.outcome, detail);
    })?;
    println!(
        "run: id={} status={} iterations={} recoveries={} tokens={} cost=£{:.4}",
        outcome.run_id,
        outcome.stop.status(),
        outcome.iterations,
        outcome.recoveries,
        outcome.usage.total_tokens,
        outcome.usage.estimated_cost_gbp
    );
    if !outcome.stop.is_success() {
        eprintln!("{}", outcome.stop);
    }
    Ok(exit_codes::for_stop(&outcome.stop))
}

fn cmd_personas(repo: &Path) -> Result<i32> {
    let cfg = load_config(&StatePaths::new(repo).config_path)?;
    for report in run_personas(repo, &cfg)? {
        let failed = report.runs.iter().filter(|r| !r.ok).count();
        println!(
            "personas: phase={} ran={} failed={} committed={}",
            report.phase,
            report.runs.len(),
            failed,
            report.committed
        );
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["fixloop", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false, .. }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["fixloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "fixloop",
            "run",
            "--repo",
            "/tmp/project",
            "--branch",
            "fixloop/work",
            "--max-loops",
            "4",
            "--debug",
        ]);
        let Command::Run {
            repo,
            branch,
            max_loops,
            debug,
        } = &cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(repo, &PathBuf::from("/tmp/project"));
        assert_eq!(branch, "fixloop/work");
        assert_eq!(*max_loops, Some(4));
        assert!(*debug);
        assert_eq!(cli.command.log_level(), "debug");
    }

    #[test]
    fn run_requires_a_branch() {
        assert!(Cli::try_parse_from(["fixloop", "run", "--repo", "."]).is_err());
    }
}
