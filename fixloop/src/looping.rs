//! The outer repair loop: iterate, watch for convergence, recover from errors.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::budget::{BudgetError, BudgetLedger, LedgerSnapshot, remaining_budget};
use crate::core::convergence::ConvergenceState;
use crate::core::types::IterationOutcome;
use crate::io::config::FixloopConfig;
use crate::io::llm::Transport;
use crate::io::providers::DeadlinePassedError;
use crate::io::snapshot::content_hash;
use crate::pipeline::{IterationInput, IterationReport, PipelineDeps, run_iteration};
use crate::recovery::{FixAgent, Recovery, RecoveryOutcome};

/// Why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStop {
    /// Build and tests passed; the fix is committed.
    Fixed { commit: String },
    /// The tree stopped changing for `stagnant` consecutive iterations.
    Converged { stagnant: u32 },
    MaxLoopsExhausted { loops: u32 },
    WallClockExceeded,
    /// `.fixloop/STOP` was found.
    Stopped,
    BudgetExhausted(BudgetError),
    ManualIntervention { failures: u32 },
}

impl LoopStop {
    pub fn status(&self) -> &'static str {
        match self {
            LoopStop::Fixed { .. } => "fixed",
            LoopStop::Converged { .. } => "converged",
            LoopStop::MaxLoopsExhausted { .. } => "max loops exhausted",
            LoopStop::WallClockExceeded => "timed out",
            LoopStop::Stopped => "stopped",
            LoopStop::BudgetExhausted(_) => "budget exhausted",
            LoopStop::ManualIntervention { .. } => "manual intervention required",
        }
    }

    /// Fixed and converged runs end cleanly.
    pub fn is_success(&self) -> bool {
        matches!(self, LoopStop::Fixed { .. } | LoopStop::Converged { .. })
    }
}

impl fmt::Display for LoopStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopStop::Fixed { commit } => write!(f, "fixed at {commit}"),
            LoopStop::Converged { stagnant } => {
                write!(f, "converged after {stagnant} unchanged iterations")
            }
            LoopStop::MaxLoopsExhausted { loops } => write!(f, "max loops exhausted ({loops})"),
            LoopStop::BudgetExhausted(err) => write!(f, "budget exhausted: {err}"),
            LoopStop::ManualIntervention { failures } => write!(
                f,
                "manual intervention required after {failures} failed automated fixes"
            ),
            other => f.write_str(other.status()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub run_id: String,
    pub iterations: u32,
    pub recoveries: u32,
    pub stop: LoopStop,
    pub usage: LedgerSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSettings {
    pub max_loops: u32,
    pub max_wall_clock: Duration,
    pub stagnation_threshold: u32,
    pub exclude_dirs: Vec<String>,
    pub max_fix_failures: u32,
}

impl LoopSettings {
    pub fn from_config(cfg: &FixloopConfig) -> Self {
        Self {
            max_loops: cfg.looping.max_loops,
            max_wall_clock: Duration::from_secs(cfg.looping.max_wall_clock_secs),
            stagnation_threshold: cfg.looping.stagnation_threshold,
            exclude_dirs: cfg.convergence.exclude_dirs.clone(),
            max_fix_failures: cfg.recovery.max_fix_failures,
        }
    }
}

/// Run iterations until fixed, converged, or a limit is hit.
///
/// Iteration errors go through [`Recovery`]; only errors raised by recovery itself escape.
#[instrument(skip_all, fields(run_id, max_loops = settings.max_loops))]
pub fn run_loop<T: Transport, F: FnMut(&IterationReport)>(
    deps: &mut PipelineDeps<'_, T>,
    fix_agent: &dyn FixAgent,
    ledger: &mut BudgetLedger,
    settings: &LoopSettings,
    run_id: &str,
    mut baseline: String,
    mut on_iteration: F,
) -> Result<LoopOutcome> {
    let git = deps.git;
    let state = deps.state;
    let root = git.workdir().to_path_buf();
    let deadline = Instant::now() + settings.max_wall_clock;
    let mut recovery = Recovery::new(git, state, fix_agent, settings.max_fix_failures);

    let mut convergence = ConvergenceState::default();
    convergence.observe(&content_hash(&root, &settings.exclude_dirs)?);

    let mut iterations = 0u32;
    let stop = loop {
        if iterations >= settings.max_loops {
            break LoopStop::MaxLoopsExhausted {
                loops: settings.max_loops,
            };
        }
        if state.stop_path.exists() {
            info!(path = %state.stop_path.display(), "stop file found");
            break LoopStop::Stopped;
        }
        if remaining_budget(deadline).is_err() {
            warn!("wall-clock budget exhausted");
            break LoopStop::WallClockExceeded;
        }

        iterations += 1;
        let input = IterationInput {
            run_id,
            iter: iterations,
            baseline: &baseline,
        };
        match run_iteration(deps, ledger, input) {
            Ok(report) => {
                on_iteration(&report);
                match (&report.outcome, &report.budget, &report.committed) {
                    (IterationOutcome::Fixed, _, Some(commit)) => {
                        break LoopStop::Fixed {
                            commit: commit.clone(),
                        };
                    }
                    (IterationOutcome::BudgetExceeded, Some(err), _) if err.is_persistent() => {
                        break LoopStop::BudgetExhausted(err.clone());
                    }
                    _ => {}
                }
            }
            Err(err) if err.downcast_ref::<DeadlinePassedError>().is_some() => {
                warn!(err = %format!("{err:#}"), "provider wait ran past the wall-clock budget");
                break LoopStop::WallClockExceeded;
            }
            Err(err) => match recovery.recover(&err)? {
                RecoveryOutcome::Resumed { baseline: head, fixed } => {
                    info!(%head, fixed, "resuming after recovery");
                    baseline = head;
                }
                RecoveryOutcome::ManualIntervention { failures } => {
                    break LoopStop::ManualIntervention { failures };
                }
            },
        }

        let stagnant = convergence.observe(&content_hash(&root, &settings.exclude_dirs)?);
        if convergence.has_converged(settings.stagnation_threshold) {
            info!(stagnant, "tree stopped changing");
            break LoopStop::Converged { stagnant };
        }
    };

    info!(status = stop.status(), iterations, "loop finished");
    Ok(LoopOutcome {
        run_id: run_id.to_string(),
        iterations,
        recoveries: recovery.attempts(),
        stop,
        usage: ledger.snapshot(),
    })
}
