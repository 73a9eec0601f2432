//! Orchestration for `fixloop run`.
//!
//! Starting a run checks out the work branch, ensures `.fixloop/` exists, and
//! records the baseline commit. Executing it wires the configured collaborators
//! (provider tiers, workspace tools, toolchain, file memory) into the loop.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::core::budget::BudgetLedger;
use crate::io::config::{FixloopConfig, LlmEnv, load_config};
use crate::io::git::Git;
use crate::io::layout::{STATE_DIR_NAME, StatePaths, init_state_dir};
use crate::io::llm::{LlmClient, RetryPolicy};
use crate::io::memory::FileMemory;
use crate::io::prompt::PromptBuilder;
use crate::io::providers::{TierSupervisor, describe_tier_book, load_tier_book};
use crate::io::repo_tools::WorkspaceTools;
use crate::io::toolchain::CommandToolchain;
use crate::looping::{LoopOutcome, LoopSettings, run_loop};
use crate::pipeline::{IterationReport, PipelineDeps};
use crate::recovery::CommandFixAgent;
use crate::session::SessionSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStart {
    pub run_id: String,
    pub branch: String,
    /// HEAD when the run started; the first iteration resets here.
    pub baseline: String,
    pub paths: StatePaths,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub branch: String,
    /// Overrides `loop.max_loops` from config.
    pub max_loops: Option<u32>,
}

/// Prepare `root` for a run on `branch`.
///
/// Refuses to start when the tree has changes outside `.fixloop/`, so user work is never
/// swept into a recovery commit.
pub fn start_run(root: &Path, branch: &str) -> Result<RunStart> {
    debug!(root = %root.display(), branch, "starting run");
    let git = Git::new(root);
    let state_prefix = format!("{STATE_DIR_NAME}/");
    git.ensure_clean_except_prefixes(&[state_prefix.as_str()])?;

    let current = git.current_branch()?;
    if current != branch {
        if git.branch_exists(branch)? {
            debug!(branch, "checking out existing branch");
            git.checkout_branch(branch)
                .with_context(|| format!("checkout existing branch {branch}"))?;
        } else {
            info!(branch, "creating new branch");
            git.checkout_new_branch(branch)
                .with_context(|| format!("create branch {branch}"))?;
        }
    }

    let paths = init_state_dir(root, false).context("initialise state directory")?;
    let baseline = git.head_sha()?;
    let run_id = format!(
        "run-{}-{}",
        git.head_short_sha(8)?,
        Utc::now().format("%Y%m%dT%H%M%S")
    );
    info!(%run_id, %baseline, "run started");
    Ok(RunStart {
        run_id,
        branch: branch.to_string(),
        baseline,
        paths,
    })
}

/// Load, override, and validate the run's config.
pub fn run_config(paths: &StatePaths, options: &RunOptions) -> Result<FixloopConfig> {
    let mut cfg = load_config(&paths.config_path)?;
    if let Some(max_loops) = options.max_loops {
        cfg.looping.max_loops = max_loops;
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Start a run and drive the loop with the configured collaborators.
pub fn execute_run<F: FnMut(&IterationReport)>(
    root: &Path,
    options: &RunOptions,
    env: &LlmEnv,
    on_iteration: F,
) -> Result<LoopOutcome> {
    let start = start_run(root, &options.branch)?;
    let cfg = run_config(&start.paths, options)?;
    let root: PathBuf = root.to_path_buf();

    let settings = LoopSettings::from_config(&cfg);
    let mut supervisor = TierSupervisor::from_config(&cfg, env, &root, start.paths.tiers_path.clone())?;
    let deadline = chrono::Duration::from_std(settings.max_wall_clock)
        .ok()
        .and_then(|limit| Utc::now().checked_add_signed(limit));
    if let Some(deadline) = deadline {
        supervisor = supervisor.with_deadline(deadline);
    }
    let llm = LlmClient::new(supervisor, RetryPolicy::from_config(&cfg.llm));
    let tools = WorkspaceTools::new(&root, cfg.commands.clone(), cfg.convergence.exclude_dirs.clone());
    let toolchain = CommandToolchain::from_config(&root, &cfg.commands);
    let mut memory = FileMemory::new(&start.paths.record_path, &start.paths.heuristics_path);
    let git = Git::new(&root);
    let prompts = PromptBuilder::new(cfg.agent.prompt_budget_bytes);
    let session = SessionSettings::from_config(&cfg);
    let fix_agent = CommandFixAgent::from_config(&root, &cfg.commands);
    let mut ledger = BudgetLedger::new(cfg.budget.limits(), cfg.budget.rates());

    let mut deps = PipelineDeps {
        llm: &llm,
        tools: &tools,
        toolchain: &toolchain,
        memory: &mut memory,
        git: &git,
        prompts: &prompts,
        settings: &session,
        deployments: &env.deployments,
        state: &start.paths,
    };
    run_loop(
        &mut deps,
        &fix_agent,
        &mut ledger,
        &settings,
        &start.run_id,
        start.baseline.clone(),
        on_iteration,
    )
}

/// Human-readable provider tier state for `fixloop tiers`.
pub fn tier_status(root: &Path) -> Result<String> {
    let paths = StatePaths::new(root);
    let cfg = load_config(&paths.config_path)?;
    let book = load_tier_book(&paths.tiers_path, Utc::now(), cfg.tiers.free_cooldown_secs)?;
    Ok(describe_tier_book(&book))
}
