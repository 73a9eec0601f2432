//! One outer iteration of the repair loop.
//!
//! Reset to baseline, run one builder session per hypothesis, let the judge
//! pick a candidate, let the reviewer refine it, then apply, build, and test.
//! Apply/build/test failures are recorded as values and fed to the next
//! iteration through memory; only a green build+test commits.

use std::fmt;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{BudgetError, BudgetLedger};
use crate::core::diff::{changed_files, is_unified_diff, strip_code_fence, summarize_diff};
use crate::core::failures::{TestFailures, extract_failures};
use crate::core::types::{IterationOutcome, PatchCandidate, Role, SessionOutcome};
use crate::io::config::Deployments;
use crate::io::git::Git;
use crate::io::iteration_log::{IterationMeta, IterationPaths, write_text};
use crate::io::layout::StatePaths;
use crate::io::llm::{LlmClient, Transport};
use crate::io::memory::{AttemptSummary, IterationRecord, Memory};
use crate::io::prompt::{PromptBuilder, RepairContext};
use crate::io::repo_tools::RepositoryTools;
use crate::io::toolchain::Toolchain;
use crate::session::{AgentSession, SessionEnv, SessionSettings};

/// Hypotheses every iteration tries, after any memory hint.
pub const FIXED_HYPOTHESES: [&str; 3] = [
    "fix failing tests",
    "fix core services",
    "fix test setup/mocks",
];

/// The chosen patch text is not a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDiffError {
    pub preview: String,
}

impl fmt::Display for InvalidDiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chosen patch is not a unified diff: {:?}", self.preview)
    }
}

impl std::error::Error for InvalidDiffError {}

/// Accept `text` only if it is diff-shaped.
pub fn validate_patch(text: &str) -> Result<&str, InvalidDiffError> {
    if is_unified_diff(text) {
        return Ok(text);
    }
    Err(InvalidDiffError {
        preview: text.chars().take(80).collect(),
    })
}

/// Collaborators for one iteration.
pub struct PipelineDeps<'a, T> {
    pub llm: &'a LlmClient<T>,
    pub tools: &'a dyn RepositoryTools,
    pub toolchain: &'a dyn Toolchain,
    pub memory: &'a mut dyn Memory,
    pub git: &'a Git,
    pub prompts: &'a PromptBuilder,
    pub settings: &'a SessionSettings,
    pub deployments: &'a Deployments,
    pub state: &'a StatePaths,
}

#[derive(Debug, Clone, Copy)]
pub struct IterationInput<'a> {
    pub run_id: &'a str,
    pub iter: u32,
    /// Last known-good commit; the tree is reset here first.
    pub baseline: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iter: u32,
    pub outcome: IterationOutcome,
    pub detail: Option<String>,
    pub failures: TestFailures,
    /// Set when the iteration stopped on a budget limit.
    pub budget: Option<BudgetError>,
    /// New baseline after a successful commit.
    pub committed: Option<String>,
}

/// Mutable progress through one iteration; survives early exits so the record and meta stay complete.
#[derive(Debug, Default)]
struct Progress {
    hypotheses: Vec<String>,
    candidates: Vec<PatchCandidate>,
    chosen: Option<String>,
    reviewer_replaced: bool,
    build_ok: bool,
    test_ok: bool,
    failures: TestFailures,
    detail: Option<String>,
    committed: Option<String>,
}

/// Run one iteration.
///
/// Returns `Err` only for failures the recovery supervisor must handle: forbidden or unknown
/// tools, exhausted LLM retries, empty choices, and I/O errors. Budget violations end the
/// iteration with [`IterationOutcome::BudgetExceeded`].
#[instrument(skip_all, fields(run_id = input.run_id, iter = input.iter))]
pub fn run_iteration<T: Transport>(
    deps: &mut PipelineDeps<'_, T>,
    ledger: &mut BudgetLedger,
    input: IterationInput<'_>,
) -> Result<IterationReport> {
    let started_at = Utc::now();
    let start = Instant::now();
    let iteration_start_tokens = ledger.total_tokens();
    let paths = IterationPaths::new(deps.state, input.run_id, input.iter);
    paths.create()?;

    deps.git
        .reset_to(input.baseline)
        .context("reset to baseline")?;

    let prior = deps.memory.read_prior_state().context("read prior iteration record")?;
    let (prior_tests, prior_files) = prior
        .as_ref()
        .map(|r| (r.last_failures.clone(), r.recent_files.clone()))
        .unwrap_or_default();
    let hint = deps
        .memory
        .suggest_fix(&prior_tests, &prior_files)
        .context("suggest fix")?;
    let ctx = RepairContext::from_record(prior.as_ref(), hint.clone());

    let mut progress = Progress {
        hypotheses: hint
            .into_iter()
            .chain(FIXED_HYPOTHESES.iter().map(|h| h.to_string()))
            .collect(),
        ..Progress::default()
    };

    let attempt = attempt_patch(deps, ledger, iteration_start_tokens, input, &ctx, &paths, &mut progress);
    let (mut outcome, mut budget) = match attempt {
        Ok(outcome) => (outcome, None),
        Err(err) => match err.downcast_ref::<BudgetError>() {
            Some(budget_err) => {
                warn!(err = %budget_err, "budget exceeded, aborting iteration");
                progress.detail = Some(budget_err.to_string());
                (IterationOutcome::BudgetExceeded, Some(budget_err.clone()))
            }
            None => {
                paths.write_candidates(&progress.candidates)?;
                write_text(&paths.error_log_path, &format!("{err:#}\n"))?;
                return Err(err);
            }
        },
    };

    if budget.is_none() && outcome != IterationOutcome::Fixed {
        if let Err(budget_err) = ledger.enforce(iteration_start_tokens) {
            warn!(err = %budget_err, "budget exceeded at end of iteration");
            progress.detail = Some(budget_err.to_string());
            outcome = IterationOutcome::BudgetExceeded;
            budget = Some(budget_err);
        }
    }

    paths.write_candidates(&progress.candidates)?;

    deps.memory
        .record_outcome(&build_record(input.iter, &progress))
        .context("record iteration outcome")?;

    if outcome == IterationOutcome::Fixed {
        let summary = progress
            .chosen
            .as_deref()
            .map(summarize_diff)
            .unwrap_or_default();
        let message = format!("fix(fixloop): iteration {} of {}\n\n{summary}\n", input.iter, input.run_id);
        deps.git.commit_all(&message).context("commit fix")?;
        let head = deps.git.head_sha()?;
        info!(commit = %head, "fix committed");
        progress.committed = Some(head);
    }

    let ended_at = Utc::now();
    paths.write_meta(&IterationMeta {
        run_id: input.run_id.to_string(),
        iter: input.iter,
        baseline: input.baseline.to_string(),
        outcome,
        hypotheses: progress.hypotheses.clone(),
        candidate_outcomes: progress
            .candidates
            .iter()
            .map(|c| c.outcome.label().to_string())
            .collect(),
        reviewer_replaced: progress.reviewer_replaced,
        failing_tests: progress.failures.tests.clone(),
        failing_files: progress.failures.files.clone(),
        detail: progress.detail.clone(),
        usage: ledger.snapshot(),
        iteration_tokens: ledger.total_tokens().saturating_sub(iteration_start_tokens),
        started_at: started_at.to_rfc3339(),
        ended_at: ended_at.to_rfc3339(),
        duration_ms: start.elapsed().as_millis() as u64,
    })?;

    info!(outcome = %outcome, "iteration finished");
    Ok(IterationReport {
        iter: input.iter,
        outcome,
        detail: progress.detail,
        failures: progress.failures,
        budget,
        committed: progress.committed,
    })
}

fn with_trailing_newline(text: &str) -> String {
    let mut out = text.to_string();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn attempt_patch<T: Transport>(
    deps: &mut PipelineDeps<'_, T>,
    ledger: &mut BudgetLedger,
    iteration_start_tokens: u64,
    input: IterationInput<'_>,
    ctx: &RepairContext,
    paths: &IterationPaths,
    progress: &mut Progress,
) -> Result<IterationOutcome> {
    let mut env = SessionEnv {
        llm: deps.llm,
        ledger,
        iteration_start_tokens,
        tools: deps.tools,
        settings: deps.settings,
    };

    let builder_system = deps.prompts.system_prompt(Role::Builder)?;
    for hypothesis in progress.hypotheses.clone() {
        let context = deps.prompts.builder_context(ctx, &hypothesis)?;
        let mut session = AgentSession::new(
            Role::Builder,
            deps.deployments.for_role(Role::Builder),
            builder_system.clone(),
            context,
        );
        let outcome = session.run(&mut env)?;
        debug!(%hypothesis, outcome = outcome.label(), "builder finished");
        progress.candidates.push(PatchCandidate { hypothesis, outcome });
        // Builders may write files through tools; each starts from the baseline.
        deps.git.reset_to(input.baseline)?;
    }

    let judge_context = deps.prompts.judge_context(ctx, &progress.candidates)?;
    let mut judge = AgentSession::new(
        Role::Judge,
        deps.deployments.for_role(Role::Judge),
        deps.prompts.system_prompt(Role::Judge)?,
        judge_context,
    );
    let raw = judge.run_verbatim(&mut env)?;
    write_text(&paths.judge_path, &raw)?;
    let mut chosen = strip_code_fence(&raw).to_string();
    progress.chosen = Some(chosen.clone());

    // The reviewer inspects the chosen patch in place through `show_diff`.
    if is_unified_diff(&chosen) {
        write_text(&paths.patch_path, &with_trailing_newline(&chosen))?;
        if let Some(reason) = deps.git.try_apply(&paths.patch_path)? {
            debug!(%reason, "chosen patch does not apply; reviewer sees the baseline");
        }
    }
    let reviewer_context = deps.prompts.reviewer_context(ctx, &chosen)?;
    let mut reviewer = AgentSession::new(
        Role::Reviewer,
        deps.deployments.for_role(Role::Reviewer),
        deps.prompts.system_prompt(Role::Reviewer)?,
        reviewer_context,
    );
    let review = reviewer.run(&mut env)?;
    write_text(&paths.review_path, &review.render())?;
    if let SessionOutcome::UnifiedDiff(diff) = review {
        debug!("reviewer replaced the chosen patch");
        chosen = diff;
        progress.reviewer_replaced = true;
        progress.chosen = Some(chosen.clone());
    }
    deps.git.reset_to(input.baseline)?;

    let patch = match validate_patch(&chosen) {
        Ok(patch) => patch,
        Err(err) => {
            warn!(%err, "format failure");
            progress.detail = Some(err.to_string());
            return Ok(IterationOutcome::FormatFailure);
        }
    };
    let patch_text = with_trailing_newline(patch);
    write_text(&paths.patch_path, &patch_text)?;

    if let Some(reason) = deps.git.try_apply(&paths.patch_path)? {
        progress.detail = Some(reason);
        return Ok(IterationOutcome::ApplyFailed);
    }

    let build = deps.toolchain.build()?;
    write_text(&paths.build_log_path, &build.log)?;
    if !build.ok {
        progress.failures = extract_failures(&build.log);
        progress.detail = Some("build failed".to_string());
        deps.memory.refresh_code_intel().context("refresh code intelligence")?;
        return Ok(IterationOutcome::BuildFailed);
    }
    progress.build_ok = true;

    let test = deps.toolchain.test()?;
    write_text(&paths.test_log_path, &test.log)?;
    if !test.ok {
        progress.failures = extract_failures(&test.log);
        progress.detail = Some(format!(
            "{} failing tests",
            progress.failures.tests.len()
        ));
        return Ok(IterationOutcome::TestsFailed);
    }
    progress.test_ok = true;
    Ok(IterationOutcome::Fixed)
}

fn build_record(iter: u32, progress: &Progress) -> IterationRecord {
    let patch = progress.chosen.as_deref().filter(|p| is_unified_diff(p));
    let mut recent_files = progress.failures.files.clone();
    for file in patch.map(changed_files).unwrap_or_default() {
        if !recent_files.contains(&file) {
            recent_files.push(file);
        }
    }
    IterationRecord {
        iteration: iter,
        last_failures: progress.failures.tests.clone(),
        recent_files,
        last_diff_summary: patch.map(summarize_diff).unwrap_or_default(),
        last_attempts: progress
            .candidates
            .iter()
            .map(AttemptSummary::from_candidate)
            .collect(),
        last_build_ok: progress.build_ok,
        last_test_ok: progress.test_ok,
        chosen_patch: patch.map(str::to_string),
    }
}
