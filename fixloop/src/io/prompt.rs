//! Prompt rendering for agent sessions.
//!
//! Templates are minijinja documents split into sections by HTML comment
//! markers; droppable sections are removed (least important first) when the
//! rendered context exceeds the byte budget.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::tools::permitted_tools;
use crate::core::types::{PatchCandidate, Role};
use crate::io::memory::{AttemptSummary, IterationRecord};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const BUILDER_TEMPLATE: &str = include_str!("prompts/builder.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");
const JUDGE_TEMPLATE: &str = include_str!("prompts/judge.md");

/// Drop order when over budget: least important first.
const DROP_ORDER: &[&str] = &["patch", "attempts", "diff", "files", "hint", "failures"];

/// What the previous iteration left behind, as seen by the next prompts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairContext {
    pub iteration: Option<u32>,
    pub build_ok: bool,
    pub test_ok: bool,
    pub failures: Vec<String>,
    pub files: Vec<String>,
    pub diff_summary: String,
    /// The diff the previous iteration applied, when it was one.
    pub previous_patch: Option<String>,
    pub attempts: Vec<AttemptSummary>,
    pub hint: Option<String>,
}

impl RepairContext {
    pub fn from_record(record: Option<&IterationRecord>, hint: Option<String>) -> Self {
        let Some(record) = record else {
            return Self {
                hint,
                ..Self::default()
            };
        };
        Self {
            iteration: Some(record.iteration),
            build_ok: record.last_build_ok,
            test_ok: record.last_test_ok,
            failures: record.last_failures.clone(),
            files: record.recent_files.clone(),
            diff_summary: record.last_diff_summary.clone(),
            previous_patch: record.chosen_patch.clone(),
            attempts: record.last_attempts.clone(),
            hint,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct CandidateView<'a> {
    hypothesis: &'a str,
    text: String,
}

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("builder", BUILDER_TEMPLATE)
            .expect("builder template should be valid");
        env.add_template("reviewer", REVIEWER_TEMPLATE)
            .expect("reviewer template should be valid");
        env.add_template("judge", JUDGE_TEMPLATE)
            .expect("judge template should be valid");
        Self { env }
    }
}

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker pattern should compile")
});

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
            ))
        })
        .collect();
    let mut sections = Vec::new();
    for (i, (_, end, key, required)) in markers.iter().enumerate() {
        let stop = markers.get(i + 1).map_or(rendered.len(), |next| next.0);
        let content = rendered[*end..stop].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(section = key, bytes_dropped = sections[idx].content.len(), "dropped section for budget");
            sections.remove(idx);
        }
    }
    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let allowed = last.content.len().saturating_sub(total - budget);
    let mut cut = allowed;
    while cut > 0 && !last.content.is_char_boundary(cut) {
        cut -= 1;
    }
    debug!(section = last.key, before_len = last.content.len(), after_len = cut, "truncated section for budget");
    last.content.truncate(cut);
    last.content.push_str("\n[truncated]");
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders system prompts and initial contexts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    fn finish(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }

    /// Role contract plus the tools the role may call.
    pub fn system_prompt(&self, role: Role) -> Result<String> {
        let tools: Vec<&str> = permitted_tools(role).iter().map(|t| t.as_str()).collect();
        let rendered = ENGINE.env.get_template("system")?.render(context! {
            role => role.as_str(),
            tools => tools,
        })?;
        Ok(render_sections(&parse_sections(&rendered)))
    }

    pub fn builder_context(&self, ctx: &RepairContext, hypothesis: &str) -> Result<String> {
        let rendered = ENGINE.env.get_template("builder")?.render(context! {
            hypothesis => hypothesis,
            hint => ctx.hint.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            iteration => ctx.iteration,
            build_ok => ctx.build_ok,
            test_ok => ctx.test_ok,
            failures => &ctx.failures,
            files => &ctx.files,
            diff_summary => (!ctx.diff_summary.trim().is_empty()).then(|| ctx.diff_summary.trim()),
            previous_patch => ctx.previous_patch.as_deref().map(str::trim_end).filter(|p| !p.is_empty()),
            attempts => &ctx.attempts,
        })?;
        Ok(self.finish(&rendered))
    }

    /// Every candidate in order, rendered for the judge (diffs verbatim, others tagged).
    pub fn judge_context(&self, ctx: &RepairContext, candidates: &[PatchCandidate]) -> Result<String> {
        let views: Vec<CandidateView<'_>> = candidates
            .iter()
            .map(|c| CandidateView {
                hypothesis: &c.hypothesis,
                text: c.outcome.render(),
            })
            .collect();
        let rendered = ENGINE.env.get_template("judge")?.render(context! {
            failures => &ctx.failures,
            candidates => views,
        })?;
        Ok(self.finish(&rendered))
    }

    pub fn reviewer_context(&self, ctx: &RepairContext, patch: &str) -> Result<String> {
        let rendered = ENGINE.env.get_template("reviewer")?.render(context! {
            patch => patch.trim_end(),
            failures => &ctx.failures,
            files => &ctx.files,
        })?;
        Ok(self.finish(&rendered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SessionOutcome;

    fn context() -> RepairContext {
        RepairContext {
            iteration: Some(2),
            build_ok: true,
            test_ok: false,
            failures: vec!["tests::adds".to_string()],
            files: vec!["src/math.rs".to_string()],
            diff_summary: "src/math.rs (+1 -1)".to_string(),
            previous_patch: Some(
                "--- a/src/math.rs\n+++ b/src/math.rs\n@@ -1 +1 @@\n-a - b\n+a + b\n".to_string(),
            ),
            attempts: vec![AttemptSummary {
                hypothesis: "fix failing tests".to_string(),
                outcome: "no_changes".to_string(),
                detail: None,
            }],
            hint: Some("fix recurring failures in src/math.rs (2x)".to_string()),
        }
    }

    #[test]
    fn builder_context_orders_sections() {
        let content = PromptBuilder::new(10_000)
            .builder_context(&context(), "fix core services")
            .expect("render");
        let order = [
            "### Hypothesis",
            "### Memory Hint",
            "### Last Iteration",
            "### Failing Tests",
            "### Failing Files",
            "### Previous Patch",
            "### Previous Diff",
            "### Previous Attempts",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|h| content.find(h).unwrap_or_else(|| panic!("missing {h}")))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{content}");
        assert!(content.contains("Iteration 2: build ok, tests failed."));
        assert!(content.contains("- tests::adds"));
        assert!(content.contains("+a + b"));
    }

    #[test]
    fn previous_diff_comes_from_the_record() {
        let record = IterationRecord {
            iteration: 4,
            chosen_patch: Some("--- a/lib.rs\n+++ b/lib.rs\n@@ -2 +2 @@\n-old_call()\n+new_call()\n".to_string()),
            ..IterationRecord::default()
        };
        let ctx = RepairContext::from_record(Some(&record), None);
        let content = PromptBuilder::new(10_000)
            .builder_context(&ctx, "fix failing tests")
            .expect("render");
        assert!(content.contains("### Previous Diff"));
        assert!(content.contains("+new_call()"));
    }

    #[test]
    fn budget_drops_previous_diff_first() {
        let mut ctx = context();
        ctx.previous_patch = Some(format!("--- a/x\n+++ b/x\n@@ -1 +1 @@\n+{}\n", "y".repeat(2_000)));
        let content = PromptBuilder::new(1_000)
            .builder_context(&ctx, "fix failing tests")
            .expect("render");
        assert!(!content.contains("### Previous Diff"));
        assert!(content.contains("### Previous Attempts"));
    }

    #[test]
    fn first_iteration_has_no_history_sections() {
        let content = PromptBuilder::new(10_000)
            .builder_context(&RepairContext::default(), "fix failing tests")
            .expect("render");
        assert!(content.contains("No previous iteration."));
        assert!(!content.contains("### Failing Tests"));
        assert!(!content.contains("### Memory Hint"));
    }

    #[test]
    fn budget_drops_attempts_before_failures() {
        let mut ctx = context();
        ctx.attempts = (0..40)
            .map(|i| AttemptSummary {
                hypothesis: format!("hypothesis number {i}"),
                outcome: "structured_error".to_string(),
                detail: Some("x".repeat(40)),
            })
            .collect();
        let content = PromptBuilder::new(500)
            .builder_context(&ctx, "fix failing tests")
            .expect("render");
        assert!(!content.contains("### Previous Attempts"));
        assert!(content.contains("### Hypothesis"));
        assert!(content.contains("### Failing Tests"));
    }

    #[test]
    fn system_prompt_lists_only_permitted_tools() {
        let builder = PromptBuilder::new(10_000);
        let reviewer = builder.system_prompt(Role::Reviewer).expect("render");
        assert!(reviewer.contains("### Reviewer Contract"));
        assert!(reviewer.contains("`show_diff`"));
        assert!(!reviewer.contains("`write_file`"));
        let judge = builder.system_prompt(Role::Judge).expect("render");
        assert!(!judge.contains("### Tools"));
        assert!(!judge.contains("\"tool\""));
    }

    #[test]
    fn judge_sees_every_candidate_in_order() {
        let candidates = vec![
            PatchCandidate {
                hypothesis: "fix failing tests".to_string(),
                outcome: SessionOutcome::UnifiedDiff("--- a/x\n+++ b/x\n".to_string()),
            },
            PatchCandidate {
                hypothesis: "fix core services".to_string(),
                outcome: SessionOutcome::NoChanges,
            },
        ];
        let content = PromptBuilder::new(10_000)
            .judge_context(&context(), &candidates)
            .expect("render");
        let first = content.find("Candidate 1: fix failing tests").expect("first");
        let second = content.find("Candidate 2: fix core services").expect("second");
        assert!(first < second);
        assert!(content.contains("--- a/x\n+++ b/x"));
        assert!(content.contains("NO_CHANGES"));
    }

    #[test]
    fn reviewer_context_carries_patch() {
        let content = PromptBuilder::new(10_000)
            .reviewer_context(&context(), "--- a/x\n+++ b/x\n")
            .expect("render");
        assert!(content.contains("<patch>\n--- a/x\n+++ b/x\n</patch>"));
    }
}
