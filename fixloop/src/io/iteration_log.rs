//! Iteration artifacts under `.fixloop/iterations/<run-id>/<n>/`.
//!
//! Written for every iteration regardless of outcome; independent of tracing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::budget::LedgerSnapshot;
use crate::core::types::{IterationOutcome, PatchCandidate};
use crate::io::layout::StatePaths;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub run_id: String,
    pub iter: u32,
    pub baseline: String,
    pub outcome: IterationOutcome,
    pub hypotheses: Vec<String>,
    pub candidate_outcomes: Vec<String>,
    /// Whether the reviewer's diff replaced the judge's choice.
    pub reviewer_replaced: bool,
    pub failing_tests: Vec<String>,
    pub failing_files: Vec<String>,
    pub detail: Option<String>,
    pub usage: LedgerSnapshot,
    pub iteration_tokens: u64,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub judge_path: PathBuf,
    pub review_path: PathBuf,
    pub patch_path: PathBuf,
    pub build_log_path: PathBuf,
    pub test_log_path: PathBuf,
    /// Written only when the iteration ends in an error handed to recovery.
    pub error_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(paths: &StatePaths, run_id: &str, iter: u32) -> Self {
        let dir = paths.iteration_dir(run_id, iter);
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            judge_path: dir.join("judge.txt"),
            review_path: dir.join("review.txt"),
            patch_path: dir.join("patch.diff"),
            build_log_path: dir.join("build.log"),
            test_log_path: dir.join("test.log"),
            error_log_path: dir.join("error.log"),
        }
    }

    pub fn candidate_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("candidate-{index}.txt"))
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create iteration dir {}", self.dir.display()))
    }

    /// One file per builder candidate, numbered from 1.
    pub fn write_candidates(&self, candidates: &[PatchCandidate]) -> Result<()> {
        for (idx, candidate) in candidates.iter().enumerate() {
            let body = format!(
                "hypothesis: {}\noutcome: {}\n\n{}\n",
                candidate.hypothesis,
                candidate.outcome.label(),
                candidate.outcome.render()
            );
            write_text(&self.candidate_path(idx + 1), &body)?;
        }
        Ok(())
    }

    pub fn write_meta(&self, meta: &IterationMeta) -> Result<()> {
        write_json(&self.meta_path, meta)
    }
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
