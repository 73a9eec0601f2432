//! Cross-iteration memory: the persisted iteration record and a small
//! co-failure heuristic store that turns repeated failures into a fix hint.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::{PatchCandidate, SessionOutcome};

const ITERATION_RECORD_SCHEMA: &str = include_str!("../../schemas/iteration_record.schema.json");

/// Most files a hint names.
const HINT_FILE_LIMIT: usize = 3;

/// Summary of one builder attempt as remembered by the next iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub hypothesis: String,
    /// Session outcome label: `unified_diff`, `no_changes`, or `structured_error`.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AttemptSummary {
    pub fn from_candidate(candidate: &PatchCandidate) -> Self {
        let detail = match &candidate.outcome {
            SessionOutcome::UnifiedDiff(diff) => Some(crate::core::diff::summarize_diff(diff)),
            SessionOutcome::NoChanges => None,
            SessionOutcome::StructuredError(err) => Some(err.message.clone()),
        };
        Self {
            hypothesis: candidate.hypothesis.clone(),
            outcome: candidate.outcome.label().to_string(),
            detail: detail.filter(|d| !d.is_empty()),
        }
    }
}

/// What one outer iteration left behind for the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration: u32,
    /// Failing test names.
    pub last_failures: Vec<String>,
    /// Failing or recently touched source files.
    pub recent_files: Vec<String>,
    pub last_diff_summary: String,
    pub last_attempts: Vec<AttemptSummary>,
    pub last_build_ok: bool,
    pub last_test_ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_patch: Option<String>,
}

/// External memory collaborator consulted by the patch pipeline.
pub trait Memory {
    fn read_prior_state(&self) -> Result<Option<IterationRecord>>;
    /// A hint derived from past failures of these tests/files, if any.
    fn suggest_fix(&self, failed_tests: &[String], failed_files: &[String]) -> Result<Option<String>>;
    fn record_outcome(&mut self, record: &IterationRecord) -> Result<()>;
    /// Called after a failed build so code-intelligence caches can be rebuilt.
    fn refresh_code_intel(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Co-failure counts accumulated across iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Heuristics {
    /// test name -> file -> times they failed together.
    pub co_failures: BTreeMap<String, BTreeMap<String, u32>>,
    /// file -> times it appeared in a failing iteration.
    pub file_failures: BTreeMap<String, u32>,
}

impl Heuristics {
    pub fn observe(&mut self, failed_tests: &[String], files: &[String]) {
        for file in files {
            *self.file_failures.entry(file.clone()).or_default() += 1;
        }
        for test in failed_tests {
            let row = self.co_failures.entry(test.clone()).or_default();
            for file in files {
                *row.entry(file.clone()).or_default() += 1;
            }
        }
    }

    /// Files ranked by how often they failed alongside these tests.
    pub fn rank(&self, failed_tests: &[String], failed_files: &[String]) -> Vec<(String, u32)> {
        let mut scores: BTreeMap<&str, u32> = BTreeMap::new();
        for test in failed_tests {
            if let Some(row) = self.co_failures.get(test) {
                for (file, count) in row {
                    *scores.entry(file).or_default() += count;
                }
            }
        }
        for file in failed_files {
            if let Some(count) = self.file_failures.get(file) {
                *scores.entry(file).or_default() += count;
            }
        }
        let mut ranked: Vec<(String, u32)> = scores
            .into_iter()
            .filter(|(_, score)| *score > 0)
            .map(|(file, score)| (file.to_string(), score))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    pub fn hint(&self, failed_tests: &[String], failed_files: &[String]) -> Option<String> {
        let ranked = self.rank(failed_tests, failed_files);
        if ranked.is_empty() {
            return None;
        }
        let files: Vec<String> = ranked
            .iter()
            .take(HINT_FILE_LIMIT)
            .map(|(file, score)| format!("{file} ({score}x)"))
            .collect();
        Some(format!(
            "fix recurring failures in {}",
            files.join(", ")
        ))
    }
}

/// File-backed memory under `.fixloop/memory/`.
#[derive(Debug, Clone)]
pub struct FileMemory {
    record_path: PathBuf,
    heuristics_path: PathBuf,
}

impl FileMemory {
    pub fn new(record_path: impl Into<PathBuf>, heuristics_path: impl Into<PathBuf>) -> Self {
        Self {
            record_path: record_path.into(),
            heuristics_path: heuristics_path.into(),
        }
    }

    pub fn load_heuristics(&self) -> Result<Heuristics> {
        if !self.heuristics_path.exists() {
            return Ok(Heuristics::default());
        }
        let contents = fs::read_to_string(&self.heuristics_path)
            .with_context(|| format!("read {}", self.heuristics_path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", self.heuristics_path.display()))
    }
}

impl Memory for FileMemory {
    fn read_prior_state(&self) -> Result<Option<IterationRecord>> {
        if !self.record_path.exists() {
            return Ok(None);
        }
        load_record(&self.record_path).map(Some)
    }

    fn suggest_fix(&self, failed_tests: &[String], failed_files: &[String]) -> Result<Option<String>> {
        Ok(self.load_heuristics()?.hint(failed_tests, failed_files))
    }

    #[instrument(skip_all, fields(iteration = record.iteration))]
    fn record_outcome(&mut self, record: &IterationRecord) -> Result<()> {
        write_record(&self.record_path, record)?;
        if record.last_build_ok && record.last_test_ok {
            return Ok(());
        }
        let mut heuristics = self.load_heuristics()?;
        heuristics.observe(&record.last_failures, &record.recent_files);
        write_json_atomic(&self.heuristics_path, &serde_json::to_value(&heuristics)?)?;
        debug!(
            tests = record.last_failures.len(),
            files = record.recent_files.len(),
            "heuristics updated"
        );
        Ok(())
    }
}

/// Load and schema-validate an iteration record.
pub fn load_record(path: &Path) -> Result<IterationRecord> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_record(&value).with_context(|| format!("validate {}", path.display()))?;
    serde_json::from_value(value).with_context(|| format!("deserialize {}", path.display()))
}

pub fn write_record(path: &Path, record: &IterationRecord) -> Result<()> {
    let value = serde_json::to_value(record).context("serialize iteration record")?;
    validate_record(&value)?;
    write_json_atomic(path, &value)
}

/// Validate an iteration record against the embedded JSON Schema (Draft 2020-12).
pub fn validate_record(instance: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(ITERATION_RECORD_SCHEMA).context("parse iteration record schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile iteration record schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "iteration record schema validation failed:\n- {}",
            messages.join("\n- ")
        ));
    }
    Ok(())
}

fn write_json_atomic(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Role;
    use serde_json::json;

    fn failing_record() -> IterationRecord {
        IterationRecord {
            iteration: 3,
            last_failures: vec!["tests::parses_header".to_string()],
            recent_files: vec!["src/parser.rs".to_string()],
            last_diff_summary: "src/parser.rs (+2 -1)".to_string(),
            last_attempts: vec![
                AttemptSummary::from_candidate(&PatchCandidate {
                    hypothesis: "fix failing tests".to_string(),
                    outcome: SessionOutcome::NoChanges,
                }),
                AttemptSummary::from_candidate(&PatchCandidate {
                    hypothesis: "fix test setup/mocks".to_string(),
                    outcome: SessionOutcome::parse_error(Role::Builder, "not json"),
                }),
            ],
            last_build_ok: true,
            last_test_ok: false,
            chosen_patch: Some("--- a/src/parser.rs\n+++ b/src/parser.rs\n".to_string()),
        }
    }

    #[test]
    fn record_round_trips_through_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut memory = FileMemory::new(temp.path().join("r.json"), temp.path().join("h.json"));
        assert_eq!(memory.read_prior_state().expect("read"), None);

        let record = failing_record();
        memory.record_outcome(&record).expect("record");
        let loaded = memory.read_prior_state().expect("read").expect("some");
        assert_eq!(loaded.iteration, 3);
        assert_eq!(loaded.last_failures, record.last_failures);
        assert_eq!(loaded.recent_files, record.recent_files);
        assert!(loaded.last_build_ok);
        assert!(!loaded.last_test_ok);
        assert_eq!(loaded.last_attempts[1].detail.as_deref(), Some("not json"));
    }

    #[test]
    fn serialized_field_names_are_camel_case() {
        let value = serde_json::to_value(failing_record()).expect("to value");
        assert!(value.get("lastFailures").is_some());
        assert!(value.get("lastBuildOk").is_some());
        assert!(value.get("chosenPatch").is_some());
    }

    #[test]
    fn schema_rejects_malformed_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("r.json");
        fs::write(
            &path,
            serde_json::to_string(&json!({
                "iteration": 0,
                "lastFailures": [],
                "recentFiles": [],
                "lastDiffSummary": "",
                "lastAttempts": [],
                "lastBuildOk": "yes",
                "lastTestOk": false
            }))
            .expect("json"),
        )
        .expect("write");
        let err = load_record(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn repeated_co_failures_produce_a_hint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut memory = FileMemory::new(temp.path().join("r.json"), temp.path().join("h.json"));
        let tests = vec!["tests::parses_header".to_string()];
        assert_eq!(memory.suggest_fix(&tests, &[]).expect("suggest"), None);

        memory.record_outcome(&failing_record()).expect("record");
        let mut second = failing_record();
        second.iteration = 4;
        second.recent_files.push("src/lexer.rs".to_string());
        memory.record_outcome(&second).expect("record");

        let hint = memory.suggest_fix(&tests, &[]).expect("suggest").expect("hint");
        assert_eq!(hint, "fix recurring failures in src/parser.rs (2x), src/lexer.rs (1x)");
    }

    #[test]
    fn passing_iterations_do_not_touch_heuristics() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut memory = FileMemory::new(temp.path().join("r.json"), temp.path().join("h.json"));
        let mut record = failing_record();
        record.last_test_ok = true;
        memory.record_outcome(&record).expect("record");
        assert_eq!(memory.load_heuristics().expect("load"), Heuristics::default());
    }

    #[test]
    fn failing_files_alone_rank_by_history() {
        let mut heuristics = Heuristics::default();
        heuristics.observe(&[], &["a.rs".to_string(), "b.rs".to_string()]);
        heuristics.observe(&[], &["b.rs".to_string()]);
        let ranked = heuristics.rank(&[], &["a.rs".to_string(), "b.rs".to_string()]);
        assert_eq!(ranked, vec![("b.rs".to_string(), 2), ("a.rs".to_string(), 1)]);
    }
}
