//! Test-only fakes for the loop's collaborators and a throwaway git repository.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde_json::json;
use tempfile::TempDir;

use crate::core::budget::{BudgetLedger, BudgetLimits, BudgetRates};
use crate::core::tools::ToolCall;
use crate::io::config::Deployments;
use crate::io::layout::init_state_dir;
use crate::io::llm::{ChatRequest, ChatResponse, Transport};
use crate::io::memory::{IterationRecord, Memory};
use crate::io::providers::{BackendResult, Clock, TierBackend};
use crate::io::repo_tools::RepositoryTools;
use crate::io::toolchain::{CheckRun, Toolchain};

/// Single-choice response carrying OpenAI-style usage.
pub fn chat_response(text: &str, prompt_tokens: i64, completion_tokens: i64) -> ChatResponse {
    ChatResponse {
        usage: Some(json!({
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
        })),
        ..ChatResponse::from_text(text)
    }
}

pub fn test_deployments() -> Deployments {
    Deployments {
        builder: "builder-dep".to_string(),
        reviewer: "reviewer-dep".to_string(),
        judge: "judge-dep".to_string(),
    }
}

/// Ledger whose limits no test reaches by accident.
pub fn test_ledger() -> BudgetLedger {
    BudgetLedger::new(
        BudgetLimits {
            max_iteration_tokens: 1_000_000,
            max_total_tokens: 10_000_000,
            max_cost_gbp: 1_000.0,
        },
        BudgetRates {
            prompt_cost_per_1k: 0.001,
            completion_cost_per_1k: 0.002,
        },
    )
}

/// Transport that replays a fixed script and records every request.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<ChatResponse>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<ChatResponse>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests lock poisoned"))?
            .push(request.clone());
        self.script
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("scripted transport exhausted")))
    }
}

/// Tier backend that replays results, optionally repeating one forever.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<BackendResult>>,
    repeat: Option<BackendResult>,
    models: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<BackendResult>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            models: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(result: BackendResult) -> Self {
        Self {
            repeat: Some(result),
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.models.lock().map(|m| m.len()).unwrap_or_default()
    }

    /// Model argument of every invocation, in order.
    pub fn models(&self) -> Vec<String> {
        self.models.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl TierBackend for ScriptedBackend {
    fn invoke(&self, model: &str, _request: &ChatRequest, _timeout: Duration) -> Result<BackendResult> {
        self.models
            .lock()
            .map_err(|_| anyhow!("models lock poisoned"))?
            .push(model.to_string());
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .pop_front();
        next.or_else(|| self.repeat.clone())
            .ok_or_else(|| anyhow!("scripted backend exhausted"))
    }
}

/// Clock whose `sleep` advances time instantly.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: AtomicUsize,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: AtomicUsize::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        }
    }

    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        self.advance(duration);
    }
}

/// Repository tools that record calls and return canned output.
#[derive(Debug, Default)]
pub struct ScriptedTools {
    calls: Mutex<Vec<ToolCall>>,
    failure: Option<String>,
    write_root: Option<PathBuf>,
}

impl ScriptedTools {
    /// Every call fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// `write_file` really writes under `root`; `show_diff` reports its real diff.
    pub fn writing(root: &Path) -> Self {
        Self {
            write_root: Some(root.to_path_buf()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: ToolCall) -> Result<()> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("calls lock poisoned"))?
            .push(call);
        match &self.failure {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

impl RepositoryTools for ScriptedTools {
    fn search_files(&self, pattern: &str) -> Result<Vec<String>> {
        self.record(ToolCall::SearchFiles {
            pattern: pattern.to_string(),
        })?;
        Ok(vec!["src/lib.rs".to_string()])
    }

    fn write_file(&self, path: &str, content: &str) -> Result<String> {
        self.record(ToolCall::WriteFile {
            path: path.to_string(),
            content: content.to_string(),
        })?;
        if let Some(root) = &self.write_root {
            fs::write(root.join(path), content).with_context(|| format!("write {path}"))?;
        }
        Ok(format!("wrote {} bytes to {path}", content.len()))
    }

    fn run_tests(&self) -> Result<String> {
        self.record(ToolCall::RunTests)?;
        Ok("tests passed".to_string())
    }

    fn get_coverage(&self) -> Result<String> {
        self.record(ToolCall::GetCoverage)?;
        Ok("coverage 80%".to_string())
    }

    fn get_symbols(&self, path: &str) -> Result<String> {
        self.record(ToolCall::GetSymbols {
            path: path.to_string(),
        })?;
        Ok("1: pub fn answer()".to_string())
    }

    fn show_diff(&self) -> Result<String> {
        self.record(ToolCall::ShowDiff)?;
        match &self.write_root {
            Some(root) => crate::io::git::Git::new(root).diff(),
            None => Ok("working tree matches HEAD".to_string()),
        }
    }
}

/// Build and test results fixed up front.
#[derive(Debug)]
pub struct ScriptedToolchain {
    build: CheckRun,
    test: CheckRun,
    runs: AtomicUsize,
}

impl ScriptedToolchain {
    fn with(build: CheckRun, test: CheckRun) -> Self {
        Self {
            build,
            test,
            runs: AtomicUsize::new(0),
        }
    }

    pub fn passing() -> Self {
        Self::with(
            CheckRun {
                ok: true,
                log: "build ok\n".to_string(),
            },
            CheckRun {
                ok: true,
                log: "test result: ok\n".to_string(),
            },
        )
    }

    pub fn failing_build(log: &str) -> Self {
        Self {
            build: CheckRun {
                ok: false,
                log: log.to_string(),
            },
            ..Self::passing()
        }
    }

    pub fn failing_tests(log: &str) -> Self {
        Self {
            test: CheckRun {
                ok: false,
                log: log.to_string(),
            },
            ..Self::passing()
        }
    }

    /// Build plus test invocations so far.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Toolchain for ScriptedToolchain {
    fn build(&self) -> Result<CheckRun> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(self.build.clone())
    }

    fn test(&self) -> Result<CheckRun> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(self.test.clone())
    }
}

/// Memory kept in fields the test can inspect.
#[derive(Debug, Default)]
pub struct InMemoryMemory {
    /// Prior record served before anything is recorded.
    pub record: Option<IterationRecord>,
    pub hint: Option<String>,
    pub recorded: Vec<IterationRecord>,
    pub refreshes: u32,
}

impl Memory for InMemoryMemory {
    fn read_prior_state(&self) -> Result<Option<IterationRecord>> {
        Ok(self.recorded.last().cloned().or_else(|| self.record.clone()))
    }

    fn suggest_fix(&self, _failed_tests: &[String], _failed_files: &[String]) -> Result<Option<String>> {
        Ok(self.hint.clone())
    }

    fn record_outcome(&mut self, record: &IterationRecord) -> Result<()> {
        self.recorded.push(record.clone());
        Ok(())
    }

    fn refresh_code_intel(&mut self) -> Result<()> {
        self.refreshes += 1;
        Ok(())
    }
}

/// A committed git repository (`README.md` = "hi\n") with `.fixloop/` initialised.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let root = dir.path();
        git(root, &["init", "--quiet"])?;
        git(root, &["config", "user.email", "test@example.com"])?;
        git(root, &["config", "user.name", "test"])?;
        git(root, &["config", "commit.gpgsign", "false"])?;
        fs::write(root.join("README.md"), "hi\n").context("write README")?;
        git(root, &["add", "README.md"])?;
        git(root, &["commit", "--quiet", "-m", "chore: init"])?;
        init_state_dir(root, false)?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `content` to `rel`, creating parent directories.
    pub fn write(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))
    }

    /// Stage everything and commit.
    pub fn commit(&self, message: &str) -> Result<()> {
        git(self.root(), &["add", "-A"])?;
        git(self.root(), &["commit", "--quiet", "-m", message])
    }
}

fn git(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !status.success() {
        return Err(anyhow!("git {} failed", args.join(" ")));
    }
    Ok(())
}
