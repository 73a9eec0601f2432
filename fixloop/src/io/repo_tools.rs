//! Repository tools an agent session may call, and the default workspace-backed set.

use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::path::confined_relative_path;
use crate::core::tools::ToolCall;
use crate::io::config::CommandsConfig;
use crate::io::git::Git;
use crate::io::layout::STATE_DIR_NAME;
use crate::io::snapshot::source_files;
use crate::io::toolchain::run_check;

/// Most paths `search_files` returns.
pub const SEARCH_RESULT_LIMIT: usize = 200;

/// External repository collaborator behind the session's tool calls.
pub trait RepositoryTools {
    fn search_files(&self, pattern: &str) -> Result<Vec<String>>;
    fn write_file(&self, path: &str, content: &str) -> Result<String>;
    fn run_tests(&self) -> Result<String>;
    fn get_coverage(&self) -> Result<String>;
    fn get_symbols(&self, path: &str) -> Result<String>;
    fn show_diff(&self) -> Result<String>;
}

/// Dispatch one validated call and render its result for the agent's context.
pub fn execute_tool<R: RepositoryTools + ?Sized>(tools: &R, call: &ToolCall) -> Result<String> {
    match call {
        ToolCall::SearchFiles { pattern } => {
            let paths = tools.search_files(pattern)?;
            if paths.is_empty() {
                return Ok(format!("no files match {pattern:?}"));
            }
            Ok(paths.join("\n"))
        }
        ToolCall::WriteFile { path, content } => tools.write_file(path, content),
        ToolCall::RunTests => tools.run_tests(),
        ToolCall::GetCoverage => tools.get_coverage(),
        ToolCall::GetSymbols { path } => tools.get_symbols(path),
        ToolCall::ShowDiff => tools.show_diff(),
    }
}

static DEFINITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:pub(?:\([^)]*\))?\s+|export\s+|public\s+|private\s+|protected\s+|internal\s+|static\s+|async\s+|abstract\s+)*(?:fn|struct|enum|trait|impl|mod|type|class|interface|def|func|function|record)\b",
    )
    .expect("definition pattern should compile")
});

/// Tools backed by the checked-out repository and the configured commands.
#[derive(Debug, Clone)]
pub struct WorkspaceTools {
    root: PathBuf,
    commands: CommandsConfig,
    extra_excludes: Vec<String>,
}

impl WorkspaceTools {
    pub fn new(root: impl Into<PathBuf>, commands: CommandsConfig, extra_excludes: Vec<String>) -> Self {
        Self {
            root: root.into(),
            commands,
            extra_excludes,
        }
    }

    fn run_configured(&self, label: &str, argv: &[String]) -> Result<String> {
        let run = run_check(
            label,
            argv,
            &self.root,
            self.commands.timeout(),
            self.commands.output_limit_bytes,
        )?;
        let verdict = if run.ok { "passed" } else { "failed" };
        Ok(format!("{label} {verdict}\n{}", run.log))
    }
}

impl RepositoryTools for WorkspaceTools {
    /// Paths whose relative name or contents match `pattern` (a regex).
    #[instrument(skip_all, fields(pattern))]
    fn search_files(&self, pattern: &str) -> Result<Vec<String>> {
        let re = Regex::new(pattern).with_context(|| format!("invalid search pattern {pattern:?}"))?;
        let mut hits = Vec::new();
        for rel in source_files(&self.root, &self.extra_excludes) {
            let name = rel.to_string_lossy().into_owned();
            let matched = re.is_match(&name)
                || fs::read_to_string(self.root.join(&rel)).is_ok_and(|text| re.is_match(&text));
            if matched {
                hits.push(name);
                if hits.len() >= SEARCH_RESULT_LIMIT {
                    break;
                }
            }
        }
        debug!(hits = hits.len(), "search finished");
        Ok(hits)
    }

    #[instrument(skip_all, fields(path))]
    fn write_file(&self, path: &str, content: &str) -> Result<String> {
        let rel = confined_relative_path(path, STATE_DIR_NAME)?;
        let target = self.root.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&target, content).with_context(|| format!("write {}", rel.display()))?;
        Ok(format!("wrote {} bytes to {}", content.len(), rel.display()))
    }

    fn run_tests(&self) -> Result<String> {
        self.run_configured("tests", &self.commands.test)
    }

    fn get_coverage(&self) -> Result<String> {
        if self.commands.coverage.is_empty() {
            return Ok("coverage not configured".to_string());
        }
        self.run_configured("coverage", &self.commands.coverage)
    }

    /// Configured symbol command with the path appended, else a line scan for definitions.
    fn get_symbols(&self, path: &str) -> Result<String> {
        let rel = confined_relative_path(path, STATE_DIR_NAME)?;
        if !self.commands.symbols.is_empty() {
            let mut argv = self.commands.symbols.clone();
            argv.push(rel.to_string_lossy().into_owned());
            return self.run_configured("symbols", &argv);
        }
        let text = fs::read_to_string(self.root.join(&rel))
            .with_context(|| format!("read {}", rel.display()))?;
        let symbols: Vec<String> = text
            .lines()
            .enumerate()
            .filter(|(_, line)| DEFINITION_RE.is_match(line))
            .map(|(idx, line)| format!("{}: {}", idx + 1, line.trim()))
            .collect();
        if symbols.is_empty() {
            return Ok(format!("no definitions found in {}", rel.display()));
        }
        Ok(symbols.join("\n"))
    }

    fn show_diff(&self) -> Result<String> {
        let diff = Git::new(&self.root).diff()?;
        if diff.trim().is_empty() {
            return Ok("working tree matches HEAD".to_string());
        }
        Ok(diff)
    }
}

/// Reject a call whose arguments are malformed for its tool.
pub fn parse_tool_call(object: &serde_json::Map<String, serde_json::Value>) -> Result<ToolCall> {
    serde_json::from_value(serde_json::Value::Object(object.clone()))
        .map_err(|err| anyhow!("invalid tool arguments: {err}"))
}
