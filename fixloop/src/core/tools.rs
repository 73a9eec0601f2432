//! Tool registry: the closed set of tool calls, the role permission table, and
//! per-tool invocation caps.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::types::Role;

/// Names of every tool an agent can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    SearchFiles,
    WriteFile,
    RunTests,
    GetCoverage,
    GetSymbols,
    ShowDiff,
}

impl ToolName {
    pub const ALL: [ToolName; 6] = [
        ToolName::SearchFiles,
        ToolName::WriteFile,
        ToolName::RunTests,
        ToolName::GetCoverage,
        ToolName::GetSymbols,
        ToolName::ShowDiff,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::SearchFiles => "search_files",
            ToolName::WriteFile => "write_file",
            ToolName::RunTests => "run_tests",
            ToolName::GetCoverage => "get_coverage",
            ToolName::GetSymbols => "get_symbols",
            ToolName::ShowDiff => "show_diff",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| format!("unknown tool '{s}'"))
    }
}

/// A validated tool request. Deserialized from `{"tool": "<name>", ...params}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    SearchFiles { pattern: String },
    WriteFile { path: String, content: String },
    RunTests,
    GetCoverage,
    GetSymbols { path: String },
    ShowDiff,
}

impl ToolCall {
    pub fn name(&self) -> ToolName {
        match self {
            ToolCall::SearchFiles { .. } => ToolName::SearchFiles,
            ToolCall::WriteFile { .. } => ToolName::WriteFile,
            ToolCall::RunTests => ToolName::RunTests,
            ToolCall::GetCoverage => ToolName::GetCoverage,
            ToolCall::GetSymbols { .. } => ToolName::GetSymbols,
            ToolCall::ShowDiff => ToolName::ShowDiff,
        }
    }
}

const BUILDER_TOOLS: &[ToolName] = &[
    ToolName::SearchFiles,
    ToolName::WriteFile,
    ToolName::RunTests,
    ToolName::GetCoverage,
    ToolName::GetSymbols,
];
const REVIEWER_TOOLS: &[ToolName] = &[ToolName::ShowDiff, ToolName::GetSymbols];
const JUDGE_TOOLS: &[ToolName] = &[];

/// Tools a role may invoke. The judge gets none.
pub fn permitted_tools(role: Role) -> &'static [ToolName] {
    match role {
        Role::Builder => BUILDER_TOOLS,
        Role::Reviewer => REVIEWER_TOOLS,
        Role::Judge => JUDGE_TOOLS,
    }
}

pub fn is_permitted(role: Role, tool: ToolName) -> bool {
    permitted_tools(role).contains(&tool)
}

/// Per-tool invocation caps for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolLimits {
    pub max_searches: u32,
    pub max_writes: u32,
    pub max_test_runs: u32,
    pub max_coverage_runs: u32,
    pub max_symbol_lookups: u32,
    pub max_diff_views: u32,
}

impl ToolLimits {
    pub fn cap(&self, tool: ToolName) -> u32 {
        match tool {
            ToolName::SearchFiles => self.max_searches,
            ToolName::WriteFile => self.max_writes,
            ToolName::RunTests => self.max_test_runs,
            ToolName::GetCoverage => self.max_coverage_runs,
            ToolName::GetSymbols => self.max_symbol_lookups,
            ToolName::ShowDiff => self.max_diff_views,
        }
    }
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            max_searches: 8,
            max_writes: 6,
            max_test_runs: 3,
            max_coverage_runs: 2,
            max_symbol_lookups: 8,
            max_diff_views: 4,
        }
    }
}

/// Invocation counters, keyed by tool. Only executed calls are counted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolCounters {
    counts: BTreeMap<ToolName, u32>,
}

impl ToolCounters {
    pub fn count(&self, tool: ToolName) -> u32 {
        self.counts.get(&tool).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    pub fn at_cap(&self, tool: ToolName, limits: &ToolLimits) -> bool {
        self.count(tool) >= limits.cap(tool)
    }

    pub fn increment(&mut self, tool: ToolName) {
        *self.counts.entry(tool).or_insert(0) += 1;
    }
}
