//! Loop configuration stored under `.fixloop/config.toml`, plus the LLM
//! credentials and deployment ids read from the environment.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::{BudgetLimits, BudgetRates};
use crate::core::tools::ToolLimits;
use crate::core::types::Role;

/// Loop configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FixloopConfig {
    #[serde(rename = "loop")]
    pub looping: LoopConfig,
    pub agent: AgentConfig,
    pub budget: BudgetConfig,
    pub llm: LlmConfig,
    pub tiers: TiersConfig,
    pub commands: CommandsConfig,
    pub convergence: ConvergenceConfig,
    pub recovery: RecoveryConfig,
    pub personas: PersonasConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Outer iterations before the run gives up.
    pub max_loops: u32,
    /// Wall-clock ceiling for the whole run.
    pub max_wall_clock_secs: u64,
    /// Consecutive unchanged content hashes that count as convergence.
    pub stagnation_threshold: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_loops: 10,
            max_wall_clock_secs: 6 * 60 * 60,
            stagnation_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub max_agent_iterations: u32,
    pub max_searches: u32,
    pub max_writes: u32,
    pub max_test_runs: u32,
    pub max_coverage_runs: u32,
    pub max_symbol_lookups: u32,
    pub max_diff_views: u32,
    /// Tool results beyond this many bytes are truncated before entering the context.
    pub tool_output_limit_bytes: usize,
    /// Initial-context budget; droppable prompt sections go first.
    pub prompt_budget_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let limits = ToolLimits::default();
        Self {
            max_agent_iterations: 20,
            max_searches: limits.max_searches,
            max_writes: limits.max_writes,
            max_test_runs: limits.max_test_runs,
            max_coverage_runs: limits.max_coverage_runs,
            max_symbol_lookups: limits.max_symbol_lookups,
            max_diff_views: limits.max_diff_views,
            tool_output_limit_bytes: 20_000,
            prompt_budget_bytes: 60_000,
        }
    }
}

impl AgentConfig {
    pub fn tool_limits(&self) -> ToolLimits {
        ToolLimits {
            max_searches: self.max_searches,
            max_writes: self.max_writes,
            max_test_runs: self.max_test_runs,
            max_coverage_runs: self.max_coverage_runs,
            max_symbol_lookups: self.max_symbol_lookups,
            max_diff_views: self.max_diff_views,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_iteration_tokens: u64,
    pub max_total_tokens: u64,
    pub max_cost_gbp: f64,
    pub prompt_cost_per_1k: f64,
    pub completion_cost_per_1k: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_iteration_tokens: 400_000,
            max_total_tokens: 4_000_000,
            max_cost_gbp: 25.0,
            prompt_cost_per_1k: 0.002,
            completion_cost_per_1k: 0.008,
        }
    }
}

impl BudgetConfig {
    pub fn limits(&self) -> BudgetLimits {
        BudgetLimits {
            max_iteration_tokens: self.max_iteration_tokens,
            max_total_tokens: self.max_total_tokens,
            max_cost_gbp: self.max_cost_gbp,
        }
    }

    pub fn rates(&self) -> BudgetRates {
        BudgetRates {
            prompt_cost_per_1k: self.prompt_cost_per_1k,
            completion_cost_per_1k: self.completion_cost_per_1k,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// Wall-clock timeout for a single provider call.
    pub call_timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            call_timeout_secs: 300,
            max_tokens: 4_096,
            temperature: 0.2,
        }
    }
}

impl LlmConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// How a provider tier is reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Chat-completions HTTP endpoint from `FIXLOOP_LLM_ENDPOINT`.
    Http,
    /// CLI provider reading the prompt on stdin.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TierConfig {
    pub kind: BackendKind,
    /// argv for `kind = "command"`; the model name is appended when `models` is non-empty.
    pub command: Vec<String>,
    /// Models to try on this tier, in order. Empty means "use the role's deployment id".
    pub models: Vec<String>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Http,
            command: Vec::new(),
            models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TiersConfig {
    /// How often to recheck when every tier is exhausted.
    pub recheck_interval_secs: u64,
    /// Cooldown after which an exhausted free tier re-enables itself.
    pub free_cooldown_secs: u64,
    pub primary: TierConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub premium: Option<TierConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub free: Option<TierConfig>,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            recheck_interval_secs: 5 * 60,
            free_cooldown_secs: 60 * 60,
            primary: TierConfig::default(),
            premium: None,
            free: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandsConfig {
    pub build: Vec<String>,
    pub test: Vec<String>,
    /// Optional; `get_coverage` reports "not configured" when empty.
    pub coverage: Vec<String>,
    /// Optional static-analysis command; the requested path is appended.
    pub symbols: Vec<String>,
    /// Coding agent invoked by the recovery supervisor with diagnostics on stdin.
    pub fix_agent: Vec<String>,
    pub command_timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            build: vec!["cargo".to_string(), "build".to_string()],
            test: vec!["cargo".to_string(), "test".to_string()],
            coverage: Vec::new(),
            symbols: Vec::new(),
            fix_agent: Vec::new(),
            command_timeout_secs: 30 * 60,
            output_limit_bytes: 200_000,
        }
    }
}

impl CommandsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Extra directories (relative names) excluded from the content hash.
    pub exclude_dirs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Consecutive failed automated fixes before the run stops for a human.
    pub max_fix_failures: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_fix_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersonasConfig {
    pub builders: Vec<Vec<String>>,
    pub reviewers: Vec<Vec<String>>,
}

impl FixloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.looping.max_loops == 0 {
            return Err(anyhow!("loop.max_loops must be > 0"));
        }
        if self.looping.max_wall_clock_secs == 0 {
            return Err(anyhow!("loop.max_wall_clock_secs must be > 0"));
        }
        if self.agent.max_agent_iterations == 0 {
            return Err(anyhow!("agent.max_agent_iterations must be > 0"));
        }
        if self.agent.tool_output_limit_bytes == 0 {
            return Err(anyhow!("agent.tool_output_limit_bytes must be > 0"));
        }
        if self.agent.prompt_budget_bytes == 0 {
            return Err(anyhow!("agent.prompt_budget_bytes must be > 0"));
        }
        if self.budget.max_iteration_tokens == 0 || self.budget.max_total_tokens == 0 {
            return Err(anyhow!("budget token limits must be > 0"));
        }
        if !(self.budget.max_cost_gbp > 0.0) {
            return Err(anyhow!("budget.max_cost_gbp must be > 0"));
        }
        if self.budget.prompt_cost_per_1k < 0.0 || self.budget.completion_cost_per_1k < 0.0 {
            return Err(anyhow!("budget rates must be >= 0"));
        }
        if self.llm.max_attempts == 0 {
            return Err(anyhow!("llm.max_attempts must be > 0"));
        }
        if self.llm.call_timeout_secs == 0 {
            return Err(anyhow!("llm.call_timeout_secs must be > 0"));
        }
        if self.tiers.recheck_interval_secs == 0 {
            return Err(anyhow!("tiers.recheck_interval_secs must be > 0"));
        }
        validate_tier("tiers.primary", &self.tiers.primary)?;
        if let Some(tier) = &self.tiers.premium {
            validate_tier("tiers.premium", tier)?;
        }
        if let Some(tier) = &self.tiers.free {
            validate_tier("tiers.free", tier)?;
        }
        validate_argv("commands.build", &self.commands.build)?;
        validate_argv("commands.test", &self.commands.test)?;
        if self.commands.command_timeout_secs == 0 {
            return Err(anyhow!("commands.command_timeout_secs must be > 0"));
        }
        if self.commands.output_limit_bytes == 0 {
            return Err(anyhow!("commands.output_limit_bytes must be > 0"));
        }
        for (i, argv) in self.personas.builders.iter().enumerate() {
            validate_argv(&format!("personas.builders[{i}]"), argv)?;
        }
        for (i, argv) in self.personas.reviewers.iter().enumerate() {
            validate_argv(&format!("personas.reviewers[{i}]"), argv)?;
        }
        Ok(())
    }
}

fn validate_tier(label: &str, tier: &TierConfig) -> Result<()> {
    if tier.kind == BackendKind::Command {
        validate_argv(&format!("{label}.command"), &tier.command)?;
    }
    Ok(())
}

fn validate_argv(label: &str, argv: &[String]) -> Result<()> {
    if argv.is_empty() || argv[0].trim().is_empty() {
        return Err(anyhow!("{label} must be a non-empty array"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FixloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<FixloopConfig> {
    if !path.exists() {
        let cfg = FixloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FixloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FixloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

pub const ENV_ENDPOINT: &str = "FIXLOOP_LLM_ENDPOINT";
pub const ENV_KEY: &str = "FIXLOOP_LLM_KEY";
pub const ENV_API_VERSION: &str = "FIXLOOP_LLM_API_VERSION";
pub const ENV_BUILDER_DEPLOYMENT: &str = "FIXLOOP_BUILDER_DEPLOYMENT";
pub const ENV_REVIEWER_DEPLOYMENT: &str = "FIXLOOP_REVIEWER_DEPLOYMENT";
pub const ENV_JUDGE_DEPLOYMENT: &str = "FIXLOOP_JUDGE_DEPLOYMENT";

/// Deployment id used for each role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployments {
    pub builder: String,
    pub reviewer: String,
    pub judge: String,
}

impl Deployments {
    pub fn for_role(&self, role: Role) -> &str {
        match role {
            Role::Builder => &self.builder,
            Role::Reviewer => &self.reviewer,
            Role::Judge => &self.judge,
        }
    }
}

/// LLM endpoint, credential, and deployments from the environment.
#[derive(Clone, PartialEq, Eq)]
pub struct LlmEnv {
    pub endpoint: String,
    pub key: String,
    pub api_version: Option<String>,
    pub deployments: Deployments,
}

impl std::fmt::Debug for LlmEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmEnv")
            .field("endpoint", &self.endpoint)
            .field("key", &"<redacted>")
            .field("api_version", &self.api_version)
            .field("deployments", &self.deployments)
            .finish()
    }
}

impl LlmEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve every required variable, reporting all missing ones at once.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let mut missing = Vec::new();
        let mut required = |name: &'static str| -> String {
            match lookup(name).filter(|v| !v.trim().is_empty()) {
                Some(value) => value,
                None => {
                    missing.push(name);
                    String::new()
                }
            }
        };
        let endpoint = required(ENV_ENDPOINT);
        let key = required(ENV_KEY);
        let builder = required(ENV_BUILDER_DEPLOYMENT);
        let reviewer = required(ENV_REVIEWER_DEPLOYMENT);
        let judge = required(ENV_JUDGE_DEPLOYMENT);
        if !missing.is_empty() {
            return Err(anyhow!(
                "missing required environment variables: {}",
                missing.join(", ")
            ));
        }
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key,
            api_version: lookup(ENV_API_VERSION).filter(|v| !v.trim().is_empty()),
            deployments: Deployments {
                builder,
                reviewer,
                judge,
            },
        })
    }
}
