//! Bounded tool-calling agent session.
//!
//! One LLM call per turn. Each reply is a diff, the `NO_CHANGES` sentinel, or a
//! single tool call; a session ends with exactly one [`SessionOutcome`].

use std::fmt;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::BudgetLedger;
use crate::core::reply::{Reply, classify_reply};
use crate::core::tools::{ToolCounters, ToolLimits, ToolName, is_permitted};
use crate::core::types::{Role, SessionOutcome};
use crate::io::config::FixloopConfig;
use crate::io::llm::{ChatMessage, ChatRequest, LlmClient, Transport};
use crate::io::process::truncate_text;
use crate::io::repo_tools::{RepositoryTools, execute_tool, parse_tool_call};

/// The agent asked for a tool its role may not use. Fatal for the iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForbiddenToolError {
    pub role: Role,
    pub tool: ToolName,
}

impl fmt::Display for ForbiddenToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tool '{}' is not permitted for the {} role", self.tool, self.role)
    }
}

impl std::error::Error for ForbiddenToolError {}

/// The agent named a tool that does not exist. Fatal for the iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownToolError {
    pub role: Role,
    pub tool: String,
}

impl fmt::Display for UnknownToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requested unknown tool '{}'", self.role, self.tool)
    }
}

impl std::error::Error for UnknownToolError {}

/// Per-session bounds and request settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub max_agent_iterations: u32,
    pub limits: ToolLimits,
    pub tool_output_limit_bytes: usize,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl SessionSettings {
    pub fn from_config(cfg: &FixloopConfig) -> Self {
        Self {
            max_agent_iterations: cfg.agent.max_agent_iterations,
            limits: cfg.agent.tool_limits(),
            tool_output_limit_bytes: cfg.agent.tool_output_limit_bytes,
            max_tokens: cfg.llm.max_tokens,
            temperature: cfg.llm.temperature,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&FixloopConfig::default())
    }
}

/// Collaborators a session borrows for its lifetime.
pub struct SessionEnv<'a, T> {
    pub llm: &'a LlmClient<T>,
    pub ledger: &'a mut BudgetLedger,
    /// Ledger total at the start of the current outer iteration.
    pub iteration_start_tokens: u64,
    pub tools: &'a dyn RepositoryTools,
    pub settings: &'a SessionSettings,
}

#[derive(Debug, Clone)]
pub struct AgentSession {
    role: Role,
    deployment: String,
    system_prompt: String,
    context: Vec<ChatMessage>,
    counters: ToolCounters,
    iterations: u32,
}

impl AgentSession {
    pub fn new(
        role: Role,
        deployment: impl Into<String>,
        system_prompt: impl Into<String>,
        initial_context: impl Into<String>,
    ) -> Self {
        Self {
            role,
            deployment: deployment.into(),
            system_prompt: system_prompt.into(),
            context: vec![ChatMessage::user(initial_context)],
            counters: ToolCounters::default(),
            iterations: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn counters(&self) -> &ToolCounters {
        &self.counters
    }

    /// LLM turns taken so far.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn request(&self, settings: &SessionSettings) -> ChatRequest {
        let mut messages = Vec::with_capacity(self.context.len() + 1);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(self.context.iter().cloned());
        ChatRequest {
            deployment: self.deployment.clone(),
            messages,
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        }
    }

    /// One LLM call followed by a budget check. Budget violations surface as `BudgetError`.
    fn call<T: Transport>(&mut self, env: &mut SessionEnv<'_, T>) -> Result<String> {
        self.iterations += 1;
        let request = self.request(env.settings);
        let reply = env.llm.complete(env.ledger, &request)?;
        env.ledger.enforce(env.iteration_start_tokens)?;
        self.context.push(ChatMessage::assistant(reply.clone()));
        Ok(reply)
    }

    /// Drive the session to its terminal outcome.
    ///
    /// Forbidden or unknown tools, budget violations, and exhausted LLM retries are errors;
    /// everything else ends in a [`SessionOutcome`].
    #[instrument(skip_all, fields(role = %self.role, deployment = %self.deployment))]
    pub fn run<T: Transport>(&mut self, env: &mut SessionEnv<'_, T>) -> Result<SessionOutcome> {
        while self.iterations < env.settings.max_agent_iterations {
            let reply = self.call(env)?;
            let request = match classify_reply(&reply) {
                Reply::Diff(diff) => {
                    debug!(turns = self.iterations, "session produced a diff");
                    return Ok(SessionOutcome::UnifiedDiff(diff));
                }
                Reply::NoChanges => {
                    debug!(turns = self.iterations, "session reported no changes");
                    return Ok(SessionOutcome::NoChanges);
                }
                Reply::Unparseable(reason) => {
                    warn!(%reason, "unparseable agent reply");
                    return Ok(SessionOutcome::parse_error(self.role, reason));
                }
                Reply::Tool(request) => request,
            };

            let tool: ToolName = match request.name.parse() {
                Ok(tool) => tool,
                Err(_) => {
                    return Err(UnknownToolError {
                        role: self.role,
                        tool: request.name,
                    }
                    .into());
                }
            };
            if !is_permitted(self.role, tool) {
                warn!(%tool, "forbidden tool requested");
                return Err(ForbiddenToolError { role: self.role, tool }.into());
            }
            if self.counters.at_cap(tool, &env.settings.limits) {
                info!(%tool, cap = env.settings.limits.cap(tool), "tool cap reached, ending session");
                return Ok(SessionOutcome::NoChanges);
            }
            let call = match parse_tool_call(&request.object) {
                Ok(call) => call,
                Err(err) => return Ok(SessionOutcome::parse_error(self.role, err.to_string())),
            };

            self.counters.increment(tool);
            let result = match execute_tool(env.tools, &call) {
                Ok(output) => output,
                Err(err) => {
                    debug!(%tool, err = %format!("{err:#}"), "tool failed");
                    format!("error: {err:#}")
                }
            };
            let result = truncate_text(&result, env.settings.tool_output_limit_bytes);
            self.context
                .push(ChatMessage::user(format!("tool result ({tool}):\n{result}")));
        }
        info!(
            max = env.settings.max_agent_iterations,
            "agent iteration limit reached"
        );
        Ok(SessionOutcome::NoChanges)
    }

    /// Single call whose raw reply is returned untouched (the judge).
    #[instrument(skip_all, fields(role = %self.role, deployment = %self.deployment))]
    pub fn run_verbatim<T: Transport>(&mut self, env: &mut SessionEnv<'_, T>) -> Result<String> {
        self.call(env)
    }
}
