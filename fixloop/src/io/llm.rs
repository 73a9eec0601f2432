//! LLM call adapter: one chat-completions exchange with retry, usage accounting,
//! and the reqwest transport used by HTTP provider tiers.

use std::fmt;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::budget::BudgetLedger;
use crate::io::config::{LlmConfig, LlmEnv};
use crate::io::providers::DeadlinePassedError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Provider-neutral chat request. `deployment` selects the model when a tier has none configured.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub deployment: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl ChatRequest {
    pub fn new(deployment: impl Into<String>, messages: Vec<ChatMessage>, llm: &LlmConfig) -> Self {
        Self {
            deployment: deployment.into(),
            messages,
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
        }
    }

    /// Flatten the conversation for CLI providers that read one prompt on stdin.
    pub fn prompt_text(&self) -> String {
        let mut buf = String::new();
        for message in &self.messages {
            buf.push_str(&format!("## {}\n\n{}\n\n", message.role, message.content));
        }
        buf
    }

    pub fn is_empty_prompt(&self) -> bool {
        self.messages.iter().all(|m| m.content.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub message: Option<ChoiceMessage>,
}

/// Subset of an OpenAI-compatible chat-completions response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Option<Vec<Choice>>,
    /// Raw `usage` object; token fields are validated by the ledger.
    #[serde(default)]
    pub usage: Option<Value>,
}

impl ChatResponse {
    /// Single-choice response without usage (CLI providers).
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            choices: Some(vec![Choice {
                message: Some(ChoiceMessage {
                    content: Some(text.into()),
                }),
            }]),
            usage: None,
        }
    }

    pub fn has_choices(&self) -> bool {
        self.choices.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .as_ref()?
            .first()?
            .message
            .as_ref()?
            .content
            .as_deref()
    }
}

/// One request/response exchange with some provider.
pub trait Transport {
    fn send(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn send(&self, request: &ChatRequest) -> Result<ChatResponse> {
        (**self).send(request)
    }
}

/// The provider returned no choices. Permanent: never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptyChoicesError {
    pub deployment: String,
}

impl fmt::Display for EmptyChoicesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "llm returned an empty choice list (deployment {})",
            self.deployment
        )
    }
}

impl std::error::Error for EmptyChoicesError {}

/// Every attempt failed with a transient error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetriesExhaustedError {
    pub attempts: u32,
    pub last_error: String,
}

impl fmt::Display for RetriesExhaustedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "llm call failed after {} attempts: {}",
            self.attempts, self.last_error
        )
    }
}

impl std::error::Error for RetriesExhaustedError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(llm: &LlmConfig) -> Self {
        Self {
            max_attempts: llm.max_attempts,
            base_delay: Duration::from_millis(llm.backoff_base_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based): base doubled each time, +/-25% jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = (self.base_delay.as_millis() as u64)
            .saturating_mul(2u64.saturating_pow(attempt));
        let jitter_range = base_ms / 4;
        let jitter = if jitter_range > 0 {
            let offset = rand::thread_rng().gen_range(0..=jitter_range * 2);
            offset as i64 - jitter_range as i64
        } else {
            0
        };
        Duration::from_millis((base_ms as i64 + jitter).max(0) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&LlmConfig::default())
    }
}

/// Retrying adapter over a [`Transport`]. Every response's usage lands in the ledger.
pub struct LlmClient<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: Transport> LlmClient<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send `request` and return the first choice's content.
    ///
    /// An empty or missing choice list fails immediately with [`EmptyChoicesError`], and a
    /// [`DeadlinePassedError`] from the tier supervisor is returned as is. Any other transport
    /// error is retried with backoff; after `max_attempts` the call fails with
    /// [`RetriesExhaustedError`].
    #[instrument(skip_all, fields(deployment = %request.deployment))]
    pub fn complete(&self, ledger: &mut BudgetLedger, request: &ChatRequest) -> Result<String> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.policy.backoff_delay(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying llm call");
                thread::sleep(delay);
            }
            let response = match self.transport.send(request) {
                Ok(response) => response,
                Err(err) if err.downcast_ref::<DeadlinePassedError>().is_some() => return Err(err),
                Err(err) => {
                    warn!(attempt = attempt + 1, err = %format!("{err:#}"), "llm call failed");
                    last_error = format!("{err:#}");
                    continue;
                }
            };
            record_usage(ledger, response.usage.as_ref());
            if !response.has_choices() {
                return Err(EmptyChoicesError {
                    deployment: request.deployment.clone(),
                }
                .into());
            }
            let content = response.first_content().unwrap_or_default().to_string();
            debug!(
                attempt = attempt + 1,
                reply_bytes = content.len(),
                total_tokens = ledger.total_tokens(),
                "llm call completed"
            );
            return Ok(content);
        }
        Err(RetriesExhaustedError {
            attempts,
            last_error,
        }
        .into())
    }
}

fn record_usage(ledger: &mut BudgetLedger, usage: Option<&Value>) {
    let Some(usage) = usage else {
        debug!("response carried no usage");
        return;
    };
    let prompt = usage.get("prompt_tokens").unwrap_or(&Value::Null);
    let completion = usage.get("completion_tokens").unwrap_or(&Value::Null);
    if let Err(err) = ledger.add_usage_value(prompt, completion) {
        warn!(err = %err, "ignoring malformed usage report");
    }
}

/// How the secret is presented to the endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
}

impl Credential {
    /// A signed token (three non-empty dot-separated parts) is sent as a bearer token;
    /// anything else is sent in the `api-key` header.
    pub fn from_secret(secret: &str) -> Self {
        let parts: Vec<&str> = secret.split('.').collect();
        if parts.len() == 3 && parts.iter().all(|p| !p.is_empty()) {
            Credential::Bearer(secret.to_string())
        } else {
            Credential::ApiKey(secret.to_string())
        }
    }

    fn header(&self) -> (&'static str, String) {
        match self {
            Credential::Bearer(token) => ("Authorization", format!("Bearer {token}")),
            Credential::ApiKey(key) => ("api-key", key.clone()),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credential::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

/// Result of one HTTP exchange, before tier classification.
#[derive(Debug)]
pub enum HttpExchange {
    Completed(ChatResponse),
    Rejected { status: u16, body: String },
    TimedOut,
    Unreachable(String),
}

/// Returns `true` if the HTTP status code is transient and worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Blocking reqwest client for an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_version: Option<String>,
    credential: Credential,
}

impl HttpBackend {
    pub fn new(env: &LlmEnv) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: env.endpoint.clone(),
            api_version: env.api_version.clone(),
            credential: Credential::from_secret(&env.key),
        })
    }

    pub fn url_for(&self, model: &str) -> String {
        match &self.api_version {
            Some(version) => format!(
                "{}/openai/deployments/{model}/chat/completions?api-version={version}",
                self.endpoint
            ),
            None => format!("{}/chat/completions", self.endpoint),
        }
    }

    #[instrument(skip_all, fields(model))]
    pub fn exchange(&self, model: &str, request: &ChatRequest, timeout: Duration) -> HttpExchange {
        let body = WireRequest {
            model: self.api_version.is_none().then_some(model),
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let (header, value) = self.credential.header();
        let sent = self
            .client
            .post(self.url_for(model))
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header(header, value)
            .json(&body)
            .send();
        let response = match sent {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return HttpExchange::TimedOut,
            Err(err) => return HttpExchange::Unreachable(err.to_string()),
        };
        let status = response.status();
        let text = match response.text() {
            Ok(text) => text,
            Err(err) if err.is_timeout() => return HttpExchange::TimedOut,
            Err(err) => return HttpExchange::Unreachable(err.to_string()),
        };
        if !status.is_success() {
            debug!(status = status.as_u16(), "http provider rejected request");
            return HttpExchange::Rejected {
                status: status.as_u16(),
                body: text,
            };
        }
        match serde_json::from_str::<ChatResponse>(&text) {
            Ok(parsed) => HttpExchange::Completed(parsed),
            Err(err) => HttpExchange::Unreachable(format!("parse chat response: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budget::{BudgetLimits, BudgetRates};
    use crate::test_support::{ScriptedTransport, chat_response};
    use anyhow::anyhow;
    use serde_json::json;

    fn ledger() -> BudgetLedger {
        BudgetLedger::new(
            BudgetLimits {
                max_iteration_tokens: 10_000,
                max_total_tokens: 100_000,
                max_cost_gbp: 10.0,
            },
            BudgetRates {
                prompt_cost_per_1k: 0.0,
                completion_cost_per_1k: 0.0,
            },
        )
    }

    fn request() -> ChatRequest {
        ChatRequest::new("dep", vec![ChatMessage::user("hi")], &LlmConfig::default())
    }

    fn no_wait(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    #[test]
    fn returns_content_and_records_usage() {
        let transport = ScriptedTransport::new(vec![Ok(chat_response("NO_CHANGES", 80, 30))]);
        let client = LlmClient::new(&transport, no_wait(3));
        let mut ledger = ledger();
        let reply = client.complete(&mut ledger, &request()).expect("complete");
        assert_eq!(reply, "NO_CHANGES");
        assert_eq!(ledger.prompt_tokens(), 80);
        assert_eq!(ledger.completion_tokens(), 30);
    }

    #[test]
    fn retries_transient_failures_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            Err(anyhow!("connection reset")),
            Ok(chat_response("ok", 1, 1)),
        ]);
        let client = LlmClient::new(&transport, no_wait(3));
        let reply = client.complete(&mut ledger(), &request()).expect("complete");
        assert_eq!(reply, "ok");
        assert_eq!(transport.calls(), 2);
    }

    #[test]
    fn exhausting_attempts_names_the_count() {
        let transport = ScriptedTransport::new(vec![
            Err(anyhow!("503")),
            Err(anyhow!("503")),
            Err(anyhow!("503")),
        ]);
        let client = LlmClient::new(&transport, no_wait(3));
        let err = client.complete(&mut ledger(), &request()).expect_err("fails");
        let exhausted = err
            .downcast_ref::<RetriesExhaustedError>()
            .expect("retries exhausted");
        assert_eq!(exhausted.attempts, 3);
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn empty_choices_fail_without_retry() {
        let empty = ChatResponse {
            choices: Some(Vec::new()),
            usage: Some(json!({"prompt_tokens": 5, "completion_tokens": 0})),
        };
        let transport = ScriptedTransport::new(vec![Ok(empty), Ok(chat_response("late", 1, 1))]);
        let client = LlmClient::new(&transport, no_wait(3));
        let mut ledger = ledger();
        let err = client.complete(&mut ledger, &request()).expect_err("fails");
        assert!(err.downcast_ref::<EmptyChoicesError>().is_some());
        assert_eq!(transport.calls(), 1);
        assert_eq!(ledger.prompt_tokens(), 5);

        let null_choices = ChatResponse::default();
        let transport = ScriptedTransport::new(vec![Ok(null_choices)]);
        let client = LlmClient::new(&transport, no_wait(3));
        let err = client.complete(&mut ledger, &request()).expect_err("fails");
        assert!(err.downcast_ref::<EmptyChoicesError>().is_some());
    }

    #[test]
    fn malformed_usage_is_ignored() {
        let response = ChatResponse {
            usage: Some(json!({"prompt_tokens": "many", "completion_tokens": 3})),
            ..ChatResponse::from_text("x")
        };
        let transport = ScriptedTransport::new(vec![Ok(response)]);
        let client = LlmClient::new(&transport, no_wait(1));
        let mut ledger = ledger();
        client.complete(&mut ledger, &request()).expect("complete");
        assert_eq!(ledger.total_tokens(), 0);
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        };
        for _ in 0..20 {
            let d0 = policy.backoff_delay(0).as_millis();
            let d2 = policy.backoff_delay(2).as_millis();
            assert!((750..=1250).contains(&d0), "attempt 0 out of range: {d0}");
            assert!((3000..=5000).contains(&d2), "attempt 2 out of range: {d2}");
        }
    }

    #[test]
    fn credential_shape_selects_header() {
        assert!(matches!(
            Credential::from_secret("aaa.bbb.ccc"),
            Credential::Bearer(_)
        ));
        for secret in ["plainkey", "a.b", "a..c", "a.b.c.d"] {
            assert!(
                matches!(Credential::from_secret(secret), Credential::ApiKey(_)),
                "expected api-key for {secret:?}"
            );
        }
        assert_eq!(
            format!("{:?}", Credential::from_secret("secret")),
            "ApiKey(<redacted>)"
        );
    }

    #[test]
    fn url_depends_on_api_version() {
        let mut env = LlmEnv::from_lookup(|k| Some(format!("v-{k}"))).expect("env");
        env.endpoint = "https://llm.example".to_string();
        env.api_version = None;
        let backend = HttpBackend::new(&env).expect("backend");
        assert_eq!(
            backend.url_for("gpt"),
            "https://llm.example/chat/completions"
        );
        env.api_version = Some("2024-06-01".to_string());
        let backend = HttpBackend::new(&env).expect("backend");
        assert_eq!(
            backend.url_for("gpt"),
            "https://llm.example/openai/deployments/gpt/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
    }
}
