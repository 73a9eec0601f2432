//! Provider tier supervisor: strict primary → premium → free fallback with
//! persisted exhaustion flags, model blacklisting, and blocking recheck when
//! every configured tier is exhausted.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::tiers::{FailureClass, Tier, TierBook, classify_failure};
use crate::io::config::{BackendKind, FixloopConfig, LlmEnv, TierConfig};
use crate::io::llm::{ChatRequest, ChatResponse, HttpBackend, HttpExchange, Transport, is_retryable_status};
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Outcome of a single backend invocation, before classification.
#[derive(Debug, Clone)]
pub enum BackendResult {
    Completed(ChatResponse),
    Failed { output: String, timed_out: bool },
}

/// One way of reaching a provider tier.
pub trait TierBackend: Send + Sync {
    fn invoke(&self, model: &str, request: &ChatRequest, timeout: Duration) -> Result<BackendResult>;
}

impl<B: TierBackend + ?Sized> TierBackend for Arc<B> {
    fn invoke(&self, model: &str, request: &ChatRequest, timeout: Duration) -> Result<BackendResult> {
        (**self).invoke(model, request, timeout)
    }
}

impl TierBackend for HttpBackend {
    fn invoke(&self, model: &str, request: &ChatRequest, timeout: Duration) -> Result<BackendResult> {
        Ok(match self.exchange(model, request, timeout) {
            HttpExchange::Completed(response) => BackendResult::Completed(response),
            HttpExchange::Rejected { status, body } => {
                let transient = if is_retryable_status(status) {
                    " (transient)"
                } else {
                    ""
                };
                BackendResult::Failed {
                    output: format!("http {status}{transient}: {body}"),
                    timed_out: false,
                }
            }
            HttpExchange::TimedOut => BackendResult::Failed {
                output: "request timed out".to_string(),
                timed_out: true,
            },
            HttpExchange::Unreachable(reason) => BackendResult::Failed {
                output: reason,
                timed_out: false,
            },
        })
    }
}

/// CLI provider: prompt on stdin, reply on stdout.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    argv: Vec<String>,
    workdir: PathBuf,
    append_model: bool,
    output_limit_bytes: usize,
}

impl CommandBackend {
    pub fn new(argv: Vec<String>, workdir: impl Into<PathBuf>, append_model: bool, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            workdir: workdir.into(),
            append_model,
            output_limit_bytes,
        }
    }
}

impl TierBackend for CommandBackend {
    fn invoke(&self, model: &str, request: &ChatRequest, timeout: Duration) -> Result<BackendResult> {
        let mut argv = self.argv.clone();
        if self.append_model {
            argv.push(model.to_string());
        }
        let cmd = command_from_argv(&argv, &self.workdir)?;
        let prompt = request.prompt_text();
        let out = run_command_with_timeout(cmd, Some(prompt.as_bytes()), timeout, self.output_limit_bytes)
            .with_context(|| format!("run provider command {:?}", self.argv.first()))?;
        if out.succeeded() {
            return Ok(BackendResult::Completed(ChatResponse::from_text(out.stdout_text())));
        }
        Ok(BackendResult::Failed {
            output: out.combined_log("provider"),
            timed_out: out.timed_out,
        })
    }
}

/// Time source for the supervisor, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Every tier stayed exhausted until the run's wall-clock deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlinePassedError {
    pub deadline: DateTime<Utc>,
}

impl std::fmt::Display for DeadlinePassedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "every provider tier is exhausted and the run deadline {} has passed",
            self.deadline.to_rfc3339()
        )
    }
}

impl std::error::Error for DeadlinePassedError {}

/// A configured tier and its backend.
pub struct TierSlot {
    pub tier: Tier,
    pub backend: Box<dyn TierBackend>,
    pub models: Vec<String>,
}

pub struct TierSupervisor {
    slots: Vec<TierSlot>,
    book: Mutex<TierBook>,
    state_path: Option<PathBuf>,
    clock: Box<dyn Clock>,
    recheck_interval: Duration,
    call_timeout: Duration,
    deadline: Option<DateTime<Utc>>,
}

impl TierSupervisor {
    pub fn new(
        slots: Vec<TierSlot>,
        book: TierBook,
        state_path: Option<PathBuf>,
        clock: Box<dyn Clock>,
        recheck_interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            slots,
            book: Mutex::new(book),
            state_path,
            clock,
            recheck_interval,
            call_timeout,
            deadline: None,
        }
    }

    /// Stop waiting for exhausted tiers once `deadline` passes.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Build the supervisor from config, loading persisted tier state from `state_path`.
    pub fn from_config(cfg: &FixloopConfig, env: &LlmEnv, root: &Path, state_path: PathBuf) -> Result<Self> {
        let clock = SystemClock;
        let book = load_tier_book(&state_path, clock.now(), cfg.tiers.free_cooldown_secs)?;
        let mut slots = Vec::new();
        let configured = [
            (Tier::Primary, Some(&cfg.tiers.primary)),
            (Tier::Premium, cfg.tiers.premium.as_ref()),
            (Tier::Free, cfg.tiers.free.as_ref()),
        ];
        for (tier, tier_cfg) in configured {
            let Some(tier_cfg) = tier_cfg else {
                continue;
            };
            slots.push(TierSlot {
                tier,
                backend: build_backend(tier_cfg, env, root, cfg.commands.output_limit_bytes)?,
                models: tier_cfg.models.clone(),
            });
        }
        Ok(Self::new(
            slots,
            book,
            Some(state_path),
            Box::new(clock),
            Duration::from_secs(cfg.tiers.recheck_interval_secs),
            cfg.llm.call_timeout(),
        ))
    }

    /// Current tier book (after applying rollover and cooldown).
    pub fn snapshot(&self) -> Result<TierBook> {
        let mut book = self.lock_book()?;
        book.refresh(self.clock.now());
        Ok(book.clone())
    }

    fn lock_book(&self) -> Result<std::sync::MutexGuard<'_, TierBook>> {
        self.book
            .lock()
            .map_err(|_| anyhow!("tier state lock poisoned"))
    }

    /// Configured tiers that are usable right now, with the model each should use.
    fn available(&self, deployment: &str) -> Result<Vec<(usize, String)>> {
        let now = self.clock.now();
        let mut book = self.lock_book()?;
        let mut changed = false;
        for tier in book.refresh(now) {
            info!(%tier, "provider tier re-enabled");
            changed = true;
        }
        let mut available = Vec::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            if book.is_exhausted(slot.tier) {
                continue;
            }
            let model = if slot.models.is_empty() {
                Some(deployment.to_string())
            } else {
                slot.models
                    .iter()
                    .find(|m| !book.is_blacklisted(m))
                    .cloned()
            };
            match model {
                Some(model) => available.push((idx, model)),
                None => {
                    warn!(tier = %slot.tier, "every model on tier is blacklisted");
                    book.mark_exhausted(slot.tier, now);
                    changed = true;
                }
            }
        }
        if changed {
            self.persist(&book)?;
        }
        Ok(available)
    }

    fn record_failure(&self, tier: Tier, model: &str, class: FailureClass) -> Result<()> {
        let mut book = self.lock_book()?;
        if class == FailureClass::Entitlement && book.blacklist(model) {
            warn!(%tier, model, "model blacklisted after entitlement failure");
        }
        if book.mark_exhausted(tier, self.clock.now()) {
            warn!(%tier, "provider tier exhausted");
        }
        self.persist(&book)
    }

    fn persist(&self, book: &TierBook) -> Result<()> {
        match &self.state_path {
            Some(path) => save_tier_book(path, book),
            None => Ok(()),
        }
    }
}

impl Transport for TierSupervisor {
    /// Try each available tier in order.
    ///
    /// Quota and entitlement failures exhaust the tier; other failures fall through for this call
    /// only. If every configured tier is exhausted the call blocks and rechecks periodically. If
    /// every available tier failed ordinarily the error is returned for the adapter to retry.
    #[instrument(skip_all, fields(deployment = %request.deployment))]
    fn send(&self, request: &ChatRequest) -> Result<ChatResponse> {
        if self.slots.is_empty() {
            return Err(anyhow!("no provider tiers configured"));
        }
        loop {
            let available = self.available(&request.deployment)?;
            if available.is_empty() {
                let mut wait = self.recheck_interval;
                if let Some(deadline) = self.deadline {
                    let remaining = (deadline - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
                    if remaining.is_zero() {
                        warn!(deadline = %deadline.to_rfc3339(), "all provider tiers exhausted past the deadline");
                        return Err(DeadlinePassedError { deadline }.into());
                    }
                    wait = wait.min(remaining);
                }
                warn!(
                    recheck_secs = wait.as_secs(),
                    "all provider tiers exhausted, waiting"
                );
                self.clock.sleep(wait);
                continue;
            }

            let mut ordinary = Vec::new();
            for (idx, model) in available {
                let slot = &self.slots[idx];
                debug!(tier = %slot.tier, %model, "invoking provider tier");
                let result = slot
                    .backend
                    .invoke(&model, request, self.call_timeout)
                    .with_context(|| format!("invoke {} tier", slot.tier))?;
                let (output, timed_out) = match result {
                    BackendResult::Completed(response) => {
                        let blank = response.has_choices()
                            && response.first_content().is_none_or(|c| c.trim().is_empty());
                        if blank && !request.is_empty_prompt() {
                            ("empty output for non-empty prompt".to_string(), false)
                        } else {
                            return Ok(response);
                        }
                    }
                    BackendResult::Failed { output, timed_out } => (output, timed_out),
                };
                let class = if timed_out {
                    FailureClass::Ordinary
                } else {
                    classify_failure(&output)
                };
                match class {
                    FailureClass::Ordinary => {
                        debug!(tier = %slot.tier, timed_out, "provider call failed, falling back");
                        ordinary.push(format!("{}: {}", slot.tier, output.trim()));
                    }
                    class => self.record_failure(slot.tier, &model, class)?,
                }
            }

            if !ordinary.is_empty() {
                return Err(anyhow!("all provider tiers failed: {}", ordinary.join("; ")));
            }
        }
    }
}

fn build_backend(tier_cfg: &TierConfig, env: &LlmEnv, root: &Path, output_limit: usize) -> Result<Box<dyn TierBackend>> {
    Ok(match tier_cfg.kind {
        BackendKind::Http => Box::new(HttpBackend::new(env)?),
        BackendKind::Command => Box::new(CommandBackend::new(
            tier_cfg.command.clone(),
            root,
            !tier_cfg.models.is_empty(),
            output_limit,
        )),
    })
}

/// Load persisted tier state. Missing files yield fresh state; rollover is applied on load.
pub fn load_tier_book(path: &Path, now: DateTime<Utc>, free_cooldown_secs: u64) -> Result<TierBook> {
    if !path.exists() {
        return Ok(TierBook::new(now, free_cooldown_secs));
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut book: TierBook =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    book.refresh(now);
    Ok(book)
}

pub fn save_tier_book(path: &Path, book: &TierBook) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(book).context("serialize tier state")?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Human-readable tier report for `fixloop tiers`.
pub fn describe_tier_book(book: &TierBook) -> String {
    let mut out = format!("day: {}\n", book.day);
    for state in &book.tiers {
        let status = if state.exhausted { "exhausted" } else { "available" };
        out.push_str(&format!("{:<8} {status}", state.tier.as_str()));
        if let Some(at) = state.exhausted_at {
            out.push_str(&format!(" since {}", at.to_rfc3339()));
        }
        out.push('\n');
    }
    if !book.blacklisted_models.is_empty() {
        let models: Vec<&str> = book.blacklisted_models.iter().map(String::as_str).collect();
        out.push_str(&format!("blacklisted: {}\n", models.join(", ")));
    }
    out
}
