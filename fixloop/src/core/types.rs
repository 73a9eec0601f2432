//! Shared deterministic types for the repair engine.
//!
//! These types define stable contracts between sessions, the pipeline, and the
//! persisted iteration artifacts. They carry no I/O.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel reply meaning "the agent has nothing to change".
pub const NO_CHANGES: &str = "NO_CHANGES";

/// LLM-backed role an agent session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Builder,
    Reviewer,
    Judge,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Builder, Role::Reviewer, Role::Judge];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Builder => "builder",
            Role::Reviewer => "reviewer",
            Role::Judge => "judge",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of structured error kinds a session can terminate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuredErrorKind {
    /// The reply was not a diff, not the sentinel, and not a valid tool call.
    ParseError,
}

impl StructuredErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StructuredErrorKind::ParseError => "parse_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    #[serde(rename = "type")]
    pub kind: StructuredErrorKind,
    pub role: Role,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Terminal result of one agent session. Exactly one is produced per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SessionOutcome {
    UnifiedDiff(String),
    NoChanges,
    StructuredError(StructuredError),
}

impl SessionOutcome {
    pub fn parse_error(role: Role, message: impl Into<String>) -> Self {
        SessionOutcome::StructuredError(StructuredError {
            kind: StructuredErrorKind::ParseError,
            role,
            message: message.into(),
            timestamp: Utc::now(),
        })
    }

    /// Short stable label used in iteration records and logs.
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::UnifiedDiff(_) => "unified_diff",
            SessionOutcome::NoChanges => "no_changes",
            SessionOutcome::StructuredError(_) => "structured_error",
        }
    }

    pub fn diff(&self) -> Option<&str> {
        match self {
            SessionOutcome::UnifiedDiff(text) => Some(text),
            _ => None,
        }
    }

    /// Text form handed to the judge: diffs verbatim, everything else as a tagged line.
    pub fn render(&self) -> String {
        match self {
            SessionOutcome::UnifiedDiff(text) => text.clone(),
            SessionOutcome::NoChanges => NO_CHANGES.to_string(),
            SessionOutcome::StructuredError(err) => format!(
                "ERROR type={} role={} message={}",
                err.kind.as_str(),
                err.role,
                err.message
            ),
        }
    }
}

/// One builder proposal, kept even when it produced no patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchCandidate {
    pub hypothesis: String,
    pub outcome: SessionOutcome,
}

/// How one outer iteration ended. Apply/build/test failures are values, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    /// Build and tests passed; the patch was committed.
    Fixed,
    /// The final patch text was not diff-shaped.
    FormatFailure,
    ApplyFailed,
    BuildFailed,
    TestsFailed,
    /// A budget limit was crossed mid-iteration.
    BudgetExceeded,
}

impl IterationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            IterationOutcome::Fixed => "fixed",
            IterationOutcome::FormatFailure => "format_failure",
            IterationOutcome::ApplyFailed => "apply_failed",
            IterationOutcome::BuildFailed => "build_failed",
            IterationOutcome::TestsFailed => "tests_failed",
            IterationOutcome::BudgetExceeded => "budget_exceeded",
        }
    }
}

impl fmt::Display for IterationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_keeps_diff_verbatim_and_tags_errors() {
        let diff = SessionOutcome::UnifiedDiff("--- a/x\n+++ b/x\n".to_string());
        assert_eq!(diff.render(), "--- a/x\n+++ b/x\n");
        assert_eq!(SessionOutcome::NoChanges.render(), NO_CHANGES);

        let err = SessionOutcome::parse_error(Role::Builder, "chatty reply");
        let rendered = err.render();
        assert!(rendered.starts_with("ERROR type=parse_error role=builder"));
        assert!(rendered.contains("chatty reply"));
    }

    #[test]
    fn structured_error_serializes_type_field() {
        let err = SessionOutcome::parse_error(Role::Reviewer, "bad");
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["outcome"], "structured_error");
        assert_eq!(json["detail"]["type"], "parse_error");
        assert_eq!(json["detail"]["role"], "reviewer");
    }
}
