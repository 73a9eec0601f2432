//! Classification of a single agent reply under the turn protocol.
//!
//! A reply is exactly one of: a unified diff, the `NO_CHANGES` sentinel, or one JSON
//! object naming a tool. Everything else is unparseable.

use serde_json::{Map, Value};

use crate::core::diff::{is_unified_diff, strip_code_fence};
use crate::core::types::NO_CHANGES;

/// Raw tool request before permission checks and argument validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub name: String,
    pub object: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Diff(String),
    NoChanges,
    Tool(ToolRequest),
    Unparseable(String),
}

pub fn classify_reply(raw: &str) -> Reply {
    let text = strip_code_fence(raw);
    if text.is_empty() {
        return Reply::Unparseable("empty reply".to_string());
    }
    if is_unified_diff(text) {
        return Reply::Diff(text.to_string());
    }
    if text == NO_CHANGES {
        return Reply::NoChanges;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => match object.get("tool") {
            Some(Value::String(name)) => Reply::Tool(ToolRequest {
                name: name.clone(),
                object,
            }),
            Some(other) => Reply::Unparseable(format!("tool field must be a string, got {other}")),
            None => Reply::Unparseable("json object has no tool field".to_string()),
        },
        Ok(other) => Reply::Unparseable(format!("expected one json object, got {}", kind(&other))),
        Err(err) => Reply::Unparseable(format!("not a diff, sentinel, or tool call: {err}")),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_each_protocol_shape() {
        assert!(matches!(
            classify_reply("diff --git a/x b/x\n"),
            Reply::Diff(_)
        ));
        assert_eq!(classify_reply(" NO_CHANGES\n"), Reply::NoChanges);
        match classify_reply(r#"{"tool": "search_files", "pattern": "foo"}"#) {
            Reply::Tool(req) => {
                assert_eq!(req.name, "search_files");
                assert_eq!(req.object["pattern"], "foo");
            }
            other => panic!("expected tool, got {other:?}"),
        }
    }

    #[test]
    fn rejects_everything_else() {
        for raw in [
            "",
            "   ",
            "I think the bug is in main.rs",
            "NO_CHANGES please",
            "[1, 2]",
            r#"{"pattern": "foo"}"#,
            r#"{"tool": 3}"#,
            r#"{"tool": "search_files"} {"tool": "run_tests"}"#,
        ] {
            assert!(
                matches!(classify_reply(raw), Reply::Unparseable(_)),
                "expected unparseable for {raw:?}"
            );
        }
    }

    #[test]
    fn fenced_replies_are_unwrapped() {
        assert!(matches!(
            classify_reply("```diff\n--- a/x\n+++ b/x\n```"),
            Reply::Diff(_)
        ));
        assert!(matches!(
            classify_reply("```json\n{\"tool\": \"show_diff\"}\n```"),
            Reply::Tool(_)
        ));
    }
}
