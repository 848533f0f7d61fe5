//! Warmup probe fingerprint.
//!
//! Coding agents fire a tiny haiku request at session start to verify the
//! credential path. Relaying that probe upstream wastes a billable call per
//! session, so the dispatcher answers it locally when interception is
//! enabled. The fingerprint is deliberately narrow: a single short user
//! message, a haiku-class model, and a tiny `max_tokens`.

use serde_json::Value;

/// `blocked_by` tag written on intercepted ledger rows.
pub const WARMUP_TAG: &str = "anthropic_warmup";

/// Probe body text the fingerprint requires.
const PROBE_TEXT: &str = "quota";

/// Models the guard intercepts, by prefix.
const MODEL_ALLOWLIST: &[&str] = &["claude-3-5-haiku", "claude-haiku"];

/// Largest `max_tokens` a probe may carry.
const MAX_PROBE_TOKENS: i64 = 8;

/// A matched warmup probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupProbe {
    /// Model the probe named; echoed in the synthetic response.
    pub model: String,
    /// Whether the caller expects SSE frames.
    pub stream: bool,
}

/// Extract the text of a single message's content, accepting both the plain
/// string form and a one-element text-block array.
fn content_text(content: &Value) -> Option<&str> {
    match content {
        Value::String(s) => Some(s.as_str()),
        Value::Array(blocks) => match blocks.as_slice() {
            [block] if block.get("type").and_then(Value::as_str) == Some("text") => {
                block.get("text").and_then(Value::as_str)
            }
            _ => None,
        },
        _ => None,
    }
}

/// Match the warmup fingerprint against a messages-API body.
///
/// Streaming intent is read from the body's `stream` flag or from an
/// `Accept: text/event-stream` header, either of which forces SSE.
#[must_use]
pub fn match_warmup(body: &Value, accept: Option<&str>) -> Option<WarmupProbe> {
    let model = body.get("model").and_then(Value::as_str)?;
    if !MODEL_ALLOWLIST.iter().any(|p| model.starts_with(p)) {
        return None;
    }
    if let Some(max_tokens) = body.get("max_tokens").and_then(Value::as_i64)
        && max_tokens > MAX_PROBE_TOKENS
    {
        return None;
    }
    let messages = body.get("messages").and_then(Value::as_array)?;
    let [message] = messages.as_slice() else {
        return None;
    };
    if message.get("role").and_then(Value::as_str) != Some("user") {
        return None;
    }
    let text = message.get("content").and_then(content_text)?;
    if text.trim() != PROBE_TEXT {
        return None;
    }

    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false)
        || accept.is_some_and(|a| a.contains("text/event-stream"));
    Some(WarmupProbe {
        model: model.to_string(),
        stream,
    })
}
