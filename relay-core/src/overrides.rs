//! Per-provider request parameter overrides.
//!
//! A pure transformation over the Anthropic messages body. Each rule is
//! independently a no-op when its preference is absent, `"inherit"`, or a
//! malformed number, so a misconfigured provider row degrades to
//! pass-through instead of breaking traffic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use relay_types::{ModelMatchMode, Provider};

/// API minimum for `thinking.budget_tokens`.
const MIN_THINKING_BUDGET: i64 = 1024;

/// One field-level change recorded by the override engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideChange {
    /// Dotted path of the touched field.
    pub path: String,
    /// Value before the rule ran.
    pub before: Value,
    /// Value after the rule ran.
    pub after: Value,
    /// True only when `after != before`.
    pub changed: bool,
}

/// Audit record returned when any override rule applied a change candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideAudit {
    /// Always true on a returned audit.
    pub hit: bool,
    /// True when at least one field actually changed value.
    pub changed: bool,
    /// Provider the preferences came from.
    pub provider_id: i64,
    /// Provider display name.
    pub provider_name: String,
    /// Provider dialect.
    pub provider_type: String,
    /// Field-level trail.
    pub changes: Vec<OverrideChange>,
}

/// Parse a preference string as an integer; `None` for absent, `"inherit"`,
/// empty, or malformed input.
fn parse_pref(pref: Option<&str>) -> Option<i64> {
    let raw = pref?.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("inherit") {
        return None;
    }
    raw.parse().ok()
}

fn record(changes: &mut Vec<OverrideChange>, path: &str, before: Value, after: Value) {
    let changed = before != after;
    changes.push(OverrideChange {
        path: path.to_string(),
        before,
        after,
        changed,
    });
}

/// Apply the provider's override preferences to a messages-API body.
///
/// Returns `None` when the provider dialect is out of scope
/// (`supports_overrides` is false) or when no rule applied a change
/// candidate; the request is untouched in both cases. Otherwise the body is
/// rewritten in place and the audit describes every touched field.
#[must_use]
pub fn apply_overrides(provider: &Provider, request: &mut Value) -> Option<OverrideAudit> {
    if !provider.provider_type.supports_overrides() || !request.is_object() {
        return None;
    }
    let prefs = &provider.overrides;
    let mut changes: Vec<OverrideChange> = Vec::new();

    // Rule 1: forced max_tokens.
    if let Some(forced) = parse_pref(prefs.max_tokens.as_deref()) {
        let before = request.get("max_tokens").cloned().unwrap_or(Value::Null);
        request["max_tokens"] = json!(forced);
        record(&mut changes, "max_tokens", before, json!(forced));
    }

    let budget_pref = prefs.thinking_budget.as_deref().map(str::trim);

    // Rule 3: adaptive thinking.
    if budget_pref.is_some_and(|p| p.eq_ignore_ascii_case("adaptive")) {
        if let Some(cfg) = prefs.adaptive.as_ref() {
            let model = request.get("model").and_then(Value::as_str).unwrap_or("");
            let matched = match cfg.model_match_mode {
                ModelMatchMode::All => true,
                ModelMatchMode::Specific => {
                    cfg.models.iter().any(|prefix| model.starts_with(prefix))
                }
            };
            if matched {
                let before_thinking = request.get("thinking").cloned().unwrap_or(Value::Null);
                let after_thinking = json!({ "type": "adaptive" });
                request["thinking"] = after_thinking.clone();
                record(&mut changes, "thinking", before_thinking, after_thinking);

                let before_effort = request
                    .get("output_config")
                    .and_then(|oc| oc.get("effort"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let effort = Value::String(cfg.effort.as_str().to_string());
                match request.get_mut("output_config") {
                    Some(Value::Object(oc)) => {
                        oc.insert("effort".to_string(), effort.clone());
                    }
                    _ => {
                        request["output_config"] = json!({ "effort": effort.clone() });
                    }
                }
                record(&mut changes, "output_config.effort", before_effort, effort);
            }
        }
    } else if let Some(budget) = parse_pref(budget_pref)
        && budget >= MIN_THINKING_BUDGET
    {
        // Rule 2: numeric thinking budget, clamped under max_tokens.
        let max_tokens = request.get("max_tokens").and_then(Value::as_i64);
        let clamped = match max_tokens {
            Some(mt) => budget.min(mt - 1),
            None => budget,
        };
        if clamped >= MIN_THINKING_BUDGET {
            let before = request.get("thinking").cloned().unwrap_or(Value::Null);
            let mut thinking = match request.get("thinking") {
                Some(Value::Object(existing)) => existing.clone(),
                _ => Map::new(),
            };
            thinking.insert("type".to_string(), json!("enabled"));
            thinking.insert("budget_tokens".to_string(), json!(clamped));
            let after = Value::Object(thinking);
            request["thinking"] = after.clone();
            record(&mut changes, "thinking", before, after);
        }
    }

    if changes.is_empty() {
        return None;
    }
    let changed = changes.iter().any(|c| c.changed);
    Some(OverrideAudit {
        hit: true,
        changed,
        provider_id: provider.id,
        provider_name: provider.name.clone(),
        provider_type: serde_json::to_value(provider.provider_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default(),
        changes,
    })
}
