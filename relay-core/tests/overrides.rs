use std::collections::HashMap;

use chrono::Utc;
use relay_core::apply_overrides;
use relay_types::{
    AdaptiveEffort, AdaptiveThinkingConfig, ModelMatchMode, OverridePrefs, Provider, ProviderType,
    QuotaCaps, ResetConfig, ProviderTimeouts,
};
use rust_decimal::Decimal;
use serde_json::{Value, json};

fn provider(provider_type: ProviderType, overrides: OverridePrefs) -> Provider {
    Provider {
        id: 7,
        name: "anthropic-primary".into(),
        base_url: "https://api.anthropic.com".into(),
        provider_type,
        credential: String::new(),
        priority: 0,
        weight: 1,
        cost_multiplier: Decimal::ONE,
        is_enabled: true,
        group_tag: None,
        group_priorities: HashMap::new(),
        caps: QuotaCaps::default(),
        reset: ResetConfig::default(),
        timeouts: ProviderTimeouts::default(),
        schedule: None,
        overrides,
        deleted_at: None,
        created_at: Utc::now(),
    }
}

fn prefs(max_tokens: Option<&str>, budget: Option<&str>) -> OverridePrefs {
    OverridePrefs {
        max_tokens: max_tokens.map(str::to_string),
        thinking_budget: budget.map(str::to_string),
        adaptive: None,
    }
}

#[test]
fn clamps_thinking_budget_below_forced_max_tokens() {
    let p = provider(ProviderType::Claude, prefs(Some("10000"), Some("15000")));
    let mut req = json!({ "model": "claude-3-opus", "max_tokens": 8000 });

    let audit = apply_overrides(&p, &mut req).expect("audit");
    assert_eq!(req["max_tokens"], 10000);
    assert_eq!(req["thinking"]["type"], "enabled");
    assert_eq!(req["thinking"]["budget_tokens"], 9999);
    assert!(audit.hit);
    assert!(audit.changed);
}

#[test]
fn skips_thinking_when_clamp_falls_below_minimum() {
    let p = provider(ProviderType::Claude, prefs(Some("1024"), Some("2000")));
    let mut req = json!({ "model": "claude-sonnet-4", "max_tokens": 32000 });

    apply_overrides(&p, &mut req);
    assert_eq!(req["max_tokens"], 1024);
    assert!(req.get("thinking").is_none());
}

#[test]
fn skips_budget_below_api_minimum_outright() {
    let p = provider(ProviderType::Claude, prefs(None, Some("512")));
    let mut req = json!({ "model": "claude-sonnet-4", "max_tokens": 32000 });
    assert!(apply_overrides(&p, &mut req).is_none());
    assert!(req.get("thinking").is_none());
}

#[test]
fn budget_without_max_tokens_is_not_clamped() {
    let p = provider(ProviderType::ClaudeAuth, prefs(None, Some("4096")));
    let mut req = json!({ "model": "claude-sonnet-4" });
    let audit = apply_overrides(&p, &mut req).expect("audit");
    assert_eq!(req["thinking"]["budget_tokens"], 4096);
    assert!(audit.changed);
}

#[test]
fn preserves_sibling_thinking_fields() {
    let p = provider(ProviderType::Claude, prefs(None, Some("2048")));
    let mut req = json!({
        "model": "claude-sonnet-4",
        "max_tokens": 8000,
        "thinking": { "type": "disabled", "note": "keep-me" }
    });
    apply_overrides(&p, &mut req);
    assert_eq!(req["thinking"]["type"], "enabled");
    assert_eq!(req["thinking"]["budget_tokens"], 2048);
    assert_eq!(req["thinking"]["note"], "keep-me");
}

#[test]
fn replaces_non_object_thinking() {
    let p = provider(ProviderType::Claude, prefs(None, Some("2048")));
    let mut req = json!({ "model": "m", "max_tokens": 8000, "thinking": "bogus" });
    apply_overrides(&p, &mut req);
    assert_eq!(req["thinking"]["type"], "enabled");
}

#[test]
fn untouched_for_out_of_scope_provider_types() {
    for t in [
        ProviderType::Codex,
        ProviderType::Gemini,
        ProviderType::OpenaiCompatible,
    ] {
        let p = provider(t, prefs(Some("10000"), Some("15000")));
        let mut req = json!({ "model": "gpt-5", "max_tokens": 8000 });
        let before = req.clone();
        assert!(apply_overrides(&p, &mut req).is_none());
        assert_eq!(req, before);
    }
}

#[test]
fn inherit_and_malformed_preferences_are_noops() {
    for pref in [Some("inherit"), Some(""), Some("  "), Some("12abc"), None] {
        let p = provider(ProviderType::Claude, prefs(pref, pref));
        let mut req = json!({ "model": "claude-sonnet-4", "max_tokens": 8000 });
        let before = req.clone();
        assert!(apply_overrides(&p, &mut req).is_none(), "pref={pref:?}");
        assert_eq!(req, before);
    }
}

#[test]
fn adaptive_matches_all_mode_and_merges_output_config() {
    let p = provider(
        ProviderType::Claude,
        OverridePrefs {
            max_tokens: None,
            thinking_budget: Some("adaptive".into()),
            adaptive: Some(AdaptiveThinkingConfig {
                effort: AdaptiveEffort::High,
                model_match_mode: ModelMatchMode::All,
                models: vec![],
            }),
        },
    );
    let mut req = json!({
        "model": "claude-sonnet-4",
        "thinking": { "type": "enabled", "budget_tokens": 2048 },
        "output_config": { "format": "json" }
    });
    let audit = apply_overrides(&p, &mut req).expect("audit");
    assert_eq!(req["thinking"], json!({ "type": "adaptive" }));
    assert_eq!(req["output_config"]["effort"], "high");
    assert_eq!(req["output_config"]["format"], "json");
    assert!(audit.changed);
}

#[test]
fn adaptive_specific_mode_matches_by_model_prefix() {
    let cfg = AdaptiveThinkingConfig {
        effort: AdaptiveEffort::Max,
        model_match_mode: ModelMatchMode::Specific,
        models: vec!["claude-opus-4".into()],
    };
    let p = provider(
        ProviderType::Claude,
        OverridePrefs {
            max_tokens: None,
            thinking_budget: Some("adaptive".into()),
            adaptive: Some(cfg),
        },
    );

    let mut matching = json!({ "model": "claude-opus-4-20250514" });
    assert!(apply_overrides(&p, &mut matching).is_some());
    assert_eq!(matching["thinking"], json!({ "type": "adaptive" }));

    let mut other = json!({ "model": "claude-sonnet-4" });
    let before = other.clone();
    assert!(apply_overrides(&p, &mut other).is_none());
    assert_eq!(other, before);
}

#[test]
fn audit_changes_flag_false_when_values_already_match() {
    let p = provider(ProviderType::Claude, prefs(Some("8000"), None));
    let mut req = json!({ "model": "m", "max_tokens": 8000 });
    let audit = apply_overrides(&p, &mut req).expect("audit");
    assert!(audit.hit);
    assert!(!audit.changed);
    assert_eq!(audit.changes.len(), 1);
    assert!(!audit.changes[0].changed);
    assert_eq!(audit.changes[0].path, "max_tokens");
}

#[test]
fn clamp_invariant_holds_after_overrides() {
    // Whenever budget_tokens is set post-override, max_tokens is set and
    // 1024 <= budget <= max_tokens - 1.
    let cases = [
        (Some("10000"), Some("15000"), json!({ "max_tokens": 8000 })),
        (Some("4096"), Some("4095"), json!({})),
        (None, Some("9000"), json!({ "max_tokens": 9001 })),
    ];
    for (mt, budget, mut extra) in cases {
        let p = provider(ProviderType::Claude, prefs(mt, budget));
        extra["model"] = Value::String("claude-sonnet-4".into());
        apply_overrides(&p, &mut extra);
        if let Some(b) = extra.get("thinking").and_then(|t| t.get("budget_tokens")) {
            let b = b.as_i64().unwrap();
            let mt = extra["max_tokens"].as_i64().expect("max_tokens set");
            assert!(b >= 1024, "budget {b} below minimum");
            assert!(b <= mt - 1, "budget {b} not clamped under {mt}");
        }
    }
}
