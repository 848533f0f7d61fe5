use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use relay_types::{
    ApiKey, CacheTtlPreference, OverridePrefs, Provider, ProviderEndpoint, ProviderTimeouts,
    ProviderType, QuotaCaps, ResetConfig, ResetTime, User, mask_secret,
};
use rust_decimal::Decimal;

fn key(provider_group: Option<&str>) -> ApiKey {
    ApiKey {
        id: 1,
        key_hash: "abc".into(),
        masked: "sk-…abcd".into(),
        user_id: 1,
        expires_at: None,
        is_enabled: true,
        can_login_web_ui: false,
        provider_group: provider_group.map(str::to_string),
        cache_ttl: CacheTtlPreference::Inherit,
        caps: QuotaCaps::default(),
        reset: ResetConfig::default(),
        deleted_at: None,
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

fn provider(group_tag: Option<&str>) -> Provider {
    Provider {
        id: 1,
        name: "p1".into(),
        base_url: "https://api.example.com".into(),
        provider_type: ProviderType::Claude,
        credential: String::new(),
        priority: 10,
        weight: 100,
        cost_multiplier: Decimal::ONE,
        is_enabled: true,
        group_tag: group_tag.map(str::to_string),
        group_priorities: HashMap::new(),
        caps: QuotaCaps::default(),
        reset: ResetConfig::default(),
        timeouts: ProviderTimeouts::default(),
        schedule: None,
        overrides: OverridePrefs::default(),
        deleted_at: None,
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

#[test]
fn reset_time_normalizes_components_independently() {
    assert_eq!(ResetTime::parse("99:10").to_string(), "00:10");
    assert_eq!(ResetTime::parse("12:70").to_string(), "12:00");
    assert_eq!(ResetTime::parse("07:05").to_string(), "07:05");
    assert_eq!(ResetTime::parse("garbage").to_string(), "00:00");
}

#[test]
fn reset_time_hhmm_suffix_is_zero_padded() {
    assert_eq!(ResetTime::new(18, 0).hhmm(), "1800");
    assert_eq!(ResetTime::new(0, 5).hhmm(), "0005");
}

#[test]
fn weekly_day_normalizes_modulo_seven() {
    let cfg = ResetConfig {
        weekly_reset_day: 12,
        ..ResetConfig::default()
    };
    assert_eq!(cfg.weekly_reset_day_normalized(), 5);
}

#[test]
fn tag_validation_bounds() {
    let ok: Vec<String> = (0..20).map(|i| format!("t{i}")).collect();
    assert!(User::validate_tags(&ok).is_ok());

    let too_many: Vec<String> = (0..21).map(|i| format!("t{i}")).collect();
    assert!(User::validate_tags(&too_many).is_err());

    let too_long = vec!["x".repeat(33)];
    assert!(User::validate_tags(&too_long).is_err());
}

#[test]
fn groups_split_and_trim() {
    assert_eq!(key(Some("a, b ,,c")).groups(), vec!["a", "b", "c"]);
    assert!(key(None).groups().is_empty());
    assert!(key(Some("  ")).groups().is_empty());
}

#[test]
fn masking_keeps_prefix_and_tail() {
    assert_eq!(mask_secret("sk-ant-0123456789"), "sk-…6789");
    assert_eq!(mask_secret("short"), "****");
}

#[test]
fn untagged_provider_belongs_to_default_group() {
    assert_eq!(provider(None).groups(), vec!["default"]);
    assert_eq!(provider(Some(" ")).groups(), vec!["default"]);
    assert_eq!(provider(Some("a,b")).groups(), vec!["a", "b"]);
}

#[test]
fn lowest_matched_group_priority_wins() {
    let mut p = provider(Some("fast,cheap"));
    p.group_priorities.insert("fast".into(), 5);
    p.group_priorities.insert("cheap".into(), 2);
    assert_eq!(p.effective_priority(&["fast", "cheap"]), 2);
    assert_eq!(p.effective_priority(&["fast"]), 5);
    assert_eq!(p.effective_priority(&["other"]), 10);
}

#[test]
fn endpoint_preference_orders_probe_state_first() {
    let healthy = ProviderEndpoint {
        id: 3,
        provider_id: 1,
        url: "https://a".into(),
        is_enabled: true,
        sort_order: 9,
        last_probe_ok: Some(true),
        last_probe_latency_ms: Some(800),
    };
    let unprobed = ProviderEndpoint {
        id: 1,
        sort_order: 0,
        last_probe_ok: None,
        last_probe_latency_ms: None,
        ..healthy.clone()
    };
    let failing = ProviderEndpoint {
        id: 2,
        sort_order: 0,
        last_probe_ok: Some(false),
        ..healthy.clone()
    };
    let mut all = vec![failing, unprobed, healthy];
    all.sort_by_key(ProviderEndpoint::preference_key);
    assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 1, 2]);
}

#[test]
fn chain_item_serializes_wire_names() {
    use relay_types::{ChainReason, ProviderChainItem, SelectionMethod};

    let mut item = ProviderChainItem::new("p1", ChainReason::InitialSelection);
    item.selection_method = Some(SelectionMethod::PriorityWeighted);
    let json = serde_json::to_value(&item).unwrap();
    assert_eq!(json["reason"], "initial_selection");
    assert_eq!(json["selectionMethod"], "priority-weighted");
}
