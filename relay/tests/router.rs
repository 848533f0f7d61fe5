mod helpers;

use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use helpers::{endpoint, harness, provider};
use relay::router::{SelectorInputs, select};
use relay_core::classify::Outcome;
use relay_types::{
    ChainReason, RelayError, ResetTime, ScheduleWindow, SelectionMethod,
};
use rust_decimal::Decimal;

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

#[tokio::test]
async fn picks_lowest_priority_bucket() {
    let h = harness(
        vec![
            provider(1, "slow", 10, 100),
            provider(2, "fast", 1, 100),
            provider(3, "also-fast", 1, 100),
        ],
        vec![
            endpoint(11, 1, "https://a"),
            endpoint(12, 2, "https://b"),
            endpoint(13, 3, "https://c"),
        ],
    );
    let snapshot = h.state.registry.load();
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec![],
        session_provider: None,
        excluded: &[],
        now: now(),
    };
    for _ in 0..20 {
        let selection = select(&inputs, &h.state.limits, &h.state.breakers)
            .await
            .expect("selection");
        assert_ne!(selection.provider.id, 1, "priority 10 provider chosen");
        let ctx = selection.chain_item.decision_context.expect("context");
        assert_eq!(ctx.enabled_providers, 3);
        assert_eq!(ctx.after_health_check, 3);
        assert_eq!(ctx.selected_priority, 1);
        assert_eq!(selection.chain_item.reason, ChainReason::InitialSelection);
        assert_eq!(
            selection.chain_item.selection_method,
            Some(SelectionMethod::PriorityWeighted)
        );
    }
}

#[tokio::test]
async fn weighted_draw_follows_weights() {
    let h = harness(
        vec![provider(1, "light", 0, 1), provider(2, "heavy", 0, 9)],
        vec![endpoint(11, 1, "https://a"), endpoint(12, 2, "https://b")],
    );
    let snapshot = h.state.registry.load();
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec![],
        session_provider: None,
        excluded: &[],
        now: now(),
    };
    let mut heavy = 0;
    for _ in 0..500 {
        let selection = select(&inputs, &h.state.limits, &h.state.breakers)
            .await
            .expect("selection");
        if selection.provider.id == 2 {
            heavy += 1;
        }
    }
    // Expectation is 450 of 500; anything above 380 is comfortably inside
    // the distribution.
    assert!(heavy > 380, "heavy provider picked only {heavy}/500 times");
}

#[tokio::test]
async fn group_routing_and_group_priority_override() {
    let mut tagged = provider(1, "eu", 10, 100);
    tagged.group_tag = Some("eu,beta".into());
    tagged.group_priorities = HashMap::from([("beta".to_string(), 0)]);
    let mut default_p = provider(2, "default", 0, 100);
    default_p.group_tag = None;

    let h = harness(
        vec![tagged, default_p],
        vec![endpoint(11, 1, "https://a"), endpoint(12, 2, "https://b")],
    );
    let snapshot = h.state.registry.load();

    // Keyless traffic routes to the `default` group only.
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec![],
        session_provider: None,
        excluded: &[],
        now: now(),
    };
    let selection = select(&inputs, &h.state.limits, &h.state.breakers)
        .await
        .expect("selection");
    assert_eq!(selection.provider.id, 2);

    // A beta-group key sees the override priority 0 and wins the bucket.
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec!["beta"],
        session_provider: None,
        excluded: &[],
        now: now(),
    };
    let selection = select(&inputs, &h.state.limits, &h.state.breakers)
        .await
        .expect("selection");
    assert_eq!(selection.provider.id, 1);
    assert_eq!(
        selection.chain_item.decision_context.unwrap().selected_priority,
        0
    );
}

#[tokio::test]
async fn schedule_window_filters_providers() {
    let mut night_only = provider(1, "night", 0, 100);
    night_only.schedule = Some(ScheduleWindow {
        start: ResetTime::new(22, 0),
        end: ResetTime::new(8, 0),
        timezone: "UTC".into(),
    });
    let day = provider(2, "day", 5, 100);
    let h = harness(
        vec![night_only, day],
        vec![endpoint(11, 1, "https://a"), endpoint(12, 2, "https://b")],
    );
    let snapshot = h.state.registry.load();

    // Noon: the night window is inactive, the higher-priority-number
    // provider is all that remains.
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec![],
        session_provider: None,
        excluded: &[],
        now: now(),
    };
    let selection = select(&inputs, &h.state.limits, &h.state.breakers)
        .await
        .expect("selection");
    assert_eq!(selection.provider.id, 2);

    // 23:30: the night provider is active and wins on priority.
    let late = Utc.with_ymd_and_hms(2024, 6, 1, 23, 30, 0).unwrap();
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec![],
        session_provider: None,
        excluded: &[],
        now: late,
    };
    let selection = select(&inputs, &h.state.limits, &h.state.breakers)
        .await
        .expect("selection");
    assert_eq!(selection.provider.id, 1);
}

#[tokio::test]
async fn exhausted_total_budget_excludes_provider() {
    let mut capped = provider(1, "capped", 0, 100);
    capped.caps.limit_total_usd = Some(Decimal::from(10));
    let fallback = provider(2, "fallback", 5, 100);
    let h = harness(
        vec![capped, fallback],
        vec![endpoint(11, 1, "https://a"), endpoint(12, 2, "https://b")],
    );
    // Cached total says the budget is gone.
    use relay_core::store::CounterStore;
    h.counters
        .write_total("total_cost:provider:1:none", Decimal::from(25))
        .await
        .unwrap();

    let snapshot = h.state.registry.load();
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec![],
        session_provider: None,
        excluded: &[],
        now: now(),
    };
    let selection = select(&inputs, &h.state.limits, &h.state.breakers)
        .await
        .expect("selection");
    assert_eq!(selection.provider.id, 2);
    assert_eq!(
        selection.chain_item.decision_context.unwrap().after_health_check,
        1
    );
}

#[tokio::test]
async fn open_breaker_excludes_endpoint_and_provider() {
    let h = harness(
        vec![provider(1, "only", 0, 100)],
        vec![endpoint(11, 1, "https://a")],
    );
    for _ in 0..3 {
        h.state
            .breakers
            .record_outcome(11, Outcome::RetryableFailure, now())
            .await;
    }

    let snapshot = h.state.registry.load();
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec![],
        session_provider: None,
        excluded: &[],
        now: now(),
    };
    let err = select(&inputs, &h.state.limits, &h.state.breakers)
        .await
        .expect_err("open breaker leaves no candidates");
    assert!(matches!(err, RelayError::NoCandidates { .. }));
}

#[tokio::test]
async fn endpoint_order_prefers_probe_then_sort_then_latency() {
    let mut slow = endpoint(11, 1, "https://slow");
    slow.last_probe_latency_ms = Some(900);
    let mut fast = endpoint(12, 1, "https://fast");
    fast.last_probe_latency_ms = Some(50);
    let mut unprobed = endpoint(13, 1, "https://unprobed");
    unprobed.last_probe_ok = None;
    unprobed.last_probe_latency_ms = None;

    let h = harness(vec![provider(1, "p", 0, 100)], vec![slow, fast, unprobed]);
    let snapshot = h.state.registry.load();
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec![],
        session_provider: None,
        excluded: &[],
        now: now(),
    };
    let selection = select(&inputs, &h.state.limits, &h.state.breakers)
        .await
        .expect("selection");
    assert_eq!(selection.endpoint.id, 12);

    // With the fast endpoint excluded, the slow-but-probed one beats the
    // unprobed one.
    let excluded = [(1, 12)];
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec![],
        session_provider: None,
        excluded: &excluded,
        now: now(),
    };
    let selection = select(&inputs, &h.state.limits, &h.state.breakers)
        .await
        .expect("selection");
    assert_eq!(selection.endpoint.id, 11);
}

#[tokio::test]
async fn session_reuse_wins_over_priority() {
    let h = harness(
        vec![provider(1, "preferred", 0, 100), provider(2, "sticky", 5, 100)],
        vec![endpoint(11, 1, "https://a"), endpoint(12, 2, "https://b")],
    );
    let snapshot = h.state.registry.load();
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec![],
        session_provider: Some(2),
        excluded: &[],
        now: now(),
    };
    let selection = select(&inputs, &h.state.limits, &h.state.breakers)
        .await
        .expect("selection");
    assert_eq!(selection.provider.id, 2);
    assert_eq!(selection.chain_item.reason, ChainReason::SessionReuse);
    assert_eq!(
        selection.chain_item.selection_method,
        Some(SelectionMethod::SessionReuse)
    );
}

#[tokio::test]
async fn session_reuse_falls_back_when_provider_left_candidate_set() {
    let mut sticky = provider(2, "sticky", 5, 100);
    sticky.is_enabled = false;
    let h = harness(
        vec![provider(1, "preferred", 0, 100), sticky],
        vec![endpoint(11, 1, "https://a"), endpoint(12, 2, "https://b")],
    );
    let snapshot = h.state.registry.load();
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec![],
        session_provider: Some(2),
        excluded: &[],
        now: now(),
    };
    let selection = select(&inputs, &h.state.limits, &h.state.breakers)
        .await
        .expect("selection");
    assert_eq!(selection.provider.id, 1);
    assert_eq!(selection.chain_item.reason, ChainReason::InitialSelection);
}

#[tokio::test]
async fn excluding_failed_pairs_moves_to_next_provider() {
    let h = harness(
        vec![provider(1, "first", 0, 100), provider(2, "second", 5, 100)],
        vec![endpoint(11, 1, "https://a"), endpoint(12, 2, "https://b")],
    );
    let snapshot = h.state.registry.load();
    let excluded = [(1, 11)];
    let inputs = SelectorInputs {
        snapshot: &snapshot,
        key_groups: vec![],
        session_provider: None,
        excluded: &excluded,
        now: now(),
    };
    let selection = select(&inputs, &h.state.limits, &h.state.breakers)
        .await
        .expect("selection");
    assert_eq!(selection.provider.id, 2);
}
