use chrono::{TimeZone, Utc};
use relay_core::{Outcome, RuleEngine};
use relay_types::{ErrorCategory, ErrorRule, MatchType};

fn rule(
    id: i64,
    pattern: &str,
    match_type: MatchType,
    category: ErrorCategory,
    priority: i32,
    created_min: u32,
) -> ErrorRule {
    ErrorRule {
        id,
        pattern: pattern.into(),
        match_type,
        category,
        priority,
        is_enabled: true,
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, created_min, 0).unwrap(),
    }
}

#[test]
fn higher_priority_rule_wins() {
    let engine = RuleEngine::new(vec![
        rule(1, "overloaded", MatchType::Contains, ErrorCategory::Fatal, 1, 0),
        rule(2, "overloaded", MatchType::Contains, ErrorCategory::Retryable, 9, 1),
    ]);
    assert_eq!(
        engine.categorize("Overloaded, please retry"),
        Some(ErrorCategory::Retryable)
    );
}

#[test]
fn equal_priority_breaks_ties_by_creation_time() {
    let engine = RuleEngine::new(vec![
        rule(1, "busy", MatchType::Contains, ErrorCategory::ConcurrentLimited, 5, 9),
        rule(2, "busy", MatchType::Contains, ErrorCategory::Fatal, 5, 1),
    ]);
    // Rule 2 was created earlier, so it is consulted first.
    assert_eq!(engine.categorize("busy"), Some(ErrorCategory::Fatal));
}

#[test]
fn contains_matching_is_case_insensitive() {
    let engine = RuleEngine::new(vec![rule(
        1,
        "Rate Limit",
        MatchType::Contains,
        ErrorCategory::ConcurrentLimited,
        0,
        0,
    )]);
    assert_eq!(
        engine.categorize("upstream rate limit hit"),
        Some(ErrorCategory::ConcurrentLimited)
    );
}

#[test]
fn exact_matching_requires_equality() {
    let engine = RuleEngine::new(vec![rule(
        1,
        "quota exhausted",
        MatchType::Exact,
        ErrorCategory::Fatal,
        0,
        0,
    )]);
    assert_eq!(engine.categorize("quota exhausted"), Some(ErrorCategory::Fatal));
    assert_eq!(engine.categorize("quota exhausted!"), None);
}

#[test]
fn regex_rules_match_and_invalid_ones_are_dropped() {
    let engine = RuleEngine::new(vec![
        rule(1, r"5\d\d upstream", MatchType::Regex, ErrorCategory::Retryable, 2, 0),
        rule(2, r"([unclosed", MatchType::Regex, ErrorCategory::Fatal, 9, 0),
    ]);
    assert_eq!(
        engine.categorize("got 503 upstream"),
        Some(ErrorCategory::Retryable)
    );
}

#[test]
fn disabled_rules_are_skipped() {
    let mut r = rule(1, "nope", MatchType::Contains, ErrorCategory::Fatal, 0, 0);
    r.is_enabled = false;
    let engine = RuleEngine::new(vec![r]);
    assert_eq!(engine.categorize("nope"), None);
}

#[test]
fn status_family_fallback_when_no_rule_matches() {
    let engine = RuleEngine::empty();
    assert_eq!(engine.classify(Some(503), "bad gateway"), Outcome::RetryableFailure);
    assert_eq!(engine.classify(Some(429), "too many"), Outcome::ConcurrentLimited);
    assert_eq!(engine.classify(Some(400), "bad request"), Outcome::FatalFailure);
    assert_eq!(engine.classify(None, "connect refused"), Outcome::RetryableFailure);
}

#[test]
fn rule_category_overrides_status_family() {
    let engine = RuleEngine::new(vec![rule(
        1,
        "invalid api key",
        MatchType::Contains,
        ErrorCategory::Fatal,
        0,
        0,
    )]);
    // A 500 carrying a fatal-classified message is not retried.
    assert_eq!(
        engine.classify(Some(500), "Invalid API key supplied"),
        Outcome::FatalFailure
    );
}

#[test]
fn concurrent_limited_is_retryable_but_distinct() {
    assert!(Outcome::ConcurrentLimited.is_retryable());
    assert!(Outcome::RetryableFailure.is_retryable());
    assert!(!Outcome::FatalFailure.is_retryable());
}
