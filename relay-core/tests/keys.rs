use chrono::{TimeZone, Utc};
use relay_core::store::{
    fixed_daily_key, five_hour_key, monthly_key, rolling_daily_key, sessions_key, total_cost_key,
    weekly_key,
};
use relay_types::{ResetTime, Scope};

#[test]
fn counter_key_layout_is_canonical() {
    assert_eq!(five_hour_key(Scope::User, "42"), "user:42:cost_5h");
    assert_eq!(
        fixed_daily_key(Scope::Key, "abcd", ResetTime::new(0, 0)),
        "key:abcd:cost_daily_0000"
    );
    assert_eq!(
        fixed_daily_key(Scope::User, "42", ResetTime::new(18, 30)),
        "user:42:cost_daily_1830"
    );
    assert_eq!(rolling_daily_key(Scope::User, "42"), "user:42:cost_daily_rolling");
    assert_eq!(monthly_key(Scope::Provider, "1"), "provider:1:cost_monthly");
    assert_eq!(sessions_key(Scope::Key, "abcd"), "sessions:key:abcd");
}

#[test]
fn weekly_key_suffix_only_for_provider_scope() {
    assert_eq!(
        weekly_key(Scope::Provider, "1", 5, ResetTime::new(18, 0)),
        "provider:1:cost_weekly_5_1800"
    );
    assert_eq!(
        weekly_key(Scope::Provider, "1", 12, ResetTime::new(18, 0)),
        "provider:1:cost_weekly_5_1800"
    );
    assert_eq!(weekly_key(Scope::User, "42", 5, ResetTime::new(18, 0)), "user:42:cost_weekly");
    assert_eq!(weekly_key(Scope::Key, "abcd", 1, ResetTime::MIDNIGHT), "key:abcd:cost_weekly");
}

#[test]
fn total_cost_key_uses_none_suffix_for_null_reset() {
    assert_eq!(total_cost_key(Scope::User, "42", None), "total_cost:user:42:none");
    let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    assert_eq!(
        total_cost_key(Scope::Provider, "7", Some(at)),
        format!("total_cost:provider:7:{}", at.timestamp_millis())
    );
}
