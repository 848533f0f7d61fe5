use chrono::{TimeZone, Utc};
use relay_core::is_schedule_active;
use relay_types::{ResetTime, ScheduleWindow};

fn window(start: (u8, u8), end: (u8, u8), tz: &str) -> ScheduleWindow {
    ScheduleWindow {
        start: ResetTime::new(start.0, start.1),
        end: ResetTime::new(end.0, end.1),
        timezone: tz.into(),
    }
}

#[test]
fn midnight_crossing_window() {
    let w = window((22, 0), (8, 0), "UTC");
    let active = Utc.with_ymd_and_hms(2024, 6, 1, 23, 30, 0).unwrap();
    assert!(is_schedule_active(&w, active));

    let early = Utc.with_ymd_and_hms(2024, 6, 2, 3, 0, 0).unwrap();
    assert!(is_schedule_active(&w, early));

    // The end boundary is exclusive.
    let at_end = Utc.with_ymd_and_hms(2024, 6, 2, 8, 0, 0).unwrap();
    assert!(!is_schedule_active(&w, at_end));

    let midday = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    assert!(!is_schedule_active(&w, midday));
}

#[test]
fn plain_window_start_inclusive_end_exclusive() {
    let w = window((9, 0), (17, 0), "UTC");
    let at_start = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
    assert!(is_schedule_active(&w, at_start));
    let at_end = Utc.with_ymd_and_hms(2024, 6, 1, 17, 0, 0).unwrap();
    assert!(!is_schedule_active(&w, at_end));
}

#[test]
fn zero_width_window_is_never_active() {
    let w = window((8, 0), (8, 0), "UTC");
    let t = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
    assert!(!is_schedule_active(&w, t));
}

#[test]
fn window_is_evaluated_in_its_own_timezone() {
    // 09:00–17:00 Shanghai; 02:00 UTC is 10:00 local.
    let w = window((9, 0), (17, 0), "Asia/Shanghai");
    let t = Utc.with_ymd_and_hms(2024, 6, 1, 2, 0, 0).unwrap();
    assert!(is_schedule_active(&w, t));
    // 12:00 UTC is 20:00 local.
    let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    assert!(!is_schedule_active(&w, t));
}

#[test]
fn bad_timezone_fails_open() {
    let w = window((9, 0), (17, 0), "Not/AZone");
    let t = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    assert!(is_schedule_active(&w, t));
}
