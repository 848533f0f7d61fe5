//! Provider schedule-window evaluation.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;

use relay_types::ScheduleWindow;

/// Whether `window` admits traffic at `now`.
///
/// The window is evaluated against the wall clock in the window's own
/// timezone. `start == end` is a zero-width window and never active;
/// `start > end` crosses midnight (`22:00`–`08:00` covers late evening and
/// early morning). The end boundary is exclusive, so a `08:00` end rejects
/// exactly `08:00`.
///
/// An unparseable timezone fails open: a misconfigured window should not
/// silently take a provider out of rotation.
#[must_use]
pub fn is_schedule_active(window: &ScheduleWindow, now: DateTime<Utc>) -> bool {
    let Ok(tz) = window.timezone.parse::<Tz>() else {
        tracing::warn!(timezone = %window.timezone, "unparseable schedule timezone, treating window as always active");
        return true;
    };
    let local = now.with_timezone(&tz);
    let minute_of_day = local.hour() * 60 + local.minute();
    let start = u32::from(window.start.hour()) * 60 + u32::from(window.start.minute());
    let end = u32::from(window.end.hour()) * 60 + u32::from(window.end.minute());

    if start == end {
        return false;
    }
    if start < end {
        start <= minute_of_day && minute_of_day < end
    } else {
        minute_of_day >= start || minute_of_day < end
    }
}
