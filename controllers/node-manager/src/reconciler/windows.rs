//! Disruption windows.
//!
//! A window is `from`..`to` in UTC, `HH:MM` each, optionally limited to some
//! weekdays. `to` earlier than `from` crosses midnight; the day list then
//! refers to the day the window opened.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use crds::DisruptionWindow;
use tracing::warn;

fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

fn day_matches(days: &[String], day: Weekday) -> bool {
    days.is_empty() || days.iter().any(|d| d.trim().parse::<Weekday>().is_ok_and(|w| w == day))
}

fn is_open(window: &DisruptionWindow, now: DateTime<Utc>) -> bool {
    let (Some(from), Some(to)) = (parse_time(&window.from), parse_time(&window.to)) else {
        warn!(from = %window.from, to = %window.to, "Ignoring disruption window with invalid time");
        return false;
    };
    let time = now.time();
    if from <= to {
        return from <= time && time < to && day_matches(&window.days, now.weekday());
    }
    if time >= from {
        return day_matches(&window.days, now.weekday());
    }
    time < to && day_matches(&window.days, (now - Duration::days(1)).weekday())
}

/// True when `now` falls into any of `windows`; no windows means always.
pub fn is_in_allowed_window(windows: &[DisruptionWindow], now: DateTime<Utc>) -> bool {
    windows.is_empty() || windows.iter().any(|w| is_open(w, now))
}
