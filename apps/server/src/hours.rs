//! Weekly operating-hours schedule and the resolver that turns it into
//! closed dates and per-date open windows.
//!
//! Back-office data is not trusted: a missing or malformed schedule
//! degrades to "no restriction" so bad JSON can never hard-lock a
//! company out of bookings.

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default look-ahead for closed-date expansion.
pub const DEFAULT_RANGE_DAYS: i64 = 90;

/// Wire format for calendar dates.
pub const DATE_FMT: &str = "%Y-%m-%d";
/// Wire format for times of day.
pub const TIME_FMT: &str = "%H:%M";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayHours {
    #[serde(default)]
    pub open: Option<String>,
    #[serde(default)]
    pub close: Option<String>,
    #[serde(default)]
    pub closed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatingHours {
    #[serde(default)]
    pub all_day: bool,
    /// Keyed by lowercase weekday name ("monday".."sunday").
    #[serde(default)]
    pub schedule: HashMap<String, DayHours>,
}

impl OperatingHours {
    /// Parse the JSON column. Fail-open: `None` means "no restriction".
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        let raw = raw?;
        match serde_json::from_str::<OperatingHours>(raw) {
            Ok(hours) => Some(hours),
            Err(e) => {
                tracing::warn!("unparseable operating hours, treating as unrestricted: {}", e);
                None
            }
        }
    }

    fn entry(&self, weekday: Weekday) -> Option<&DayHours> {
        self.schedule.get(weekday_key(weekday))
    }
}

fn weekday_key(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

// ── Wire format helpers ──

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FMT).ok()
}

pub fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FMT).to_string()
}

pub fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, TIME_FMT).ok()
}

pub fn fmt_time(time: NaiveTime) -> String {
    time.format(TIME_FMT).to_string()
}

fn full_day() -> (NaiveTime, NaiveTime) {
    (
        NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
    )
}

// ── Resolver ──

/// Dates in `[from, from + days)` on which the company is closed.
///
/// `hours = None` (missing or malformed schedule) and `all_day` both
/// yield an empty set.
pub fn closed_dates(hours: Option<&OperatingHours>, from: NaiveDate, days: i64) -> Vec<NaiveDate> {
    let hours = match hours {
        Some(h) if !h.all_day => h,
        _ => return Vec::new(),
    };

    let mut closed = Vec::new();
    for offset in 0..days.max(0) {
        let date = from + Duration::days(offset);
        if hours.entry(date.weekday()).is_some_and(|e| e.closed) {
            closed.push(date);
        }
    }
    closed
}

/// The open window for `date`, or `None` when the company is closed
/// that weekday.
///
/// `all_day`, a missing weekday entry, and an entry with unparseable or
/// inverted times all degrade to the full day.
pub fn open_window(hours: Option<&OperatingHours>, date: NaiveDate) -> Option<(NaiveTime, NaiveTime)> {
    let hours = match hours {
        Some(h) => h,
        None => return Some(full_day()),
    };
    if hours.all_day {
        return Some(full_day());
    }

    let entry = match hours.entry(date.weekday()) {
        Some(e) => e,
        None => return Some(full_day()),
    };
    if entry.closed {
        return None;
    }

    let open = entry.open.as_deref().and_then(parse_time);
    let close = entry.close.as_deref().and_then(parse_time);
    match (open, close) {
        (Some(open), Some(close)) if open < close => Some((open, close)),
        _ => Some(full_day()),
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn hours_json(json: &str) -> OperatingHours {
        OperatingHours::parse(Some(json)).expect("test schedule must parse")
    }

    fn weekly_closed_monday() -> OperatingHours {
        hours_json(
            r#"{"allDay": false, "schedule": {
                "monday": {"closed": true},
                "tuesday": {"open": "09:00", "close": "18:00"},
                "wednesday": {"open": "09:00", "close": "18:00"},
                "thursday": {"open": "09:00", "close": "18:00"},
                "friday": {"open": "09:00", "close": "18:00"},
                "saturday": {"open": "10:00", "close": "14:00"},
                "sunday": {"closed": true}
            }}"#,
        )
    }

    fn date(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    // ── parsing ──

    #[test]
    fn test_parse_missing_column() {
        assert!(OperatingHours::parse(None).is_none());
    }

    #[test]
    fn test_parse_malformed_json_fails_open() {
        assert!(OperatingHours::parse(Some("{not json")).is_none());
        assert!(OperatingHours::parse(Some("[1,2,3]")).is_none());
    }

    #[test]
    fn test_parse_empty_object_defaults() {
        let hours = hours_json("{}");
        assert!(!hours.all_day);
        assert!(hours.schedule.is_empty());
    }

    // ── closed_dates ──

    #[test]
    fn test_closed_dates_every_monday_in_range() {
        // 2026-03-02 is a Monday
        let hours = weekly_closed_monday();
        let closed = closed_dates(Some(&hours), date("2026-03-02"), 14);
        let mondays: Vec<_> = closed
            .iter()
            .filter(|d| d.weekday() == Weekday::Mon)
            .collect();
        assert_eq!(mondays.len(), 2);
        assert!(closed.contains(&date("2026-03-02")));
        assert!(closed.contains(&date("2026-03-09")));
    }

    #[test]
    fn test_closed_dates_includes_sundays_too() {
        let hours = weekly_closed_monday();
        let closed = closed_dates(Some(&hours), date("2026-03-02"), 7);
        assert!(closed.contains(&date("2026-03-08"))); // Sunday
        assert_eq!(closed.len(), 2); // one Monday + one Sunday
    }

    #[test]
    fn test_closed_dates_all_day_unrestricted() {
        let hours = hours_json(r#"{"allDay": true, "schedule": {"monday": {"closed": true}}}"#);
        assert!(closed_dates(Some(&hours), date("2026-03-02"), 90).is_empty());
    }

    #[test]
    fn test_closed_dates_no_schedule_unrestricted() {
        assert!(closed_dates(None, date("2026-03-02"), 90).is_empty());
    }

    #[test]
    fn test_closed_dates_default_range_covers_every_monday() {
        let hours = weekly_closed_monday();
        let from = date("2026-03-02");
        let closed = closed_dates(Some(&hours), from, DEFAULT_RANGE_DAYS);
        for offset in 0..DEFAULT_RANGE_DAYS {
            let d = from + Duration::days(offset);
            if d.weekday() == Weekday::Mon {
                assert!(closed.contains(&d), "missing Monday {}", d);
            }
        }
    }

    #[test]
    fn test_closed_dates_zero_range() {
        let hours = weekly_closed_monday();
        assert!(closed_dates(Some(&hours), date("2026-03-02"), 0).is_empty());
    }

    // ── open_window ──

    #[test]
    fn test_open_window_regular_day() {
        let hours = weekly_closed_monday();
        let window = open_window(Some(&hours), date("2026-03-03")); // Tuesday
        assert_eq!(
            window,
            Some((parse_time("09:00").unwrap(), parse_time("18:00").unwrap()))
        );
    }

    #[test]
    fn test_open_window_closed_day() {
        let hours = weekly_closed_monday();
        assert_eq!(open_window(Some(&hours), date("2026-03-02")), None); // Monday
    }

    #[test]
    fn test_open_window_all_day() {
        let hours = hours_json(r#"{"allDay": true}"#);
        let (open, close) = open_window(Some(&hours), date("2026-03-02")).unwrap();
        assert_eq!(fmt_time(open), "00:00");
        assert_eq!(fmt_time(close), "23:59");
    }

    #[test]
    fn test_open_window_missing_entry_fails_open() {
        let hours = hours_json(r#"{"schedule": {"monday": {"closed": true}}}"#);
        let window = open_window(Some(&hours), date("2026-03-03")); // Tuesday, no entry
        assert_eq!(window, Some(full_day()));
    }

    #[test]
    fn test_open_window_inverted_times_fail_open() {
        let hours =
            hours_json(r#"{"schedule": {"tuesday": {"open": "18:00", "close": "09:00"}}}"#);
        assert_eq!(open_window(Some(&hours), date("2026-03-03")), Some(full_day()));
    }

    #[test]
    fn test_open_window_garbage_times_fail_open() {
        let hours = hours_json(r#"{"schedule": {"tuesday": {"open": "dawn", "close": "dusk"}}}"#);
        assert_eq!(open_window(Some(&hours), date("2026-03-03")), Some(full_day()));
    }

    // ── wire format ──

    #[test]
    fn test_date_round_trip() {
        let d = date("2026-02-28");
        assert_eq!(parse_date(&fmt_date(d)), Some(d));
    }

    #[test]
    fn test_time_round_trip() {
        let t = parse_time("13:30").unwrap();
        assert_eq!(parse_time(&fmt_time(t)), Some(t));
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert!(parse_date("28-02-2026").is_none());
        assert!(parse_date("2026-13-01").is_none());
        assert!(parse_date("").is_none());
    }
}
