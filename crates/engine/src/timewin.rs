//! Natural-language time windows.
//!
//! Stored timestamps are UTC seconds; user-facing relative ranges ("yesterday",
//! "last week", "3 days ago") are resolved through the configured user
//! timezone at query time, then converted back to a UTC `timestamp_unix`
//! range.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub struct TimeWindow {
    pub start_unix: i64,
    pub end_unix: i64,
    pub label: String,
}

impl TimeWindow {
    pub fn contains(&self, unix: i64) -> bool {
        unix >= self.start_unix && unix < self.end_unix
    }
}

/// Resolve a symbolic recency name (the `recency` search filter).
pub fn symbolic_window(name: &str, now: DateTime<Utc>, tz: Tz) -> Option<TimeWindow> {
    match name {
        "today" => day_window(now, tz, 0, "today"),
        "yesterday" => day_window(now, tz, 1, "yesterday"),
        "last_week" => Some(relative_window(now, Duration::days(7), "last_week")),
        "last_month" => Some(relative_window(now, Duration::days(30), "last_month")),
        "recent" => Some(relative_window(now, Duration::days(7), "recent")),
        _ => None,
    }
}

pub fn symbolic_window_names() -> &'static [&'static str] {
    &["today", "yesterday", "last_week", "last_month", "recent"]
}

/// Find a natural-language time expression inside `query`.  Returns the
/// resolved window and the query with the expression removed, or `None` when
/// no expression is present.
pub fn extract_window(query: &str, now: DateTime<Utc>, tz: Tz) -> Option<(TimeWindow, String)> {
    let lower = query.to_lowercase();

    // "<n> hours/days/weeks ago" — a window around that point up to now.
    let ago = Regex::new(r"\b(\d+)\s+(minute|hour|day|week)s?\s+ago\b").expect("static");
    if let Some(caps) = ago.captures(&lower) {
        let n: i64 = caps[1].parse().ok()?;
        let span = unit_duration(&caps[2], n)?;
        let window = relative_window(now, span, caps.get(0).map(|m| m.as_str()).unwrap_or("ago"));
        return Some((window, strip_match(query, &caps[0])));
    }

    // "last/past <n> hours/days/weeks"
    let span_re =
        Regex::new(r"\b(?:in the |the )?(?:last|past)\s+(\d+)\s+(minute|hour|day|week)s?\b")
            .expect("static");
    if let Some(caps) = span_re.captures(&lower) {
        let n: i64 = caps[1].parse().ok()?;
        let span = unit_duration(&caps[2], n)?;
        let window = relative_window(now, span, caps.get(0).map(|m| m.as_str()).unwrap_or("span"));
        return Some((window, strip_match(query, &caps[0])));
    }

    let fixed: &[(&str, fn(DateTime<Utc>, Tz) -> Option<TimeWindow>)] = &[
        ("this morning", |now, tz| part_of_day(now, tz, 0, 5, 12, "this morning")),
        ("last night", |now, tz| part_of_day(now, tz, 1, 18, 29, "last night")),
        ("yesterday", |now, tz| day_window(now, tz, 1, "yesterday")),
        ("today", |now, tz| day_window(now, tz, 0, "today")),
        ("this week", |now, tz| week_window(now, tz, 0)),
        ("last week", |now, tz| week_window(now, tz, 1)),
        ("this month", |now, tz| month_window(now, tz, 0)),
        ("last month", |now, tz| month_window(now, tz, 1)),
        ("recently", |now, _| Some(relative_window(now, Duration::days(7), "recently"))),
        ("recent", |now, _| Some(relative_window(now, Duration::days(7), "recent"))),
    ];
    for (phrase, build) in fixed {
        if lower.contains(phrase) {
            let window = build(now, tz)?;
            return Some((window, strip_match(query, phrase)));
        }
    }

    None
}

fn strip_match(query: &str, matched: &str) -> String {
    let lower = query.to_lowercase();
    let Some(pos) = lower.find(matched) else {
        return query.trim().to_string();
    };
    // Lowercasing can shift byte offsets on non-ASCII text; keep the query
    // intact rather than slicing off a char boundary.
    if !query.is_char_boundary(pos)
        || pos + matched.len() > query.len()
        || !query.is_char_boundary(pos + matched.len())
    {
        return query.trim().to_string();
    }
    let mut remaining = String::new();
    remaining.push_str(&query[..pos]);
    remaining.push_str(&query[pos + matched.len()..]);
    remaining
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
}

fn unit_duration(unit: &str, n: i64) -> Option<Duration> {
    match unit {
        "minute" => Some(Duration::minutes(n)),
        "hour" => Some(Duration::hours(n)),
        "day" => Some(Duration::days(n)),
        "week" => Some(Duration::weeks(n)),
        _ => None,
    }
}

fn relative_window(now: DateTime<Utc>, span: Duration, label: &str) -> TimeWindow {
    TimeWindow {
        start_unix: (now - span).timestamp(),
        end_unix: now.timestamp() + 1,
        label: label.to_string(),
    }
}

fn local_midnight(tz: Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn day_window(now: DateTime<Utc>, tz: Tz, days_back: u32, label: &str) -> Option<TimeWindow> {
    let local_today = now.with_timezone(&tz).date_naive();
    let date = local_today - Duration::days(i64::from(days_back));
    let start = local_midnight(tz, date)?;
    let end = local_midnight(tz, date + Duration::days(1))?;
    Some(TimeWindow {
        start_unix: start.timestamp(),
        end_unix: end.timestamp(),
        label: label.to_string(),
    })
}

/// A clock-hour slice of a day; hours past 24 roll into the next day, which
/// is how "last night" covers 18:00 through 05:00.
fn part_of_day(
    now: DateTime<Utc>,
    tz: Tz,
    days_back: u32,
    start_hour: i64,
    end_hour: i64,
    label: &str,
) -> Option<TimeWindow> {
    let local_today = now.with_timezone(&tz).date_naive();
    let date = local_today - Duration::days(i64::from(days_back));
    let midnight = local_midnight(tz, date)?;
    Some(TimeWindow {
        start_unix: (midnight + Duration::hours(start_hour)).timestamp(),
        end_unix: (midnight + Duration::hours(end_hour)).timestamp(),
        label: label.to_string(),
    })
}

fn week_window(now: DateTime<Utc>, tz: Tz, weeks_back: u32) -> Option<TimeWindow> {
    let local_today = now.with_timezone(&tz).date_naive();
    let monday = local_today
        - Duration::days(i64::from(local_today.weekday().num_days_from_monday()))
        - Duration::weeks(i64::from(weeks_back));
    let start = local_midnight(tz, monday)?;
    let end = local_midnight(tz, monday + Duration::weeks(1))?;
    Some(TimeWindow {
        start_unix: start.timestamp(),
        end_unix: end.timestamp(),
        label: if weeks_back == 0 { "this week" } else { "last week" }.to_string(),
    })
}

fn month_window(now: DateTime<Utc>, tz: Tz, months_back: u32) -> Option<TimeWindow> {
    let local_today = now.with_timezone(&tz).date_naive();
    let (mut year, mut month) = (local_today.year(), local_today.month());
    for _ in 0..months_back {
        if month == 1 {
            year -= 1;
            month = 12;
        } else {
            month -= 1;
        }
    }
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next_first = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let start = local_midnight(tz, first)?;
    let end = local_midnight(tz, next_first)?;
    Some(TimeWindow {
        start_unix: start.timestamp(),
        end_unix: end.timestamp(),
        label: if months_back == 0 { "this month" } else { "last month" }.to_string(),
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon_utc() -> DateTime<Utc> {
        // A Wednesday.
        Utc.with_ymd_and_hms(2025, 6, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn yesterday_is_one_full_local_day() {
        let tz: Tz = "UTC".parse().unwrap();
        let (window, rest) = extract_window("nginx fix yesterday", noon_utc(), tz).unwrap();
        assert_eq!(rest, "nginx fix");
        assert_eq!(window.end_unix - window.start_unix, 86_400);
        assert!(window.contains(Utc.with_ymd_and_hms(2025, 6, 3, 15, 0, 0).unwrap().timestamp()));
        assert!(!window.contains(noon_utc().timestamp()));
    }

    #[test]
    fn timezone_shifts_day_boundaries() {
        let tz: Tz = "America/Los_Angeles".parse().unwrap();
        let (window, _) = extract_window("yesterday", noon_utc(), tz).unwrap();
        // 2025-06-03 local midnight PDT = 07:00 UTC.
        assert_eq!(
            window.start_unix,
            Utc.with_ymd_and_hms(2025, 6, 3, 7, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn n_days_ago_spans_back_from_now() {
        let tz: Tz = "UTC".parse().unwrap();
        let (window, rest) = extract_window("the auth bug 3 days ago", noon_utc(), tz).unwrap();
        assert_eq!(rest, "the auth bug");
        assert_eq!(window.start_unix, (noon_utc() - Duration::days(3)).timestamp());
    }

    #[test]
    fn last_n_hours_is_supported() {
        let tz: Tz = "UTC".parse().unwrap();
        let (window, rest) = extract_window("errors in the last 6 hours", noon_utc(), tz).unwrap();
        assert_eq!(rest, "errors");
        assert_eq!(window.start_unix, (noon_utc() - Duration::hours(6)).timestamp());
    }

    #[test]
    fn this_week_starts_on_monday() {
        let tz: Tz = "UTC".parse().unwrap();
        let (window, _) = extract_window("this week", noon_utc(), tz).unwrap();
        assert_eq!(
            window.start_unix,
            Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn last_month_covers_the_previous_calendar_month() {
        let tz: Tz = "UTC".parse().unwrap();
        let (window, _) = extract_window("last month", noon_utc(), tz).unwrap();
        assert_eq!(
            window.start_unix,
            Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap().timestamp()
        );
        assert_eq!(
            window.end_unix,
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn plain_queries_have_no_window() {
        let tz: Tz = "UTC".parse().unwrap();
        assert!(extract_window("how to configure nginx", noon_utc(), tz).is_none());
    }

    #[test]
    fn symbolic_names_resolve() {
        let tz: Tz = "UTC".parse().unwrap();
        for name in symbolic_window_names() {
            assert!(symbolic_window(name, noon_utc(), tz).is_some(), "{name}");
        }
        assert!(symbolic_window("fortnight", noon_utc(), tz).is_none());
    }
}
