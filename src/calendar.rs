use chrono::{Datelike, Duration, NaiveDate};
use std::collections::HashSet;

/// Day-of-week convention used throughout the timetable: 0 = Sunday through
/// 6 = Saturday.
pub const SUNDAY: u32 = 0;
pub const SATURDAY: u32 = 6;

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

pub fn day_of_week(date: NaiveDate) -> u32 {
    date.weekday().num_days_from_sunday()
}

/// Enumerate the calendar dates in `[start, end]` that count as held
/// sessions: the weekday must be in `scheduled_weekdays`, must not be a
/// weekend, and the date must not be in `holidays` (YYYY-MM-DD strings).
/// An inverted range yields no dates.
pub fn session_dates(
    start: NaiveDate,
    end: NaiveDate,
    scheduled_weekdays: &HashSet<u32>,
    holidays: &HashSet<String>,
) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    if start > end {
        return out;
    }
    let mut d = start;
    while d <= end {
        let dow = day_of_week(d);
        if dow != SUNDAY
            && dow != SATURDAY
            && scheduled_weekdays.contains(&dow)
            && !holidays.contains(&d.format("%Y-%m-%d").to_string())
        {
            out.push(d);
        }
        d += Duration::days(1);
    }
    out
}

pub fn session_day_count(
    start: NaiveDate,
    end: NaiveDate,
    scheduled_weekdays: &HashSet<u32>,
    holidays: &HashSet<String>,
) -> usize {
    session_dates(start, end, scheduled_weekdays, holidays).len()
}
