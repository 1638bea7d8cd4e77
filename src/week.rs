//! Calendar-week arithmetic for weekly stats.
//!
//! Weeks run Monday 00:00:00 to Sunday 23:59:59 UTC and are named `YYYY-W##`
//! using ISO-8601 numbering (Monday first, the first four-day week is week 1).

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

/// One calendar week, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeekWindow {
    pub identifier: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Week that `instant` belongs to, for stats purposes.
///
/// Within `grace` after Monday 00:00 the week that just ended is returned
/// instead of the one just starting, so a job firing around midnight still
/// sees the finished week.
pub fn week_window(instant: DateTime<Utc>, grace: Duration) -> WeekWindow {
    let mut start = monday_of(instant.date_naive())
        .and_time(NaiveTime::MIN)
        .and_utc();

    if instant - start < grace {
        start -= Duration::days(7);
    }

    WeekWindow {
        identifier: week_identifier(start.date_naive()),
        start,
        end: start + Duration::days(7) - Duration::seconds(1),
    }
}

/// `YYYY-W##` for the week containing `date`.
pub fn week_identifier(date: NaiveDate) -> String {
    let week = date.iso_week().week();
    let mut year = date.year();

    // Early-January days can still belong to week 52/53 of the previous year,
    // and late-December days to week 1 of the next.
    if week >= 52 && date.month() == 1 {
        year -= 1;
    } else if week == 1 && date.month() == 12 {
        year += 1;
    }

    format!("{}-W{:02}", year, week)
}

/// Next instant strictly after `now` that is Monday 00:00 UTC plus `delay`.
pub fn next_weekly_run(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let candidate = monday_of(now.date_naive())
        .and_time(NaiveTime::MIN)
        .and_utc()
        + delay;

    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(7)
    }
}

fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}
