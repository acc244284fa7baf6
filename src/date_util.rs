use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::{Error, Result};

const SECONDS_PER_DAY: f64 = 60.0 * 60.0 * 24.0;
const SECONDS_PER_MONTH: f64 = SECONDS_PER_DAY * 30.0;

/// A timestamp argument: either already a UTC instant or text still to be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateInput<'a> {
    Timestamp(DateTime<Utc>),
    Text(&'a str),
}

impl From<DateTime<Utc>> for DateInput<'_> {
    fn from(dt: DateTime<Utc>) -> Self {
        DateInput::Timestamp(dt)
    }
}

impl<'a> From<&'a str> for DateInput<'a> {
    fn from(s: &'a str) -> Self {
        DateInput::Text(s)
    }
}

impl<'a> From<&'a String> for DateInput<'a> {
    fn from(s: &'a String) -> Self {
        DateInput::Text(s.as_str())
    }
}

impl DateInput<'_> {
    pub fn to_utc(self) -> Result<DateTime<Utc>> {
        match self {
            DateInput::Timestamp(dt) => Ok(dt),
            DateInput::Text(s) => parse_datetime(s),
        }
    }
}

/// Parse `YYYY-MM-DD`, RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS` (taken as UTC).
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| Error::DateParse(format!("unrecognized date: {s}")))?;
    Ok(start_of_day(date))
}

/// Midnight UTC on the given date.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// First day of the month following `year-month`.
pub fn next_month_start(year: i32, month: u32) -> Option<NaiveDate> {
    if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
}

/// Format as the `YYYY-MM-DD` day string used in range filters.
pub fn format_day(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d").to_string()
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn elapsed_seconds(start: DateInput<'_>, end: DateInput<'_>) -> Result<f64> {
    let start = start.to_utc()?;
    let end = end.to_utc()?;
    Ok((end - start).num_milliseconds() as f64 / 1000.0)
}

/// Months between two instants, using a fixed 30-day month, rounded to 2 places.
///
/// This is a coarse duration, not a calendar month count. `None` when either
/// side is absent.
pub fn elapsed_months<'a, 'b>(
    start: Option<impl Into<DateInput<'a>>>,
    end: Option<impl Into<DateInput<'b>>>,
) -> Result<Option<f64>> {
    let (Some(start), Some(end)) = (start, end) else {
        return Ok(None);
    };
    let secs = elapsed_seconds(start.into(), end.into())?;
    Ok(Some(round2(secs / SECONDS_PER_MONTH)))
}

/// Days between two instants, rounded to 2 places. `None` when either side is absent.
pub fn elapsed_days<'a, 'b>(
    start: Option<impl Into<DateInput<'a>>>,
    end: Option<impl Into<DateInput<'b>>>,
) -> Result<Option<f64>> {
    let (Some(start), Some(end)) = (start, end) else {
        return Ok(None);
    };
    let secs = elapsed_seconds(start.into(), end.into())?;
    Ok(Some(round2(secs / SECONDS_PER_DAY)))
}
