use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use regex::Regex;
use serde::{Serialize, Serializer};

use crate::date_util::{format_day, next_month_start, start_of_day, DateInput};
use crate::error::{Error, Result};

static RE_WEEKLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^W(?:-([A-Z]{3}))?$").unwrap());

/// Half-open interval `[from_date, to_date)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    from_date: DateTime<Utc>,
    to_date: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from_date: DateTime<Utc>, to_date: DateTime<Utc>) -> Result<Self> {
        if from_date >= to_date {
            return Err(Error::InvalidWindow(format!(
                "from_date {from_date} must be before to_date {to_date}"
            )));
        }
        Ok(Self { from_date, to_date })
    }

    /// Build a window from string or timestamp inputs.
    pub fn parse<'a, 'b>(
        from_date: impl Into<DateInput<'a>>,
        to_date: impl Into<DateInput<'b>>,
    ) -> Result<Self> {
        Self::new(from_date.into().to_utc()?, to_date.into().to_utc()?)
    }

    pub fn from_date(&self) -> DateTime<Utc> {
        self.from_date
    }

    pub fn to_date(&self) -> DateTime<Utc> {
        self.to_date
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.from_date && instant < self.to_date
    }

    /// Canonical key, e.g. `2022-01-03..2022-01-10`.
    pub fn to_key(&self) -> String {
        format!("{}..{}", format_day(&self.from_date), format_day(&self.to_date))
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

/// Serializes flat as `from_date` / `to_date` day strings.
impl Serialize for TimeWindow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("TimeWindow", 2)?;
        s.serialize_field("from_date", &format_day(&self.from_date))?;
        s.serialize_field("to_date", &format_day(&self.to_date))?;
        s.end()
    }
}

/// Bucket granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly(Weekday),
    MonthStart,
}

impl Default for Frequency {
    fn default() -> Self {
        Frequency::Weekly(Weekday::Mon)
    }
}

impl Frequency {
    /// Parse a frequency alias.
    ///
    /// Supported formats:
    /// - `D`: every day
    /// - `W`: every week, anchored on Sunday
    /// - `W-MON` to `W-SUN`: every week, anchored on the given weekday
    /// - `MS`: every month start
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let upper = s.to_uppercase();
        match upper.as_str() {
            "D" => return Ok(Frequency::Daily),
            "MS" => return Ok(Frequency::MonthStart),
            _ => {}
        }

        if let Some(caps) = RE_WEEKLY.captures(&upper) {
            return match caps.get(1) {
                None => Ok(Frequency::Weekly(Weekday::Sun)),
                Some(day) => day
                    .as_str()
                    .parse::<Weekday>()
                    .map(Frequency::Weekly)
                    .map_err(|_| Error::Config(format!("unrecognized weekday in frequency: {s}"))),
            };
        }

        Err(Error::Config(format!("unrecognized frequency: {s}")))
    }

    pub fn to_key(&self) -> String {
        match self {
            Frequency::Daily => "D".to_string(),
            Frequency::Weekly(day) => format!("W-{}", day.to_string().to_uppercase()),
            Frequency::MonthStart => "MS".to_string(),
        }
    }

    /// The first anchor at or after `instant`.
    fn first_anchor(&self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let day = instant.date_naive();
        let midnight = start_of_day(day);
        let on_or_after = if midnight < instant {
            day.succ_opt()?
        } else {
            day
        };
        match self {
            Frequency::Daily => Some(start_of_day(on_or_after)),
            Frequency::Weekly(anchor) => {
                let ahead = (7 + anchor.num_days_from_monday() as i64
                    - on_or_after.weekday().num_days_from_monday() as i64)
                    % 7;
                Some(start_of_day(on_or_after + Duration::days(ahead)))
            }
            Frequency::MonthStart => {
                if on_or_after.day() == 1 {
                    Some(start_of_day(on_or_after))
                } else {
                    next_month_start(on_or_after.year(), on_or_after.month()).map(start_of_day)
                }
            }
        }
    }

    fn next_anchor(&self, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Frequency::Daily => Some(anchor + Duration::days(1)),
            Frequency::Weekly(_) => Some(anchor + Duration::weeks(1)),
            Frequency::MonthStart => {
                let day = anchor.date_naive();
                next_month_start(day.year(), day.month()).map(start_of_day)
            }
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

/// Every anchor instant in the closed range `[from_date, to_date]`.
pub fn anchors(window: &TimeWindow, frequency: Frequency) -> Vec<DateTime<Utc>> {
    let mut out = Vec::new();
    let mut cursor = frequency.first_anchor(window.from_date);
    while let Some(anchor) = cursor {
        if anchor > window.to_date {
            break;
        }
        out.push(anchor);
        cursor = frequency.next_anchor(anchor);
    }
    out
}

/// Split `window` into contiguous buckets between consecutive anchors.
///
/// The first bucket starts at the first anchor at or after `from_date`, the
/// last ends at the last anchor at or before `to_date`. Fewer than two anchors
/// yield no buckets. Calling again with the same inputs yields the same list.
pub fn bucketize(window: &TimeWindow, frequency: Frequency) -> Vec<TimeWindow> {
    anchors(window, frequency)
        .windows(2)
        .map(|pair| TimeWindow {
            from_date: pair[0],
            to_date: pair[1],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_window_rejects_empty_or_inverted() {
        assert!(TimeWindow::new(day(2022, 1, 3), day(2022, 1, 3)).is_err());
        assert!(TimeWindow::new(day(2022, 1, 10), day(2022, 1, 3)).is_err());
        assert!(TimeWindow::parse("2022-01-03", "2022-01-10").is_ok());
    }

    #[test]
    fn test_window_half_open() {
        let w = TimeWindow::parse("2022-01-03", "2022-01-10").unwrap();
        assert!(w.contains(day(2022, 1, 3)));
        assert!(w.contains(day(2022, 1, 9)));
        assert!(!w.contains(day(2022, 1, 10)));
        assert_eq!(w.to_key(), "2022-01-03..2022-01-10");
    }

    #[test]
    fn test_window_serializes_flat_days() {
        let w = TimeWindow::parse("2022-01-03", "2022-01-10").unwrap();
        let v = serde_json::to_value(w).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"from_date": "2022-01-03", "to_date": "2022-01-10"})
        );
    }

    #[test]
    fn test_parse_frequency() {
        assert_eq!(Frequency::parse("D").unwrap(), Frequency::Daily);
        assert_eq!(Frequency::parse("MS").unwrap(), Frequency::MonthStart);
        assert_eq!(Frequency::parse("W").unwrap(), Frequency::Weekly(Weekday::Sun));
        assert_eq!(
            Frequency::parse("W-MON").unwrap(),
            Frequency::Weekly(Weekday::Mon)
        );
        assert_eq!(
            Frequency::parse("w-fri").unwrap(),
            Frequency::Weekly(Weekday::Fri)
        );
        assert!(matches!(Frequency::parse("W-XYZ"), Err(Error::Config(_))));
        assert!(matches!(Frequency::parse("Q"), Err(Error::Config(_))));
    }

    #[test]
    fn test_frequency_key_round_trip() {
        for f in [
            Frequency::Daily,
            Frequency::MonthStart,
            Frequency::Weekly(Weekday::Mon),
            Frequency::Weekly(Weekday::Sun),
        ] {
            assert_eq!(Frequency::parse(&f.to_key()).unwrap(), f);
        }
    }

    #[test]
    fn test_two_weekly_buckets() {
        let w = TimeWindow::parse("2022-01-03", "2022-01-17").unwrap();
        let buckets = bucketize(&w, Frequency::Weekly(Weekday::Mon));
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].to_key(), "2022-01-03..2022-01-10");
        assert_eq!(buckets[1].to_key(), "2022-01-10..2022-01-17");
    }

    #[test]
    fn test_anchors_include_both_ends() {
        let w = TimeWindow::parse("2022-01-03", "2022-01-17").unwrap();
        let a = anchors(&w, Frequency::Weekly(Weekday::Mon));
        assert_eq!(a, vec![day(2022, 1, 3), day(2022, 1, 10), day(2022, 1, 17)]);
    }

    #[test]
    fn test_unaligned_window_stays_inside() {
        // Wednesday to Saturday, two Mondays in between
        let w = TimeWindow::parse("2022-01-05", "2022-01-22").unwrap();
        let buckets = bucketize(&w, Frequency::Weekly(Weekday::Mon));
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].from_date(), day(2022, 1, 10));
        assert_eq!(buckets[0].to_date(), day(2022, 1, 17));
        assert!(buckets[0].from_date() >= w.from_date());
        assert!(buckets[0].to_date() <= w.to_date());
    }

    #[test]
    fn test_intraday_start_moves_to_next_anchor() {
        let w = TimeWindow::new(
            Utc.with_ymd_and_hms(2022, 1, 3, 9, 0, 0).unwrap(),
            day(2022, 1, 6),
        )
        .unwrap();
        let a = anchors(&w, Frequency::Daily);
        assert_eq!(a, vec![day(2022, 1, 4), day(2022, 1, 5), day(2022, 1, 6)]);
    }

    #[test]
    fn test_too_short_window_has_no_buckets() {
        let w = TimeWindow::parse("2022-01-04", "2022-01-09").unwrap();
        assert!(bucketize(&w, Frequency::Weekly(Weekday::Mon)).is_empty());
    }

    #[test]
    fn test_buckets_contiguous_and_covering() {
        let cases = [
            ("2021-01-04", "2022-01-03", Frequency::Weekly(Weekday::Mon)),
            ("2021-03-01", "2021-03-31", Frequency::Daily),
            ("2020-01-01", "2022-01-01", Frequency::MonthStart),
            ("2021-06-06", "2021-09-26", Frequency::Weekly(Weekday::Sun)),
        ];
        for (from, to, freq) in cases {
            let w = TimeWindow::parse(from, to).unwrap();
            let buckets = bucketize(&w, freq);
            assert!(!buckets.is_empty(), "{from}..{to} {freq}");
            assert_eq!(buckets.first().unwrap().from_date(), w.from_date());
            assert_eq!(buckets.last().unwrap().to_date(), w.to_date());
            for pair in buckets.windows(2) {
                assert_eq!(pair[0].to_date(), pair[1].from_date());
                assert!(pair[0].from_date() < pair[0].to_date());
            }
            // restartable: same inputs, same sequence
            assert_eq!(buckets, bucketize(&w, freq));
        }
    }

    #[test]
    fn test_month_start_buckets() {
        let w = TimeWindow::parse("2022-01-15", "2022-04-01").unwrap();
        let buckets = bucketize(&w, Frequency::MonthStart);
        let keys: Vec<String> = buckets.iter().map(|b| b.to_key()).collect();
        assert_eq!(
            keys,
            vec!["2022-02-01..2022-03-01", "2022-03-01..2022-04-01"]
        );
    }
}
