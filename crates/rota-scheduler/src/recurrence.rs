use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

use crate::error::{Result, SchedulerError};
use crate::types::Recurrence;

/// How far ahead the search may look before giving up (four years plus a
/// leap day, enough for any Feb 29 rule).
const MAX_SEARCH_DAYS: i64 = 4 * 365 + 1;

const MINUTE: (u32, u32) = (0, 59);
const HOUR: (u32, u32) = (0, 23);
const DAY_OF_MONTH: (u32, u32) = (1, 31);
const MONTH: (u32, u32) = (1, 12);
const DAY_OF_WEEK: (u32, u32) = (0, 7);

/// Check every set field against its cron range.
pub fn validate(rec: &Recurrence) -> Result<()> {
    check("minute", rec.minute, MINUTE)?;
    check("hour", rec.hour, HOUR)?;
    check("day_of_month", rec.day_of_month, DAY_OF_MONTH)?;
    check("month", rec.month, MONTH)?;
    check("day_of_week", rec.day_of_week, DAY_OF_WEEK)?;
    Ok(())
}

fn check(field: &str, value: Option<u32>, (min, max): (u32, u32)) -> Result<()> {
    match value {
        Some(v) if v < min || v > max => Err(SchedulerError::Invalid(format!(
            "{field} must be between {min} and {max}, got {v}"
        ))),
        _ => Ok(()),
    }
}

/// Earliest minute strictly after `after` that satisfies `rec`.
///
/// When both day fields are set a day matches if *either* does, as in
/// classic cron. Fails with `InvalidRecurrence` for out-of-range fields or
/// when nothing matches within the search window (e.g. 31 February).
pub fn next_run(rec: &Recurrence, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    validate(rec).map_err(|e| SchedulerError::InvalidRecurrence(e.to_string()))?;

    // Search starts at the next whole minute.
    let start = after
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(after)
        + Duration::minutes(1);
    let start_date = start.date_naive();
    let start_time = (start.hour(), start.minute());

    for offset in 0..=MAX_SEARCH_DAYS {
        let day = start_date + Duration::days(offset);
        if !day_matches(rec, day) {
            continue;
        }
        let not_before = if offset == 0 { start_time } else { (0, 0) };
        if let Some(time) = earliest_time(rec, not_before) {
            return Ok(Utc.from_utc_datetime(&day.and_time(time)));
        }
    }

    Err(SchedulerError::InvalidRecurrence(format!(
        "no matching time within {MAX_SEARCH_DAYS} days of {after}"
    )))
}

fn day_matches(rec: &Recurrence, day: NaiveDate) -> bool {
    if rec.month.is_some_and(|m| m != day.month()) {
        return false;
    }
    // 7 is an alias for Sunday.
    let dom = rec.day_of_month.map(|d| d == day.day());
    let dow = rec
        .day_of_week
        .map(|d| d % 7 == day.weekday().num_days_from_sunday());
    match (dom, dow) {
        (Some(a), Some(b)) => a || b,
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => true,
    }
}

fn earliest_time(rec: &Recurrence, (min_hour, min_minute): (u32, u32)) -> Option<NaiveTime> {
    let hours = match rec.hour {
        Some(h) => h..=h,
        None => 0..=23,
    };
    for hour in hours.filter(|h| *h >= min_hour) {
        let floor = if hour == min_hour { min_minute } else { 0 };
        let minute = match rec.minute {
            Some(m) if m >= floor => Some(m),
            Some(_) => None,
            None => Some(floor),
        };
        if let Some(minute) = minute {
            return NaiveTime::from_hms_opt(hour, minute, 0);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn daily_at_two_thirty() {
        let rec = Recurrence {
            minute: Some(30),
            hour: Some(2),
            ..Default::default()
        };
        let next = next_run(&rec, at("2012-11-26T10:00:00Z")).unwrap();
        assert_eq!(next, at("2012-11-27T02:30:00Z"));
    }

    #[test]
    fn same_day_when_still_ahead() {
        let rec = Recurrence {
            minute: Some(30),
            hour: Some(12),
            ..Default::default()
        };
        let next = next_run(&rec, at("2012-11-26T10:00:00Z")).unwrap();
        assert_eq!(next, at("2012-11-26T12:30:00Z"));
    }

    #[test]
    fn strictly_after_even_on_exact_match() {
        let rec = Recurrence {
            minute: Some(30),
            hour: Some(2),
            ..Default::default()
        };
        let next = next_run(&rec, at("2012-11-27T02:30:00Z")).unwrap();
        assert_eq!(next, at("2012-11-28T02:30:00Z"));
    }

    #[test]
    fn all_wildcards_is_next_minute() {
        let next = next_run(&Recurrence::default(), at("2012-11-26T10:00:42Z")).unwrap();
        assert_eq!(next, at("2012-11-26T10:01:00Z"));
    }

    #[test]
    fn minute_only_rolls_into_next_hour() {
        let rec = Recurrence {
            minute: Some(15),
            ..Default::default()
        };
        let next = next_run(&rec, at("2012-11-26T10:20:00Z")).unwrap();
        assert_eq!(next, at("2012-11-26T11:15:00Z"));
    }

    #[test]
    fn hour_only_starts_at_minute_zero() {
        let rec = Recurrence {
            hour: Some(5),
            ..Default::default()
        };
        let next = next_run(&rec, at("2012-11-26T10:20:00Z")).unwrap();
        assert_eq!(next, at("2012-11-27T05:00:00Z"));
        let within = next_run(&rec, at("2012-11-27T05:10:00Z")).unwrap();
        assert_eq!(within, at("2012-11-27T05:11:00Z"));
    }

    #[test]
    fn day_of_week_sunday_aliases() {
        // 2012-11-26 is a Monday.
        for dow in [0, 7] {
            let rec = Recurrence {
                minute: Some(0),
                hour: Some(0),
                day_of_week: Some(dow),
                ..Default::default()
            };
            let next = next_run(&rec, at("2012-11-26T10:00:00Z")).unwrap();
            assert_eq!(next, at("2012-12-02T00:00:00Z"));
        }
    }

    #[test]
    fn day_fields_combine_with_or() {
        // 15th of the month OR any Friday; first Friday after Nov 26 2012 is Nov 30.
        let rec = Recurrence {
            minute: Some(0),
            hour: Some(0),
            day_of_month: Some(15),
            day_of_week: Some(5),
            ..Default::default()
        };
        let next = next_run(&rec, at("2012-11-26T10:00:00Z")).unwrap();
        assert_eq!(next, at("2012-11-30T00:00:00Z"));
        let after_friday = next_run(&rec, at("2012-12-08T00:00:00Z")).unwrap();
        assert_eq!(after_friday, at("2012-12-14T00:00:00Z"));
        let fifteenth = next_run(&rec, at("2012-12-14T00:00:00Z")).unwrap();
        assert_eq!(fifteenth, at("2012-12-15T00:00:00Z"));
    }

    #[test]
    fn month_and_day_of_month_are_strict() {
        let rec = Recurrence {
            minute: Some(0),
            hour: Some(12),
            day_of_month: Some(29),
            month: Some(2),
            ..Default::default()
        };
        let next = next_run(&rec, at("2013-03-01T00:00:00Z")).unwrap();
        assert_eq!(next, at("2016-02-29T12:00:00Z"));
    }

    #[test]
    fn impossible_date_fails_instead_of_looping() {
        let rec = Recurrence {
            day_of_month: Some(31),
            month: Some(2),
            ..Default::default()
        };
        let err = next_run(&rec, at("2012-11-26T10:00:00Z")).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRecurrence(_)));
    }

    #[test]
    fn out_of_range_is_invalid_recurrence() {
        let rec = Recurrence {
            minute: Some(60),
            ..Default::default()
        };
        assert!(matches!(
            next_run(&rec, Utc::now()),
            Err(SchedulerError::InvalidRecurrence(_))
        ));
        assert!(matches!(validate(&rec), Err(SchedulerError::Invalid(_))));
    }

    #[test]
    fn result_always_matches_fields() {
        let rec = Recurrence {
            minute: Some(45),
            hour: Some(23),
            day_of_week: Some(3),
            ..Default::default()
        };
        let mut after = at("2012-01-01T00:00:00Z");
        for _ in 0..20 {
            let next = next_run(&rec, after).unwrap();
            assert!(next > after);
            assert_eq!(next.minute(), 45);
            assert_eq!(next.hour(), 23);
            assert_eq!(next.weekday().num_days_from_sunday(), 3);
            after = next;
        }
    }
}
