use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::util::errors::{Error, Result};

/// First fire time of `schedule` strictly after `after`.
///
/// `schedule` is a 6-field cron expression (`sec min hr dom mon dow`) with
/// `*`, ranges, steps (`0/15`) and lists. Pure; a malformed schedule is an
/// `InvalidSchedule` error for the caller to surface.
pub fn next_after(schedule: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let fields = schedule.split_whitespace().count();
    if fields != 6 {
        return Err(Error::InvalidSchedule(format!(
            "expected 6 fields (sec min hr dom mon dow), got {} in {:?}",
            fields, schedule
        )));
    }

    let parsed = Schedule::from_str(schedule)
        .map_err(|e| Error::InvalidSchedule(format!("{:?}: {}", schedule, e)))?;

    parsed
        .after(&after)
        .next()
        .ok_or_else(|| Error::InvalidSchedule(format!("{:?} never fires", schedule)))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;

    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    #[test]
    fn test_step_field() {
        let now = at("2024-03-01 10:00:07");
        let next = next_after("0/15 * * * * *", now).unwrap();
        assert_eq!(next, at("2024-03-01 10:00:15"));
    }

    #[test]
    fn test_next_is_strictly_after() {
        let tick = at("2024-03-01 10:00:15");
        let next = next_after("0/15 * * * * *", tick).unwrap();
        assert_eq!(next, at("2024-03-01 10:00:30"));
    }

    #[test]
    fn test_daily_schedule() {
        let now = at("2024-03-01 13:30:00");
        let next = next_after("0 0 2 * * *", now).unwrap();
        assert_eq!(next, at("2024-03-02 02:00:00"));
    }

    #[test]
    fn test_list_and_range() {
        let now = at("2024-03-01 10:20:00");
        let next = next_after("0 0,30 9-17 * * *", now).unwrap();
        assert_eq!(next, at("2024-03-01 10:30:00"));
    }

    #[test]
    fn test_monotone_sequence() {
        let mut t = at("2024-03-01 00:00:00");
        for _ in 0..10 {
            let next = next_after("0/15 * * * * *", t).unwrap();
            assert!(next > t);
            t = next;
        }
    }

    #[test]
    fn test_five_fields_rejected() {
        assert!(matches!(
            next_after("* * * * *", Utc::now()),
            Err(Error::InvalidSchedule(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            next_after("every 15 seconds or so", Utc::now()),
            Err(Error::InvalidSchedule(_))
        ));
        assert!(matches!(
            next_after("61 * * * * *", Utc::now()),
            Err(Error::InvalidSchedule(_))
        ));
    }
}
