//! Cron schedules bound to a timezone.

use ::cron::Schedule as CronExpr;
use cadence_core::pipeline::ScheduleSpec;
use cadence_core::{Error, Result};
use chrono::{DateTime, Duration, DurationRound, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

/// A parsed cron expression evaluated in an IANA timezone.
///
/// Five-field expressions use the usual `minute hour day month weekday`
/// layout with Sunday as `0` or `7`. Six and seven field expressions are
/// passed through with a leading seconds field.
#[derive(Clone)]
pub struct Schedule {
    expression: String,
    cron: CronExpr,
    timezone: Tz,
}

impl Schedule {
    pub fn new(expression: &str, timezone: &str) -> Result<Self> {
        let timezone = timezone.parse::<Tz>().map_err(|_| {
            Error::Configuration(format!("unknown timezone {:?} for {:?}", timezone, expression))
        })?;
        let cron = CronExpr::from_str(&normalize(expression)?).map_err(|e| Error::Cron {
            expression: expression.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expression: expression.trim().to_string(),
            cron,
            timezone,
        })
    }

    pub fn from_spec(spec: &ScheduleSpec) -> Result<Self> {
        Self::new(&spec.cron, &spec.timezone)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Occurrences at or after `from`, in ascending order.
    pub fn upcoming(&self, from: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let start = (from - Duration::seconds(1)).with_timezone(&self.timezone);
        self.cron
            .after(&start)
            .map(|at| at.with_timezone(&Utc))
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }

    /// Whether the schedule fires at exactly `at`.
    pub fn includes(&self, at: DateTime<Utc>) -> bool {
        self.upcoming(at).next() == Some(at)
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("expression", &self.expression)
            .field("timezone", &self.timezone.name())
            .finish()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression && self.timezone == other.timezone
    }
}

/// Wall clock that advances with the tokio timer from a fixed origin.
///
/// Sleeps and the times they are computed from stay consistent, including
/// under a paused test runtime.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: DateTime<Utc>,
    started: Instant,
}

impl Clock {
    /// Clock anchored at the current system time.
    pub fn system() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.origin + Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| Duration::zero())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

/// Start of the minute containing `at`.
pub fn minute_floor(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::minutes(1)).unwrap_or(at)
}

/// Rewrite a five-field expression into the seconds-first form.
fn normalize(expression: &str) -> Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let weekday = weekday_names(fields[4]);
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], weekday
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(Error::Cron {
            expression: expression.to_string(),
            message: format!("expected 5 to 7 fields, got {}", n),
        }),
    }
}

const WEEKDAYS: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Map numeric weekdays (0 or 7 is Sunday) to names, keeping step values.
fn weekday_names(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = range
                .split('-')
                .map(|part| match part.parse::<usize>() {
                    Ok(n) if n < WEEKDAYS.len() => WEEKDAYS[n].to_string(),
                    _ => part.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_five_field_next_after() {
        let schedule = Schedule::new("*/5 * * * *", "UTC").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 1, 1, 10, 2, 30)),
            Some(at(2024, 1, 1, 10, 5, 0))
        );
        assert_eq!(
            schedule.next_after(at(2024, 1, 1, 10, 5, 0)),
            Some(at(2024, 1, 1, 10, 10, 0))
        );
    }

    #[test]
    fn test_upcoming_is_inclusive() {
        let schedule = Schedule::new("* * * * *", "UTC").unwrap();
        let from = at(2024, 1, 1, 10, 2, 0);
        let times: Vec<_> = schedule.upcoming(from).take(2).collect();
        assert_eq!(times, vec![from, at(2024, 1, 1, 10, 3, 0)]);
        assert!(schedule.includes(from));
    }

    #[test]
    fn test_numeric_weekday_follows_unix_convention() {
        let schedule = Schedule::new("0 9 * * 1-5", "UTC").unwrap();
        // 2024-01-06 is a Saturday.
        let next = schedule.next_after(at(2024, 1, 6, 0, 0, 0)).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);

        let sunday = Schedule::new("0 0 * * 0", "UTC").unwrap();
        assert_eq!(
            sunday.next_after(at(2024, 1, 1, 0, 0, 0)).unwrap().weekday(),
            Weekday::Sun
        );
    }

    #[test]
    fn test_timezone_shifts_occurrence() {
        let schedule = Schedule::new("0 9 * * *", "Asia/Bangkok").unwrap();
        let next = schedule.next_after(at(2024, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(next.hour(), 2);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(
            Schedule::new("* * *", "UTC"),
            Err(Error::Cron { .. })
        ));
        assert!(matches!(
            Schedule::new("61 * * * *", "UTC"),
            Err(Error::Cron { .. })
        ));
        assert!(matches!(
            Schedule::new("* * * * *", "Nowhere/City"),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = Clock::starting_at(at(2024, 5, 1, 8, 0, 30));
        tokio::time::advance(std::time::Duration::from_secs(45)).await;
        assert_eq!(clock.now(), at(2024, 5, 1, 8, 1, 15));
        assert_eq!(minute_floor(clock.now()), at(2024, 5, 1, 8, 1, 0));
    }

    #[test]
    fn test_minute_floor() {
        assert_eq!(
            minute_floor(at(2024, 1, 1, 10, 2, 59)),
            at(2024, 1, 1, 10, 2, 0)
        );
    }
}
