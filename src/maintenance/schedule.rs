/*!
 * Maintenance Schedules
 *
 * Calendar rules for recurring host tasks. All wall-clock rules are evaluated
 * in UTC. `next_after` always returns an instant strictly later than its
 * input, so a task that has just run is never immediately due again.
 */

use crate::core::errors::{OrchestratorError, OrchestratorResult};
use crate::core::types::TimestampMs;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Duration, OffsetDateTime, Time, Weekday};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Day {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Day {
    fn weekday(self) -> Weekday {
        match self {
            Day::Monday => Weekday::Monday,
            Day::Tuesday => Weekday::Tuesday,
            Day::Wednesday => Weekday::Wednesday,
            Day::Thursday => Weekday::Thursday,
            Day::Friday => Weekday::Friday,
            Day::Saturday => Weekday::Saturday,
            Day::Sunday => Weekday::Sunday,
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let day = match raw.to_ascii_lowercase().as_str() {
            "monday" | "mon" => Day::Monday,
            "tuesday" | "tue" => Day::Tuesday,
            "wednesday" | "wed" => Day::Wednesday,
            "thursday" | "thu" => Day::Thursday,
            "friday" | "fri" => Day::Friday,
            "saturday" | "sat" => Day::Saturday,
            "sunday" | "sun" => Day::Sunday,
            _ => return None,
        };
        Some(day)
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Day::Monday => "monday",
            Day::Tuesday => "tuesday",
            Day::Wednesday => "wednesday",
            Day::Thursday => "thursday",
            Day::Friday => "friday",
            Day::Saturday => "saturday",
            Day::Sunday => "sunday",
        };
        f.write_str(name)
    }
}

/// When a maintenance task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Every N minutes, counted from the previous run
    Interval { minutes: u32 },
    /// At minute M of every hour
    Hourly { minute: u8 },
    Daily { hour: u8, minute: u8 },
    Weekly { day: Day, hour: u8, minute: u8 },
}

impl Schedule {
    /// Parse the `(kind, value)` pair used in task files and on the command
    /// line: `interval 60`, `hourly 15`, `daily 02:00`, `weekly sunday 04:00`.
    pub fn parse(kind: &str, value: &str) -> OrchestratorResult<Self> {
        let value = value.trim();
        let invalid = || {
            OrchestratorError::ConfigInvalid(format!("invalid {} schedule '{}'", kind, value))
        };
        let schedule = match kind.to_ascii_lowercase().as_str() {
            "interval" => Schedule::Interval {
                minutes: value.parse().map_err(|_| invalid())?,
            },
            "hourly" => Schedule::Hourly {
                minute: value.trim_start_matches(':').parse().map_err(|_| invalid())?,
            },
            "daily" => {
                let (hour, minute) = parse_clock(value).ok_or_else(invalid)?;
                Schedule::Daily { hour, minute }
            }
            "weekly" => {
                let (day, clock) = value.split_once(char::is_whitespace).ok_or_else(invalid)?;
                let day = Day::parse(day).ok_or_else(invalid)?;
                let (hour, minute) = parse_clock(clock.trim()).ok_or_else(invalid)?;
                Schedule::Weekly { day, hour, minute }
            }
            other => {
                return Err(OrchestratorError::ConfigInvalid(format!(
                    "unknown schedule kind '{}'",
                    other
                )))
            }
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        let ok = match *self {
            Schedule::Interval { minutes } => minutes > 0,
            Schedule::Hourly { minute } => minute < 60,
            Schedule::Daily { hour, minute } | Schedule::Weekly { hour, minute, .. } => {
                hour < 24 && minute < 60
            }
        };
        if ok {
            Ok(())
        } else {
            Err(OrchestratorError::ConfigInvalid(format!(
                "schedule out of range: {}",
                self
            )))
        }
    }

    /// First run time strictly after `now`
    pub fn next_after(&self, now: TimestampMs) -> TimestampMs {
        let now_dt = to_datetime(now);
        let next = match *self {
            Schedule::Interval { minutes } => {
                return now + u64::from(minutes.max(1)) * 60_000;
            }
            Schedule::Hourly { minute } => {
                later_of(at_clock(now_dt, now_dt.hour(), minute), now_dt, Duration::HOUR)
            }
            Schedule::Daily { hour, minute } => {
                later_of(at_clock(now_dt, hour, minute), now_dt, Duration::DAY)
            }
            Schedule::Weekly { day, hour, minute } => {
                let today = now_dt.weekday().number_days_from_monday();
                let target = day.weekday().number_days_from_monday();
                let ahead = (7 + target - today) % 7;
                let candidate = at_clock(now_dt, hour, minute) + Duration::days(i64::from(ahead));
                later_of(candidate, now_dt, Duration::WEEK)
            }
        };
        from_datetime(next)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval { minutes } => write!(f, "every {} min", minutes),
            Schedule::Hourly { minute } => write!(f, "hourly at :{:02}", minute),
            Schedule::Daily { hour, minute } => write!(f, "daily at {:02}:{:02} UTC", hour, minute),
            Schedule::Weekly { day, hour, minute } => {
                write!(f, "{} at {:02}:{:02} UTC", day, hour, minute)
            }
        }
    }
}

fn parse_clock(raw: &str) -> Option<(u8, u8)> {
    let (hour, minute) = raw.split_once(':')?;
    Some((hour.parse().ok()?, minute.parse().ok()?))
}

fn later_of(candidate: OffsetDateTime, now: OffsetDateTime, step: Duration) -> OffsetDateTime {
    if candidate > now {
        candidate
    } else {
        candidate + step
    }
}

fn at_clock(day: OffsetDateTime, hour: u8, minute: u8) -> OffsetDateTime {
    match Time::from_hms(hour, minute, 0) {
        Ok(clock) => day.replace_time(clock),
        Err(_) => day,
    }
}

fn to_datetime(ms: TimestampMs) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn from_datetime(dt: OffsetDateTime) -> TimestampMs {
    (dt.unix_timestamp_nanos() / 1_000_000).max(0) as TimestampMs
}
