//! Trigger rules: fixed intervals and cron expressions.
//!
//! A [`Schedule`] is parsed once from its textual form and is immutable
//! afterwards. [`Schedule::next`] is a pure function of its input instant and
//! the evaluation time zone.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use croner::Cron;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

const EVERY_PREFIX: &str = "@every";

/// Defines when a job should next fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Schedule {
    /// Fire every fixed duration, independent of wall-clock time.
    Interval(Duration),

    /// Fire at wall-clock instants matching a cron expression.
    Cron(CronSchedule),
}

/// A parsed cron expression together with its source text.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    cron: Cron,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let cron = Cron::new(expr)
            .with_seconds_optional()
            .parse()
            .map_err(|e| SchedulerError::InvalidSchedule(format!("{expr}: {e}")))?;
        Ok(Self {
            expr: expr.to_string(),
            cron,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// Next matching instant strictly after `after`, evaluated in `location`.
    fn next(&self, after: DateTime<Utc>, location: &Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(location);
        self.cron
            .find_next_occurrence(&local, false)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl Schedule {
    /// Parse `@every <duration>` or a cron expression.
    ///
    /// The duration uses Go syntax (`90s`, `1h30m`, `1.5s`, `250ms`). Anything
    /// that is not an `@every` form is handed to the cron parser, so an
    /// unrecognised string is reported as a cron error.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SchedulerError::InvalidSchedule(
                "empty schedule".to_string(),
            ));
        }

        if let Some(rest) = input.strip_prefix(EVERY_PREFIX) {
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                let interval = parse_go_duration(rest.trim())?;
                return Ok(Schedule::Interval(interval));
            }
        }

        CronSchedule::parse(input).map(Schedule::Cron)
    }

    /// Parse a schedule known to be valid at compile time.
    ///
    /// # Panics
    ///
    /// Panics if `input` does not parse. Use only for static initialisation.
    pub fn must_parse(input: &str) -> Self {
        match Self::parse(input) {
            Ok(schedule) => schedule,
            Err(e) => panic!("invalid static schedule {input:?}: {e}"),
        }
    }

    /// The next trigger instant strictly after `after`.
    ///
    /// Returns `None` when the schedule never fires again (a cron expression
    /// with no future match).
    pub fn next(&self, after: DateTime<Utc>, location: &Tz) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval(every) => {
                let step = chrono::Duration::from_std(*every).ok()?;
                after.checked_add_signed(step)
            }
            Schedule::Cron(cron) => cron.next(after, location),
        }
    }
}

impl FromStr for Schedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Schedule {
    type Error = SchedulerError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> Self {
        schedule.to_string()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval(every) => write!(f, "{EVERY_PREFIX} {}", format_go_duration(*every)),
            Schedule::Cron(cron) => f.write_str(cron.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Go duration syntax
// ---------------------------------------------------------------------------

/// Parse a Go-style duration such as `1h30m`, `1.5s` or `250ms`.
///
/// Only strictly positive durations are accepted; an interval must move time
/// forward.
pub fn parse_go_duration(input: &str) -> Result<Duration> {
    let invalid = |reason: &str| SchedulerError::InvalidSchedule(format!("{input:?}: {reason}"));

    if input.is_empty() {
        return Err(invalid("missing duration"));
    }

    let mut total_nanos: u128 = 0;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid("expected a number"));
        }
        let (number, tail) = rest.split_at(number_len);

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };

        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid("expected a number"));
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid("number out of range"))?
        };
        let mut frac_nanos: u128 = 0;
        let mut scale = unit_nanos;
        for digit in frac.chars() {
            let digit = digit.to_digit(10).ok_or_else(|| invalid("bad fraction"))? as u128;
            scale /= 10;
            frac_nanos += digit * scale;
        }

        total_nanos = whole
            .checked_mul(unit_nanos)
            .and_then(|n| n.checked_add(frac_nanos))
            .and_then(|n| n.checked_add(total_nanos))
            .ok_or_else(|| invalid("duration overflow"))?;
        rest = tail;
    }

    if total_nanos == 0 {
        return Err(invalid("interval must be positive"));
    }
    let secs = u64::try_from(total_nanos / 1_000_000_000).map_err(|_| invalid("duration overflow"))?;
    Ok(Duration::new(secs, (total_nanos % 1_000_000_000) as u32))
}

fn format_go_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else if d.subsec_nanos() % 1_000_000 == 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}ns", d.as_nanos())
    }
}
