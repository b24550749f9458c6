//! Schedule expressions.
//!
//! Accepted forms:
//! - `@every <duration>` (`@every 90s`, `@every 1h30m`)
//! - descriptors: `@hourly`, `@daily`/`@midnight`, `@weekly`, `@monthly`, `@yearly`/`@annually`
//! - standard 5-field cron (`*/15 * * * *`) or 6/7-field cron with seconds
//! - `@never`: the job is not scheduled at all

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::source::NEVER_SCHEDULE;
use crate::domain::{format_duration, parse_duration};
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum Kind {
    Every(Duration),
    Cron(Box<cron::Schedule>),
    Never,
}

/// A parsed schedule expression.
#[derive(Debug, Clone)]
pub struct Schedule {
    expr: String,
    kind: Kind,
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

/// Prepend a seconds field to a 5-field expression.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn descriptor(expr: &str) -> Option<&'static str> {
    Some(match expr {
        "@yearly" | "@annually" => "0 0 0 1 1 *",
        "@monthly" => "0 0 0 1 * *",
        "@weekly" => "0 0 0 * * Sun",
        "@daily" | "@midnight" => "0 0 0 * * *",
        "@hourly" => "0 0 * * * *",
        _ => return None,
    })
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(Error::invalid_schedule(expr, "empty expression"));
        }

        if expr == NEVER_SCHEDULE {
            return Ok(Self::never());
        }

        if let Some(rest) = expr.strip_prefix("@every") {
            let interval = parse_duration(rest)
                .map_err(|e| Error::invalid_schedule(expr, e.to_string()))?;
            if interval.is_zero() {
                return Err(Error::invalid_schedule(expr, "interval must be positive"));
            }
            return Ok(Self {
                expr: expr.to_string(),
                kind: Kind::Every(interval),
            });
        }

        let cron_expr = match descriptor(expr) {
            Some(c) => c.to_string(),
            None if expr.starts_with('@') => {
                return Err(Error::invalid_schedule(expr, "unknown descriptor"));
            }
            None => normalize_cron(expr),
        };

        let schedule = cron::Schedule::from_str(&cron_expr)
            .map_err(|e| Error::invalid_schedule(expr, e.to_string()))?;

        Ok(Self {
            expr: expr.to_string(),
            kind: Kind::Cron(Box::new(schedule)),
        })
    }

    pub fn every(interval: Duration) -> Self {
        Self {
            expr: format!("@every {}", format_duration(interval)),
            kind: Kind::Every(interval),
        }
    }

    pub fn never() -> Self {
        Self {
            expr: NEVER_SCHEDULE.to_string(),
            kind: Kind::Never,
        }
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn is_never(&self) -> bool {
        matches!(self.kind, Kind::Never)
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            Kind::Every(interval) => chrono::Duration::from_std(*interval)
                .ok()
                .and_then(|d| after.checked_add_signed(d)),
            Kind::Cron(schedule) => schedule.after(&after).next(),
            Kind::Never => None,
        }
    }

    /// Smallest gap between the next few fire times after `from`.
    pub fn shortest_interval(&self, from: DateTime<Utc>) -> Option<Duration> {
        match &self.kind {
            Kind::Every(interval) => Some(*interval),
            Kind::Cron(schedule) => {
                let fires: Vec<_> = schedule.after(&from).take(4).collect();
                fires
                    .windows(2)
                    .filter_map(|w| (w[1] - w[0]).to_std().ok())
                    .min()
            }
            Kind::Never => None,
        }
    }

    /// Replace a schedule that fires more often than `min` with `@every <min>`.
    ///
    /// Returns the schedule to use and whether it was replaced.
    pub fn at_least(self, min: Duration, from: DateTime<Utc>) -> (Self, bool) {
        match self.shortest_interval(from) {
            Some(interval) if interval < min => (Self::every(min), true),
            _ => (self, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    #[test]
    fn test_every() {
        let s = Schedule::parse("@every 15s").unwrap();
        assert_eq!(s.next_after(at(10, 0, 0)), Some(at(10, 0, 15)));
        assert_eq!(s.shortest_interval(at(10, 0, 0)), Some(Duration::from_secs(15)));
        assert!(Schedule::parse("@every").is_err());
        assert!(Schedule::parse("@every 0s").is_err());
    }

    #[test]
    fn test_five_field_cron_gets_seconds() {
        let s = Schedule::parse("*/15 * * * *").unwrap();
        assert_eq!(s.next_after(at(10, 1, 0)), Some(at(10, 15, 0)));
        assert_eq!(s.shortest_interval(at(10, 1, 0)), Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_descriptors() {
        let s = Schedule::parse("@hourly").unwrap();
        assert_eq!(s.next_after(at(10, 30, 0)), Some(at(11, 0, 0)));
        assert!(Schedule::parse("@daily").is_ok());
        assert!(Schedule::parse("@weekly").is_ok());
        assert!(Schedule::parse("@fortnightly").is_err());
    }

    #[test]
    fn test_never() {
        let s = Schedule::parse("@never").unwrap();
        assert!(s.is_never());
        assert_eq!(s.next_after(at(10, 0, 0)), None);
    }

    #[test]
    fn test_invalid_cron_is_configuration_error() {
        let err = Schedule::parse("every day at noon").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_minimum_interval_clamp() {
        let min = Duration::from_secs(29);
        let (fast, replaced) = Schedule::parse("@every 5s").unwrap().at_least(min, at(0, 0, 0));
        assert!(replaced);
        assert_eq!(fast.expr(), "@every 29s");

        let (every_second, replaced) = Schedule::parse("* * * * * *").unwrap().at_least(min, at(0, 0, 0));
        assert!(replaced);
        assert_eq!(every_second.shortest_interval(at(0, 0, 0)), Some(min));

        let (slow, replaced) = Schedule::parse("@every 1m").unwrap().at_least(min, at(0, 0, 0));
        assert!(!replaced);
        assert_eq!(slow.expr(), "@every 1m");
    }
}
