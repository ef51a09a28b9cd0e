//! Five-field cron expressions used to gate when a task may run.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Datelike, Timelike, Utc};

/// A parsed `minute hour day-of-month month day-of-week` expression.
///
/// A task is within its schedule when the expression matches the current
/// minute. The default expression `* * * * *` matches every minute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    expression: String,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

pub const EVERY_MINUTE: &str = "* * * * *";

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            bail!(
                "schedule '{expression}' must have 5 fields, found {}",
                fields.len()
            );
        }
        let parse = |idx: usize, name: &str, min: u32, max: u32| {
            parse_field(fields[idx], min, max)
                .with_context(|| format!("parse {name} of schedule '{expression}'"))
        };
        let minutes = parse(0, "minute", 0, 59)?;
        let hours = parse(1, "hour", 0, 23)?;
        let days_of_month = parse(2, "day of month", 1, 31)?;
        let months = parse(3, "month", 1, 12)?;
        // 7 is an alias for Sunday.
        let mut days_of_week: Vec<u32> = parse(4, "day of week", 0, 7)?
            .into_iter()
            .map(|d| d % 7)
            .collect();
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            expression: expression.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// True if `at` falls into a minute selected by the expression.
    ///
    /// Day-of-month and day-of-week follow classic cron: when both are
    /// restricted, either one matching is enough.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        if !self.minutes.contains(&at.minute())
            || !self.hours.contains(&at.hour())
            || !self.months.contains(&at.month())
        {
            return false;
        }
        let dom = self.days_of_month.contains(&at.day());
        let dow = self
            .days_of_week
            .contains(&at.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            expression: EVERY_MINUTE.to_string(),
            minutes: (0..=59).collect(),
            hours: (0..=23).collect(),
            days_of_month: (1..=31).collect(),
            months: (1..=12).collect(),
            days_of_week: (0..=6).collect(),
            dom_restricted: false,
            dow_restricted: false,
        }
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<u32>> {
    let mut values = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| anyhow!("invalid step '{step}'"))?;
                if step == 0 {
                    bail!("step must be > 0");
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, max)?, parse_value(b, min, max)?)
        } else {
            let start = parse_value(range, min, max)?;
            // `5/15` means "from 5 to the end, every 15".
            if step > 1 { (start, max) } else { (start, start) }
        };
        if start > end {
            bail!("range {start}-{end} is reversed");
        }
        values.extend((start..=end).step_by(step as usize));
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn parse_value(raw: &str, min: u32, max: u32) -> Result<u32> {
    let value: u32 = raw
        .parse()
        .map_err(|_| anyhow!("invalid value '{raw}'"))?;
    if value < min || value > max {
        bail!("value {value} outside {min}-{max}");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).single().expect("valid time")
    }

    #[test]
    fn default_matches_everything() {
        let schedule = Schedule::parse(EVERY_MINUTE).expect("parse");
        assert!(schedule.matches(at(2024, 2, 29, 23, 59)));
        assert_eq!(schedule, Schedule::default());
    }

    #[test]
    fn lists_ranges_and_steps() {
        let schedule = Schedule::parse("*/15 9-17 * * 1-5").expect("parse");
        // 2024-03-04 is a Monday.
        assert!(schedule.matches(at(2024, 3, 4, 9, 30)));
        assert!(!schedule.matches(at(2024, 3, 4, 9, 31)));
        assert!(!schedule.matches(at(2024, 3, 4, 18, 0)));
        // Saturday.
        assert!(!schedule.matches(at(2024, 3, 9, 10, 0)));
    }

    #[test]
    fn day_of_month_or_day_of_week() {
        let schedule = Schedule::parse("0 0 1 * 0").expect("parse");
        // First of month, a Friday.
        assert!(schedule.matches(at(2024, 3, 1, 0, 0)));
        // A Sunday that is not the first.
        assert!(schedule.matches(at(2024, 3, 3, 0, 0)));
        assert!(!schedule.matches(at(2024, 3, 4, 0, 0)));
    }

    #[test]
    fn sunday_alias() {
        let schedule = Schedule::parse("* * * * 7").expect("parse");
        assert!(schedule.matches(at(2024, 3, 3, 12, 0)));
    }

    #[test]
    fn rejects_invalid_expressions() {
        assert!(Schedule::parse("* * * *").is_err());
        assert!(Schedule::parse("60 * * * *").is_err());
        assert!(Schedule::parse("*/0 * * * *").is_err());
        assert!(Schedule::parse("5-1 * * * *").is_err());
    }
}
