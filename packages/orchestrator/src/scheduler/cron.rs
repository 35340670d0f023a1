//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, with weekday `0` (or `7`)
//! as Sunday. The periodic facility of the in-process engine speaks the
//! six-field dialect with leading seconds and 1-based weekdays (Sunday = 1),
//! so parsing renders that form once and lets `tokio-cron-scheduler` decide
//! whether it is a valid schedule.

use std::fmt;

use tokio_cron_scheduler::Job;

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A validated five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    scheduler_format: String,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(format!(
                "cron expression must have 5 fields, got {}",
                parts.len()
            ));
        }

        let scheduler_format = format!(
            "0 {} {} {} {} {}",
            parts[0],
            parts[1],
            parts[2],
            parts[3],
            shift_weekdays(parts[4])
        );
        Job::new(scheduler_format.as_str(), |_, _| {})
            .map_err(|e| format!("invalid cron expression '{expression}': {e}"))?;

        Ok(Self {
            source: parts.join(" "),
            scheduler_format,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Six-field form with a zero seconds column and Sunday = 1 weekdays.
    pub fn to_scheduler_format(&self) -> &str {
        &self.scheduler_format
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Move a zero-based weekday field to Sunday = 1. Tokens that are not
/// weekdays pass through untouched for the scheduler to reject.
fn shift_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(shift_weekday_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_weekday_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    let with_step = |range: String| match step {
        Some(step) => format!("{range}/{step}"),
        None => range,
    };

    if let Some((start, end)) = range.split_once('-') {
        let (Some(start), Some(end)) = (weekday_number(start), weekday_number(end)) else {
            return item.to_string();
        };
        // `FRI-SUN` and `5-0` run up to the Sunday at the end of the week
        let end = if end == 0 && start > 0 { 7 } else { end };
        if end < 7 || start == 0 {
            return with_step(format!("{}-{}", start + 1, end.min(6) + 1));
        }
        // Saturday is the last 1-based day; a trailing Sunday wraps to 1
        let every = step.and_then(|step| step.parse::<u32>().ok()).unwrap_or(1);
        let mut shifted = if start == 6 {
            "7".to_string()
        } else {
            with_step(format!("{}-7", start + 1))
        };
        if every > 0 && (7 - start) % every == 0 {
            shifted.push_str(",1");
        }
        return shifted;
    }

    match weekday_number(range) {
        Some(7) => "1".to_string(),
        Some(day) => with_step((day + 1).to_string()),
        None => item.to_string(),
    }
}

fn weekday_number(token: &str) -> Option<u32> {
    let upper = token.to_ascii_uppercase();
    if let Some(index) = WEEKDAYS.iter().position(|name| *name == upper) {
        return Some(index as u32);
    }
    token.parse().ok()
}
