//! Six-field cron matcher.
//! Format: "SEC MIN HOUR DOM MON DOW" (a five-field expression gets a `0` seconds field).
//! Each field is a comma list of `*`, `*/N`, `A/N`, `A-B`, `A-B/N` or `N`.
//! Example: "0 */5 9-17 * * 1-5" = every 5 minutes, 9:00–17:55, Monday to Friday
//!
//! All six fields must match; day-of-month and weekday are ANDed.
//! Weekday 0 and 7 are both Sunday.

use chrono::{DateTime, Datelike, Duration, FixedOffset, SubsecRound, Timelike, Utc};
use cronclaw_core::error::{CronClawError, Result};
use cronclaw_core::types::task::normalize_cron;

const FIELD_NAMES: [&str; 6] = ["second", "minute", "hour", "day", "month", "weekday"];
const FIELD_BOUNDS: [(u32, u32); 6] = [(0, 59), (0, 59), (0, 23), (1, 31), (1, 12), (0, 7)];

/// A parsed cron expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    fields: [u64; 6],
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expr = normalize_cron(expression);
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 6 {
            return Err(invalid(
                expression,
                format!("need 6 fields (SEC MIN HOUR DOM MON DOW), got {}", parts.len()),
            ));
        }

        let mut fields = [0u64; 6];
        for (i, part) in parts.iter().enumerate() {
            let (min, max) = FIELD_BOUNDS[i];
            fields[i] = parse_field(part, min, max)
                .map_err(|reason| invalid(expression, format!("{}: {reason}", FIELD_NAMES[i])))?;
        }
        // 7 is an alias for Sunday
        if fields[5] & (1 << 7) != 0 {
            fields[5] = (fields[5] & !(1 << 7)) | 1;
        }
        Ok(Self { expr, fields })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Does the schedule fire at this (local) second?
    pub fn matches(&self, t: &DateTime<FixedOffset>) -> bool {
        let values = [
            t.second(),
            t.minute(),
            t.hour(),
            t.day(),
            t.month(),
            t.weekday().num_days_from_sunday(),
        ];
        values
            .iter()
            .zip(self.fields.iter())
            .all(|(v, mask)| mask & (1u64 << v) != 0)
    }

    /// Every second in `(after, until]` at which the schedule fires, oldest first.
    pub fn due_instants(
        &self,
        tz: &FixedOffset,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let until = until.trunc_subsecs(0);
        let mut candidate = after.trunc_subsecs(0) + Duration::seconds(1);
        let mut due = Vec::new();
        while candidate <= until {
            if self.matches(&candidate.with_timezone(tz)) {
                due.push(candidate);
            }
            candidate += Duration::seconds(1);
        }
        due
    }
}

/// One-shot check of an expression against an instant; invalid expressions never fire.
pub fn should_fire(t: DateTime<Utc>, expression: &str, tz: &FixedOffset) -> bool {
    match CronSchedule::parse(expression) {
        Ok(schedule) => schedule.matches(&t.with_timezone(tz)),
        Err(e) => {
            tracing::warn!("{e}");
            false
        }
    }
}

/// "UTC", "Z", "" or a fixed offset like "+07:00" / "-0530".
pub fn parse_timezone(tz: &str) -> Option<FixedOffset> {
    let tz = tz.trim();
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Parse a cron field into a bitmask of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> std::result::Result<u64, String> {
    let mut mask = 0u64;
    for segment in field.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err(format!("empty segment in '{field}'"));
        }

        let (range, step) = match segment.split_once('/') {
            Some((range, step)) => {
                let n: u32 = step.parse().map_err(|_| format!("bad step '{step}'"))?;
                if n == 0 {
                    return Err("step must be greater than 0".into());
                }
                (range, Some(n))
            }
            None => (segment, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, max)?, parse_value(b, min, max)?)
        } else {
            let start = parse_value(range, min, max)?;
            // "A/N" steps from A to the field maximum
            if step.is_some() { (start, max) } else { (start, start) }
        };
        if lo > hi {
            return Err(format!("range {lo}-{hi} is reversed"));
        }

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            mask |= 1 << v;
        }
    }
    Ok(mask)
}

fn parse_value(raw: &str, min: u32, max: u32) -> std::result::Result<u32, String> {
    let n: u32 = raw.trim().parse().map_err(|_| format!("bad value '{raw}'"))?;
    if n < min || n > max {
        return Err(format!("{n} out of range {min}-{max}"));
    }
    Ok(n)
}

fn invalid(expr: &str, reason: String) -> CronClawError {
    CronClawError::InvalidCron {
        expr: expr.to_string(),
        reason,
    }
}
