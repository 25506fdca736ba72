//! Next-fire-time arithmetic for interval and cron schedules (UTC).

use crate::errors::{CadenceError, CadenceResult};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Validate a cron expression, normalizing 5-field syntax to the 6-field
/// form (leading seconds) the `cron` crate expects.
pub fn validate_cron_expr(expr: &str) -> CadenceResult<String> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| {
        CadenceError::Validation(format!("Invalid cron expression '{}': {}", expr, e))
    })?;
    Ok(normalized)
}

/// First fire time strictly after `after`, or `None` if the expression is
/// invalid or never fires again.
pub fn next_cron_run(expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalized = validate_cron_expr(expr).ok()?;
    let schedule = Schedule::from_str(&normalized).ok()?;
    schedule.after(&after).next()
}

/// Next slot of a fixed-interval schedule, measured from the previous
/// scheduled slot rather than from completion time.
///
/// When `prev + interval` has already passed (the scheduler was down or the
/// run overran), skips ahead by whole intervals to the first slot after
/// `now`. Missed slots are not replayed and phase is preserved.
///
/// Returns `None` when the next slot is past the representable date range.
pub fn next_interval_run(
    prev: DateTime<Utc>,
    interval_seconds: f64,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let interval_us = (interval_seconds * 1_000_000.0).round().max(1.0) as i64;
    let step = chrono::Duration::microseconds(interval_us);
    let next = prev.checked_add_signed(step)?;
    if next > now {
        return Some(next);
    }
    match (now - prev).num_microseconds() {
        Some(elapsed_us) => {
            let steps = elapsed_us / interval_us + 1;
            prev.checked_add_signed(chrono::Duration::microseconds(
                steps.saturating_mul(interval_us),
            ))
        }
        None => now.checked_add_signed(step),
    }
}
