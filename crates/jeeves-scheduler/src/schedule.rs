use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::types::Schedule;

/// Minimum distance into the future for a recomputed interval run.
/// Guards against a tight fire loop when the stored cadence is already past.
const MIN_INTERVAL_BUMP_MS: i64 = 1_000;

/// Compute the next fire time (epoch ms) for `schedule`.
///
/// `last_run_at_ms` is the most recent fire, `None` before the first.
/// Returns `None` when the schedule is exhausted (a fired one-shot) or
/// invalid (bad cron expression / unknown timezone) — such jobs are skipped
/// until fixed.
pub fn next_run_at(schedule: &Schedule, last_run_at_ms: Option<i64>, now: DateTime<Utc>) -> Option<i64> {
    let now_ms = now.timestamp_millis();
    match schedule {
        Schedule::At { at } => {
            // Past instants still fire exactly once; after that the
            // schedule is exhausted.
            if last_run_at_ms.is_some() {
                None
            } else {
                Some(at.timestamp_millis().max(now_ms))
            }
        }

        Schedule::Every { every_ms } => {
            let base = last_run_at_ms.unwrap_or(now_ms);
            let next = base.saturating_add(*every_ms as i64);
            if next <= now_ms {
                Some(now_ms + MIN_INTERVAL_BUMP_MS)
            } else {
                Some(next)
            }
        }

        Schedule::Cron { expr, tz } => next_cron_run(expr, tz.as_deref(), now),
    }
}

/// Next tick strictly after `now` for a cron expression in the given
/// timezone (process-local when absent).
fn next_cron_run(expr: &str, tz: Option<&str>, now: DateTime<Utc>) -> Option<i64> {
    let schedule = match parse_cron(expr) {
        Some(s) => s,
        None => {
            warn!(expr, "invalid cron expression; job will not be scheduled");
            return None;
        }
    };

    match tz {
        Some(name) => {
            let zone: Tz = match name.parse() {
                Ok(z) => z,
                Err(_) => {
                    warn!(tz = name, "unknown timezone; job will not be scheduled");
                    return None;
                }
            };
            let local = now.with_timezone(&zone);
            schedule.after(&local).next().map(|dt| dt.timestamp_millis())
        }
        None => {
            let local = now.with_timezone(&chrono::Local);
            schedule.after(&local).next().map(|dt| dt.timestamp_millis())
        }
    }
}

/// Parse a cron expression, accepting the common 5-field form by prepending
/// a seconds field (the `cron` crate wants 6 or 7 fields).
fn parse_cron(expr: &str) -> Option<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    let normalised = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalised).ok()
}
