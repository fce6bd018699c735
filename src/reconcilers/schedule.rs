//! Decides whether a BackupJob is due for a new run
//!
//! Recurring BackupJobs run the most recent slot that has not been run yet.
//! Older missed slots are skipped, never backfilled. BackupJobs without a
//! schedule run once.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use cron::Schedule;

use crate::crd::{BackupJob, BackupJobStatus};
use crate::error::{Error, Result};

/// Cap on how many missed slots are counted for reporting
const MAX_COUNTED_SLOTS: usize = 1000;

/// Outcome of evaluating a BackupJob against the clock
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Evaluation {
    /// A run should be created; `slot` is `None` for one-shot BackupJobs
    Due {
        slot: Option<DateTime<Utc>>,
        skipped: usize,
    },
    /// Nothing to run now; `next` is the upcoming slot, if any
    NotDue { next: Option<DateTime<Utc>> },
}

/// Parse a cron expression
///
/// Standard 5-field expressions get a leading seconds field so they are
/// accepted alongside the 6/7-field form.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::validation(format!("Invalid cron schedule '{}': {}", expr, e)))
}

/// Most recent slot at or before `now`
pub fn latest_slot(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // Slots fall on whole seconds; stepping back from the next whole second
    // keeps a slot equal to `now`.
    let ceiling = now.with_nanosecond(0).unwrap_or(now) + chrono::Duration::seconds(1);
    schedule.after(&ceiling).rev().next()
}

/// First slot after `now`
pub fn next_slot(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&now).next()
}

/// Evaluate whether `backup` needs a new run at `now`
///
/// `status` is the status as folded in this reconciliation, which may be
/// ahead of `backup.status`.
pub fn evaluate(backup: &BackupJob, status: &BackupJobStatus, now: DateTime<Utc>) -> Result<Evaluation> {
    let Some(expr) = backup.spec.schedule.as_deref().filter(|_| backup.is_recurring()) else {
        let ran = status.last_run_time.is_some();
        return Ok(if ran {
            Evaluation::NotDue { next: None }
        } else {
            Evaluation::Due {
                slot: None,
                skipped: 0,
            }
        });
    };

    let schedule = parse_schedule(expr)?;

    // Slots before the BackupJob existed are not owed a run.
    let baseline = status
        .last_schedule_time
        .or(status.last_run_time)
        .or_else(|| backup.metadata.creation_timestamp.as_ref().map(|t| t.0));

    let due = match (latest_slot(&schedule, now), baseline) {
        (Some(slot), None) => Some((slot, 0)),
        (Some(slot), Some(baseline)) if slot > baseline => {
            let missed = schedule
                .after(&baseline)
                .take_while(|t| *t <= slot)
                .take(MAX_COUNTED_SLOTS)
                .count();
            Some((slot, missed.saturating_sub(1)))
        }
        _ => None,
    };

    Ok(match due {
        Some((slot, skipped)) => Evaluation::Due {
            slot: Some(slot),
            skipped,
        },
        None => Evaluation::NotDue {
            next: next_slot(&schedule, now),
        },
    })
}

/// Timer-based requeue for recurring BackupJobs, capped at `max`
pub fn requeue_after(backup: &BackupJob, now: DateTime<Utc>, max: Duration) -> Option<Duration> {
    if !backup.is_recurring() {
        return None;
    }
    let schedule = parse_schedule(backup.spec.schedule.as_deref()?).ok()?;
    let next = next_slot(&schedule, now)?;
    let until = (next - now).to_std().unwrap_or(Duration::from_secs(1));
    Some(until.clamp(Duration::from_secs(1), max))
}
