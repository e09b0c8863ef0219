//! Cron event source backed by `tokio-cron-scheduler`.
//!
//! Schedules accept standard 5/6-field cron expressions or a small set of
//! human-readable phrases ("every 5 minutes", "daily", "every day at
//! 09:30"), normalized to 6-field cron before registration. `croner` is
//! used directly for missed-run detection against persisted trigger state.

use chrono::{DateTime, Utc};
use conveyor_core::event::{EventSource, SourceError};
use conveyor_types::event::{Event, EventPayload};
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a schedule string to a 6-field cron expression (with seconds).
///
/// Accepted inputs:
/// - 5-field cron (seconds are prepended) or 6-field cron (as-is)
/// - "minutely" / "hourly" / "daily" and their "every ..." spellings
/// - "every N seconds|minutes|hours"
/// - "every day at HH:MM"
pub fn normalize_schedule(input: &str) -> Result<String, SourceError> {
    let trimmed = input.trim();
    let invalid = || SourceError::InvalidConfig(format!("unrecognized schedule '{trimmed}'"));

    match trimmed.split_whitespace().count() {
        5 => return Ok(format!("0 {trimmed}")),
        6 => return Ok(trimmed.to_string()),
        _ => {}
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        _ => {}
    }

    let rest = lower.strip_prefix("every ").ok_or_else(invalid)?;

    if let Some(time) = rest.strip_prefix("day at ") {
        let (hour, minute) = time.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
        if hour >= 24 || minute >= 60 {
            return Err(invalid());
        }
        return Ok(format!("0 {minute} {hour} * * *"));
    }

    let (count, unit) = rest.split_once(' ').ok_or_else(invalid)?;
    let n: u32 = count.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(SourceError::InvalidConfig("schedule interval must be > 0".to_string()));
    }
    match unit.trim_end_matches('s') {
        "second" => Ok(format!("*/{n} * * * * *")),
        "minute" => Ok(format!("0 */{n} * * * *")),
        "hour" => Ok(format!("0 0 */{n} * * *")),
        _ => Err(invalid()),
    }
}

/// Occurrences of `schedule` between `last_fired` and now.
///
/// Used on daemon start to log (not replay) runs missed while the daemon
/// was down. Invalid schedules and missing baselines yield no misses.
pub fn missed_runs(schedule: &str, last_fired: Option<DateTime<Utc>>) -> Vec<DateTime<Utc>> {
    let Some(from) = last_fired else { return Vec::new() };
    let Ok(expr) = normalize_schedule(schedule) else { return Vec::new() };
    let Ok(cron) = expr.parse::<croner::Cron>() else { return Vec::new() };

    let now = Utc::now();
    let mut missed = Vec::new();
    for next in cron.iter_after(from) {
        if next >= now {
            break;
        }
        missed.push(next);
    }
    missed
}

// ---------------------------------------------------------------------------
// CronSource
// ---------------------------------------------------------------------------

/// Emits a `Cron` event each time the schedule fires.
pub struct CronSource {
    source_id: String,
    cron_expr: String,
}

impl CronSource {
    pub fn new(source_id: &str, schedule: &str) -> Result<Self, SourceError> {
        let cron_expr = normalize_schedule(schedule)?;
        Ok(Self { source_id: source_id.to_string(), cron_expr })
    }

    pub fn cron_expr(&self) -> &str {
        &self.cron_expr
    }
}

impl EventSource for CronSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn run(
        self,
        tx: mpsc::Sender<Event>,
        stop: CancellationToken,
    ) -> Result<(), SourceError> {
        let scheduler = JobScheduler::new().await.map_err(|e| SourceError::StartFailed {
            source_id: self.source_id.clone(),
            reason: e.to_string(),
        })?;

        let source_id = self.source_id.clone();
        let cron_expr = self.cron_expr.clone();
        let job = Job::new_async(self.cron_expr.as_str(), move |_uuid, _lock| {
            let tx = tx.clone();
            let source_id = source_id.clone();
            let cron_expr = cron_expr.clone();
            Box::pin(async move {
                let fired_at = Utc::now();
                let event = Event::now(
                    &source_id,
                    EventPayload::Cron { schedule: cron_expr, fired_at },
                );
                if tx.send(event).await.is_err() {
                    tracing::debug!(source_id = source_id.as_str(), "event channel closed");
                }
            })
        })
        .map_err(|e| SourceError::InvalidConfig(e.to_string()))?;

        scheduler.add(job).await.map_err(|e| SourceError::StartFailed {
            source_id: self.source_id.clone(),
            reason: e.to_string(),
        })?;
        scheduler.start().await.map_err(|e| SourceError::StartFailed {
            source_id: self.source_id.clone(),
            reason: e.to_string(),
        })?;

        stop.cancelled().await;

        let mut scheduler = scheduler;
        if let Err(e) = scheduler.shutdown().await {
            tracing::warn!(source_id = self.source_id.as_str(), error = %e, "cron shutdown error");
        }
        Ok(())
    }
}
