//! Completion-decision resolution shared by worker runners.
//!
//! Resolution order for non-custom workers:
//! 1. a decision file in the workspace whose mtime is at or after the
//!    check start (minus a small slack),
//! 2. COMPLETE / INCOMPLETE markers in the worker's text output,
//! 3. otherwise the check fails with a parse error.
//!
//! Custom workers use exit codes instead: 0 = complete, 1 = incomplete,
//! anything else = check failure.

use std::path::Path;
use std::time::{Duration, SystemTime};

use conveyor_types::permit::CheckOutcome;
use serde::Deserialize;

use crate::workflow::runner::RunnerError;

/// Filesystem mtime slack when judging decision-file freshness.
pub const DECISION_MTIME_SLACK: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Decision file
// ---------------------------------------------------------------------------

/// On-disk decision document written by a check worker.
#[derive(Debug, Deserialize)]
struct DecisionDoc {
    complete: bool,
    #[serde(default)]
    fingerprints: Vec<String>,
    #[serde(default)]
    reason: Option<String>,
    /// When present, must match the check id handed to the worker.
    #[serde(default)]
    check_id: Option<String>,
}

/// Resolve a check outcome from the decision file and/or worker text.
pub async fn resolve_decision(
    workspace: &Path,
    decision_file: &str,
    check_id: &str,
    check_started_at: SystemTime,
    worker_text: Option<&str>,
) -> Result<CheckOutcome, RunnerError> {
    let path = workspace.join(decision_file);

    if let Ok(metadata) = tokio::fs::metadata(&path).await {
        let fresh = metadata
            .modified()
            .ok()
            .is_some_and(|mtime| {
                mtime + DECISION_MTIME_SLACK >= check_started_at
            });
        if fresh {
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| RunnerError::CheckFailed(format!("decision file read: {e}")))?;
            match serde_json::from_str::<DecisionDoc>(&text) {
                Ok(doc) => {
                    if doc.check_id.as_deref().is_none_or(|id| id == check_id) {
                        return Ok(CheckOutcome {
                            complete: doc.complete,
                            fingerprints: doc.fingerprints,
                            reason: doc.reason,
                        });
                    }
                    tracing::debug!(
                        decision_file,
                        "decision file carries a stale check id, falling back to text"
                    );
                }
                Err(e) => {
                    tracing::debug!(decision_file, error = %e, "unparseable decision file");
                }
            }
        }
    }

    if let Some(text) = worker_text {
        if let Some(complete) = parse_decision_text(text) {
            return Ok(CheckOutcome { complete, fingerprints: Vec::new(), reason: None });
        }
    }

    Err(RunnerError::NoDecision(format!(
        "no fresh decision file at '{decision_file}' and no COMPLETE/INCOMPLETE marker"
    )))
}

/// Scan worker output for a COMPLETE / INCOMPLETE marker.
///
/// INCOMPLETE is checked first since COMPLETE is a substring of it.
pub fn parse_decision_text(text: &str) -> Option<bool> {
    if text.contains("INCOMPLETE") {
        Some(false)
    } else if text.contains("COMPLETE") {
        Some(true)
    } else {
        None
    }
}

/// Map a custom check worker's exit code onto a verdict.
pub fn custom_exit_decision(code: i32) -> Result<bool, RunnerError> {
    match code {
        0 => Ok(true),
        1 => Ok(false),
        other => Err(RunnerError::CheckFailed(format!("custom check exited with {other}"))),
    }
}
