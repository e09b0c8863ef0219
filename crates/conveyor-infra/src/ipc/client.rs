//! Supervised-mode step runner: bridges the executor onto the engine IPC.
//!
//! Per step attempt: submit the job and await the ack, re-baseline the
//! deadline (engine startup must not eat the step budget), then loop on
//! `request_permit` with full-jitter backoff until granted or a terminal
//! rejection, then await `job_completed` raced against the scoped abort
//! and the deadline. On abort a best-effort `cancel_job` goes out and a
//! short grace window catches the trailing completion before a CANCELLED
//! result is synthesized.

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::workflow::runner::{CheckRequest, RunnerError, StepRunner, StepRunRequest};
use conveyor_types::ipc::{ClientMessage, EngineMessage, JobOutcome, JobPayload, JobPayloadKind};
use conveyor_types::permit::{
    CheckOutcome, ErrorClass, Job, JobContext, JobLimits, PermitRejection, StepRunResult,
    WorkerStatus,
};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ipc::transport::{EngineConnection, IpcError};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Tunables for the engine runner.
#[derive(Debug, Clone)]
pub struct EngineRunnerOptions {
    /// Full-jitter backoff base for permit re-requests.
    pub permit_backoff_base: Duration,
    /// Backoff cap.
    pub permit_backoff_cap: Duration,
    /// How long to wait for `job_ack`.
    pub ack_timeout: Duration,
    /// Grace window for a trailing `job_completed` after cancel.
    pub trailing_grace: Duration,
    /// When both the deadline and the workflow abort race the worker,
    /// classify by the deadline (FAILED transient) instead of CANCELLED.
    pub deadline_beats_cancel: bool,
}

impl Default for EngineRunnerOptions {
    fn default() -> Self {
        Self {
            permit_backoff_base: Duration::from_millis(200),
            permit_backoff_cap: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            trailing_grace: Duration::from_secs(5),
            deadline_beats_cancel: false,
        }
    }
}

/// Full jitter: uniform in [0, min(base * 2^attempt, cap)].
fn full_jitter_backoff(options: &EngineRunnerOptions, attempt: u32) -> Duration {
    let exp = attempt.min(16);
    let ceiling = options
        .permit_backoff_base
        .saturating_mul(1u32 << exp)
        .min(options.permit_backoff_cap);
    let millis = ceiling.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..millis))
}

// ---------------------------------------------------------------------------
// EngineStepRunner
// ---------------------------------------------------------------------------

/// `StepRunner` that delegates to the engine process.
pub struct EngineStepRunner {
    conn: Arc<EngineConnection>,
    options: EngineRunnerOptions,
}

enum Settled {
    Completed(EngineMessage),
    Cancelled,
    DeadlineExceeded,
    Transport(IpcError),
    PermitRejected(PermitRejection),
}

impl EngineStepRunner {
    pub fn new(conn: Arc<EngineConnection>, options: EngineRunnerOptions) -> Self {
        Self { conn, options }
    }

    fn build_job(payload: &JobPayload, timeout: Duration) -> Job {
        Job {
            job_id: Uuid::now_v7(),
            job_type: serde_json::to_value(payload.worker)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "custom".to_string()),
            priority: 0,
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            limits: JobLimits {
                timeout_ms: timeout.as_millis() as u64,
                max_attempts: 1,
                cost_hint: 0.0,
            },
            context: JobContext {
                trace_id: Uuid::now_v7().to_string(),
                correlation_id: payload.step_id.clone(),
            },
        }
    }

    /// Submit, acquire a permit, and await completion for one job.
    async fn run_job(
        &self,
        job: Job,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Settled {
        let job_id = job.job_id;
        let completion = self.conn.register_completion(job_id);

        // Submit and await the ack, bounded by the parent abort.
        let ack = tokio::select! {
            _ = cancel.cancelled() => {
                self.conn.clear_completion(job_id);
                return Settled::Cancelled;
            }
            ack = tokio::time::timeout(
                self.options.ack_timeout,
                self.conn.request(ClientMessage::SubmitJob { request_id: Uuid::now_v7(), job: job.clone() }),
            ) => ack,
        };
        match ack {
            Ok(Ok(EngineMessage::JobAck { .. })) => {}
            Ok(Ok(other)) => {
                tracing::warn!(job_id = %job_id, reply = ?other, "unexpected submit reply");
                self.conn.clear_completion(job_id);
                return Settled::Transport(IpcError::Closed);
            }
            Ok(Err(e)) => {
                self.conn.clear_completion(job_id);
                return Settled::Transport(e);
            }
            Err(_) => {
                self.conn.clear_completion(job_id);
                return Settled::Transport(IpcError::Timeout);
            }
        }

        // Budget starts after the ack so engine startup is free.
        let deadline = tokio::time::Instant::now() + timeout;
        let queue_started = tokio::time::Instant::now();

        // Permit loop with full-jitter backoff.
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                self.cancel_job(job_id, "parent abort").await;
                self.conn.clear_completion(job_id);
                return Settled::Cancelled;
            }
            if tokio::time::Instant::now() >= deadline {
                self.cancel_job(job_id, "deadline exceeded").await;
                self.conn.clear_completion(job_id);
                return Settled::DeadlineExceeded;
            }

            let reply = self
                .conn
                .request(ClientMessage::RequestPermit {
                    request_id: Uuid::now_v7(),
                    job: job.clone(),
                    queued_for_ms: queue_started.elapsed().as_millis() as u64,
                })
                .await;

            match reply {
                Ok(EngineMessage::PermitGranted { .. }) => break,
                Ok(EngineMessage::PermitRejected { rejection, .. }) => {
                    if rejection.reason.is_terminal() {
                        self.conn.clear_completion(job_id);
                        return Settled::PermitRejected(rejection);
                    }
                    let backoff = full_jitter_backoff(&self.options, attempt);
                    attempt += 1;
                    tracing::debug!(
                        job_id = %job_id,
                        reason = ?rejection.reason,
                        backoff_ms = backoff.as_millis() as u64,
                        "permit rejected, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                Ok(other) => {
                    tracing::warn!(job_id = %job_id, reply = ?other, "unexpected permit reply");
                    self.conn.clear_completion(job_id);
                    return Settled::Transport(IpcError::Closed);
                }
                Err(e) => {
                    self.conn.clear_completion(job_id);
                    return Settled::Transport(e);
                }
            }
        }

        // Await completion, racing the scoped abort and the deadline.
        let mut completion = completion;
        let raced = tokio::select! {
            completed = &mut completion => {
                return match completed {
                    Ok(message) => Settled::Completed(message),
                    Err(_) => Settled::Transport(IpcError::Closed),
                };
            }
            _ = cancel.cancelled() => Settled::Cancelled,
            _ = tokio::time::sleep_until(deadline) => Settled::DeadlineExceeded,
        };

        // Cancel and allow a trailing completion within the grace window.
        self.cancel_job(job_id, "aborted").await;
        match tokio::time::timeout(self.options.trailing_grace, completion).await {
            Ok(Ok(message)) => {
                tracing::debug!(job_id = %job_id, "trailing completion after cancel");
                Settled::Completed(message)
            }
            _ => {
                self.conn.clear_completion(job_id);
                raced
            }
        }
    }

    async fn cancel_job(&self, job_id: Uuid, reason: &str) {
        let message = ClientMessage::CancelJob {
            request_id: Uuid::now_v7(),
            job_id,
            reason: reason.to_string(),
        };
        if let Err(e) = self.conn.send(&message).await {
            tracing::debug!(job_id = %job_id, error = %e, "cancel_job send failed");
        }
    }

    fn settle_to_result(&self, settled: Settled) -> StepRunResult {
        match settled {
            Settled::Completed(EngineMessage::JobCompleted {
                outcome,
                error_class,
                error,
                ..
            }) => {
                let status = match outcome {
                    JobOutcome::Succeeded => WorkerStatus::Succeeded,
                    JobOutcome::Failed => WorkerStatus::Failed,
                    JobOutcome::Cancelled => WorkerStatus::Cancelled,
                };
                StepRunResult::from_worker(status, error_class, error)
            }
            Settled::Completed(other) => StepRunResult::failed(
                ErrorClass::RetryableTransient,
                format!("unexpected completion message: {other:?}"),
            ),
            Settled::Cancelled => {
                StepRunResult::from_worker(WorkerStatus::Cancelled, None, Some("aborted".into()))
            }
            Settled::DeadlineExceeded => {
                if self.options.deadline_beats_cancel {
                    StepRunResult::failed(ErrorClass::RetryableTransient, "step deadline exceeded")
                } else {
                    StepRunResult::from_worker(
                        WorkerStatus::Cancelled,
                        None,
                        Some("step deadline exceeded".into()),
                    )
                }
            }
            Settled::Transport(e) => {
                StepRunResult::failed(ErrorClass::RetryableService, format!("engine ipc: {e}"))
            }
            Settled::PermitRejected(rejection) => StepRunResult::failed(
                rejection.reason.error_class(),
                format!(
                    "permit rejected: {:?}{}",
                    rejection.reason,
                    rejection.detail.map(|d| format!(" ({d})")).unwrap_or_default()
                ),
            ),
        }
    }
}

impl StepRunner for EngineStepRunner {
    async fn run_step(&self, request: StepRunRequest) -> StepRunResult {
        let Some(worker) = request.step.worker else {
            return StepRunResult::failed(ErrorClass::NonRetryable, "step has no worker");
        };

        let payload = JobPayload {
            kind: JobPayloadKind::Step,
            step_id: request.step_id.clone(),
            worker,
            instructions: request.instructions.clone(),
            capabilities: request.step.capabilities.clone(),
            workspace: request.workspace.clone(),
            env: request.env.clone(),
            iteration: request.iteration,
            model: request.step.model.clone(),
            command: if worker == conveyor_types::workflow::WorkerKind::Custom {
                request.step.instructions.clone()
            } else {
                None
            },
            decision_file: None,
            check_id: None,
        };

        let job = Self::build_job(&payload, request.timeout);
        let settled = self.run_job(job, request.timeout, &request.cancel).await;
        self.settle_to_result(settled)
    }

    async fn run_check(&self, request: CheckRequest) -> Result<CheckOutcome, RunnerError> {
        let payload = JobPayload {
            kind: JobPayloadKind::Check,
            step_id: request.step_id.clone(),
            worker: request.check.worker,
            instructions: request.check.instructions.clone(),
            capabilities: request.check.capabilities.clone(),
            workspace: request.workspace.clone(),
            env: request.env.clone(),
            iteration: request.iteration,
            model: request.check.model.clone(),
            command: request.check.command.clone(),
            decision_file: request.check.decision_file.clone(),
            check_id: Some(request.check_id.clone()),
        };

        let job = Self::build_job(&payload, request.timeout);
        match self.run_job(job, request.timeout, &request.cancel).await {
            Settled::Completed(EngineMessage::JobCompleted {
                outcome: JobOutcome::Succeeded,
                result: Some(result),
                ..
            }) => serde_json::from_value(result)
                .map_err(|e| RunnerError::CheckFailed(format!("bad check result: {e}"))),
            Settled::Completed(EngineMessage::JobCompleted { outcome, error, .. }) => {
                Err(RunnerError::CheckFailed(format!(
                    "check job ended {outcome:?}: {}",
                    error.unwrap_or_default()
                )))
            }
            Settled::Completed(other) => {
                Err(RunnerError::CheckFailed(format!("unexpected message: {other:?}")))
            }
            Settled::Cancelled | Settled::DeadlineExceeded => Err(RunnerError::Cancelled),
            Settled::Transport(e) => Err(RunnerError::CheckFailed(e.to_string())),
            Settled::PermitRejected(rejection) => {
                Err(RunnerError::CheckFailed(format!("permit rejected: {:?}", rejection.reason)))
            }
        }
    }
}
