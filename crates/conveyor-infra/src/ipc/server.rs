//! Engine-side IPC loop: hosts the permit gate and executes submitted
//! jobs through the local worker runner.
//!
//! Protocol handling per message:
//! - `submit_job` registers the job and acks; execution waits for a permit.
//! - `request_permit` consults the gate; a grant spawns the job, a refusal
//!   replies `permit_rejected`.
//! - `cancel_job` fires the job's cancel token (best-effort, no reply).
//!
//! Outcomes always flow back as `job_completed`, including cancellations.

use std::sync::Arc;

use conveyor_core::permit::gate::PermitGate;
use conveyor_core::workflow::runner::{CheckRequest, StepRunner, StepRunRequest};
use conveyor_types::ipc::{ClientMessage, EngineMessage, JobOutcome, JobPayload, JobPayloadKind};
use conveyor_types::permit::{Job, StepRunStatus};
use conveyor_types::workflow::{CompletionCheckDef, StepDefinition};
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ipc::transport::IpcError;
use crate::worker::LocalProcessRunner;

// ---------------------------------------------------------------------------
// EngineServer
// ---------------------------------------------------------------------------

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
}

/// The engine process's server loop.
pub struct EngineServer {
    gate: Arc<PermitGate>,
    runner: Arc<LocalProcessRunner>,
    jobs: Arc<DashMap<Uuid, JobEntry>>,
}

impl EngineServer {
    pub fn new(gate: Arc<PermitGate>, runner: Arc<LocalProcessRunner>) -> Self {
        Self { gate, runner, jobs: Arc::new(DashMap::new()) }
    }

    /// Serve one connection until the peer closes it.
    pub async fn run(
        &self,
        reader: impl AsyncRead + Unpin + Send + 'static,
        writer: impl AsyncWrite + Unpin + Send + 'static,
    ) -> Result<(), IpcError> {
        let (out_tx, mut out_rx) = mpsc::channel::<EngineMessage>(256);

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(message) = out_rx.recv().await {
                let Ok(mut line) = serde_json::to_vec(&message) else { continue };
                line.push(b'\n');
                if writer.write_all(&line).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let message: ClientMessage = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable client frame");
                    continue;
                }
            };
            self.handle(message, &out_tx).await;
        }

        drop(out_tx);
        let _ = writer_task.await;
        Ok(())
    }

    async fn handle(&self, message: ClientMessage, out: &mpsc::Sender<EngineMessage>) {
        match message {
            ClientMessage::SubmitJob { request_id, job } => {
                let job_id = job.job_id;
                self.jobs
                    .entry(job_id)
                    .or_insert_with(|| JobEntry { job, cancel: CancellationToken::new() });
                let _ = out.send(EngineMessage::JobAck { request_id }).await;
                tracing::debug!(job_id = %job_id, "job submitted");
            }

            ClientMessage::RequestPermit { request_id, job, queued_for_ms } => {
                match self.gate.request_permit(&job, queued_for_ms) {
                    Ok(handle) => {
                        let _ = out
                            .send(EngineMessage::PermitGranted { request_id, job_id: job.job_id })
                            .await;
                        self.spawn_job(job.job_id, handle, out.clone());
                    }
                    Err(rejection) => {
                        tracing::debug!(
                            job_id = %job.job_id,
                            reason = ?rejection.reason,
                            "permit rejected"
                        );
                        let _ = out
                            .send(EngineMessage::PermitRejected { request_id, rejection })
                            .await;
                    }
                }
            }

            ClientMessage::CancelJob { job_id, reason, .. } => {
                if let Some(entry) = self.jobs.get(&job_id) {
                    tracing::debug!(job_id = %job_id, reason = reason.as_str(), "cancelling job");
                    entry.cancel.cancel();
                } else {
                    tracing::debug!(job_id = %job_id, "cancel for unknown job dropped");
                }
            }
        }
    }

    fn spawn_job(
        &self,
        job_id: Uuid,
        permit: conveyor_core::permit::gate::PermitHandle,
        out: mpsc::Sender<EngineMessage>,
    ) {
        let Some(entry) = self.jobs.get(&job_id) else {
            tracing::warn!(job_id = %job_id, "permit granted for unsubmitted job");
            return;
        };
        let job = entry.job.clone();
        let cancel = entry.cancel.clone();
        drop(entry);

        let gate = Arc::clone(&self.gate);
        let runner = Arc::clone(&self.runner);
        let jobs = Arc::clone(&self.jobs);

        tokio::spawn(async move {
            let completed = execute_job(&runner, &job, &cancel, permit.abort_signal()).await;

            match &completed {
                EngineMessage::JobCompleted { outcome: JobOutcome::Succeeded, .. } => {
                    gate.complete_permit(permit.permit_id);
                }
                _ => {
                    gate.revoke_permit(permit.permit_id, "job did not succeed");
                }
            }

            jobs.remove(&job_id);
            let _ = out.send(completed).await;
        });
    }
}

/// Run one job to its `job_completed` message.
async fn execute_job(
    runner: &LocalProcessRunner,
    job: &Job,
    cancel: &CancellationToken,
    permit_abort: CancellationToken,
) -> EngineMessage {
    let job_id = job.job_id;
    let failed = |error: String| EngineMessage::JobCompleted {
        job_id,
        outcome: JobOutcome::Failed,
        result: None,
        error_class: Some(conveyor_types::permit::ErrorClass::NonRetryable),
        error: Some(error),
    };

    let payload: JobPayload = match serde_json::from_value(job.payload.clone()) {
        Ok(payload) => payload,
        Err(e) => return failed(format!("bad job payload: {e}")),
    };

    // A gate revoke aborts the job just like a client cancel.
    let effective_cancel = cancel.clone();
    let revoke_watch = {
        let effective = effective_cancel.clone();
        tokio::spawn(async move {
            permit_abort.cancelled().await;
            effective.cancel();
        })
    };

    let timeout = std::time::Duration::from_millis(job.limits.timeout_ms.max(1));
    let message = match payload.kind {
        JobPayloadKind::Step => {
            let step = StepDefinition {
                worker: Some(payload.worker),
                instructions: payload.command.clone().or(Some(payload.instructions.clone())),
                capabilities: payload.capabilities.clone(),
                model: payload.model.clone(),
                ..Default::default()
            };
            let result = runner
                .run_step(StepRunRequest {
                    step_id: payload.step_id.clone(),
                    step,
                    instructions: payload.instructions.clone(),
                    workspace: payload.workspace.clone(),
                    env: payload.env.clone(),
                    iteration: payload.iteration,
                    timeout,
                    cancel: effective_cancel.clone(),
                })
                .await;

            let outcome = if effective_cancel.is_cancelled() {
                JobOutcome::Cancelled
            } else if result.status == StepRunStatus::Succeeded {
                JobOutcome::Succeeded
            } else {
                JobOutcome::Failed
            };
            EngineMessage::JobCompleted {
                job_id,
                outcome,
                result: None,
                error_class: result.error_class,
                error: result.error,
            }
        }

        JobPayloadKind::Check => {
            let check = CompletionCheckDef {
                worker: payload.worker,
                instructions: payload.instructions.clone(),
                capabilities: payload.capabilities.clone(),
                model: payload.model.clone(),
                decision_file: payload.decision_file.clone(),
                command: payload.command.clone(),
                timeout: None,
            };
            let check_result = runner
                .run_check(CheckRequest {
                    step_id: payload.step_id.clone(),
                    check,
                    check_id: payload.check_id.clone().unwrap_or_default(),
                    workspace: payload.workspace.clone(),
                    env: payload.env.clone(),
                    iteration: payload.iteration,
                    timeout,
                    cancel: effective_cancel.clone(),
                })
                .await;

            match check_result {
                Ok(outcome) => EngineMessage::JobCompleted {
                    job_id,
                    outcome: JobOutcome::Succeeded,
                    result: serde_json::to_value(&outcome).ok(),
                    error_class: None,
                    error: None,
                },
                Err(e) if effective_cancel.is_cancelled() => EngineMessage::JobCompleted {
                    job_id,
                    outcome: JobOutcome::Cancelled,
                    result: None,
                    error_class: None,
                    error: Some(e.to_string()),
                },
                Err(e) => EngineMessage::JobCompleted {
                    job_id,
                    outcome: JobOutcome::Failed,
                    result: None,
                    error_class: None,
                    error: Some(e.to_string()),
                },
            }
        }
    };

    revoke_watch.abort();
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::client::{EngineRunnerOptions, EngineStepRunner};
    use crate::ipc::transport::EngineConnection;
    use conveyor_core::permit::gate::GateOptions;
    use conveyor_types::config::AgentCatalog;
    use conveyor_types::permit::{ErrorClass, StepRunStatus};
    use conveyor_types::workflow::{Capability, WorkerKind};
    use std::collections::HashMap;
    use std::time::Duration;

    /// Client runner wired to a live in-process server over a duplex pipe.
    fn harness(gate_options: GateOptions) -> (EngineStepRunner, tokio::task::JoinHandle<()>) {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, server_write) = tokio::io::split(server_side);

        let server = EngineServer::new(
            Arc::new(PermitGate::new(gate_options)),
            Arc::new(LocalProcessRunner::new(AgentCatalog::default())),
        );
        let server_task = tokio::spawn(async move {
            server.run(server_read, server_write).await.unwrap();
        });

        let conn = Arc::new(EngineConnection::new(client_read, client_write));
        let runner = EngineStepRunner::new(conn, EngineRunnerOptions::default());
        (runner, server_task)
    }

    fn step_request(workspace: std::path::PathBuf, command: &str) -> StepRunRequest {
        StepRunRequest {
            step_id: "s".to_string(),
            step: StepDefinition {
                worker: Some(WorkerKind::Custom),
                instructions: Some(command.to_string()),
                capabilities: vec![Capability::RunCommands],
                ..Default::default()
            },
            instructions: String::new(),
            workspace,
            env: HashMap::new(),
            iteration: 1,
            timeout: Duration::from_secs(10),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_supervised_step_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, server) = harness(GateOptions::default());

        let result = runner.run_step(step_request(dir.path().to_path_buf(), "true")).await;
        assert_eq!(result.status, StepRunStatus::Succeeded);

        let result = runner.run_step(step_request(dir.path().to_path_buf(), "exit 4")).await;
        assert_eq!(result.status, StepRunStatus::Failed);

        server.abort();
    }

    #[tokio::test]
    async fn test_fatal_gate_rejection_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let gate_options = GateOptions::default();
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, server_write) = tokio::io::split(server_side);

        let gate = Arc::new(PermitGate::new(gate_options));
        gate.set_fatal();
        let server = EngineServer::new(
            Arc::clone(&gate),
            Arc::new(LocalProcessRunner::new(AgentCatalog::default())),
        );
        let server_task = tokio::spawn(async move {
            server.run(server_read, server_write).await.unwrap();
        });

        let conn = Arc::new(EngineConnection::new(client_read, client_write));
        let runner = EngineStepRunner::new(conn, EngineRunnerOptions::default());

        let result = runner.run_step(step_request(dir.path().to_path_buf(), "true")).await;
        assert_eq!(result.status, StepRunStatus::Failed);
        assert_eq!(result.error_class, Some(ErrorClass::Fatal));

        server_task.abort();
    }

    #[tokio::test]
    async fn test_supervised_check_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, server) = harness(GateOptions::default());

        let check = CheckRequest {
            step_id: "s".to_string(),
            check: CompletionCheckDef {
                worker: WorkerKind::Custom,
                instructions: "unused".to_string(),
                capabilities: vec![],
                model: None,
                decision_file: None,
                command: Some("exit 1".to_string()),
                timeout: None,
            },
            check_id: "c-1".to_string(),
            workspace: dir.path().to_path_buf(),
            env: HashMap::new(),
            iteration: 1,
            timeout: Duration::from_secs(10),
            cancel: CancellationToken::new(),
        };

        let outcome = runner.run_check(check).await.unwrap();
        assert!(!outcome.complete, "exit 1 means incomplete");

        server.abort();
    }

    #[tokio::test]
    async fn test_client_cancel_produces_cancelled_result() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, server) = harness(GateOptions::default());

        let mut request = step_request(dir.path().to_path_buf(), "sleep 30");
        let cancel = CancellationToken::new();
        request.cancel = cancel.clone();

        let runner = Arc::new(runner);
        let task = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run_step(request).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("cancel settles promptly")
            .unwrap();
        assert_eq!(result.status, StepRunStatus::Failed);
        assert_eq!(result.error_class, Some(ErrorClass::NonRetryable));

        server.abort();
    }
}
