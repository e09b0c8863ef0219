//! Local worker-CLI step runner.
//!
//! Spawns the configured worker binary per step attempt, feeding it the
//! composed instructions on stdin, with a per-attempt timeout and
//! cooperative cancellation (SIGKILL via `kill_on_drop` once the scoped
//! abort fires). Completion checks reuse the same spawn path and resolve
//! their verdict through `conveyor_core::workflow::check`.

use std::process::Stdio;
use std::time::SystemTime;

use conveyor_core::workflow::check::{custom_exit_decision, resolve_decision};
use conveyor_core::workflow::runner::{CheckRequest, RunnerError, StepRunner, StepRunRequest};
use conveyor_types::config::AgentCatalog;
use conveyor_types::permit::{CheckOutcome, ErrorClass, StepRunResult};
use conveyor_types::workflow::{Capability, WorkerKind};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

// ---------------------------------------------------------------------------
// LocalProcessRunner
// ---------------------------------------------------------------------------

/// Runs steps by invoking worker CLIs as subprocesses.
pub struct LocalProcessRunner {
    catalog: AgentCatalog,
}

/// Output of one worker invocation.
struct WorkerOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl LocalProcessRunner {
    pub fn new(catalog: AgentCatalog) -> Self {
        Self { catalog }
    }

    /// Build the command line for a worker invocation.
    fn build_command(
        &self,
        kind: WorkerKind,
        model: Option<&str>,
        capabilities: &[Capability],
        custom_command: Option<&str>,
        workspace: &std::path::Path,
        env: &std::collections::HashMap<String, String>,
    ) -> Command {
        let spec = self.catalog.resolve(kind);
        let mut command = Command::new(&spec.bin);
        command.args(&spec.args);

        match kind {
            WorkerKind::Custom => {
                if let Some(custom) = custom_command {
                    command.arg(custom);
                }
            }
            _ => {
                if let Some(model) = model.or(spec.model.as_deref()) {
                    command.arg("--model").arg(model);
                }
            }
        }

        command
            .current_dir(workspace)
            .envs(env)
            .env(
                "CONVEYOR_CAPABILITIES",
                capabilities
                    .iter()
                    .map(|c| format!("{c:?}").to_lowercase())
                    .collect::<Vec<_>>()
                    .join(","),
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Spawn and drive one worker to completion, bounded by the timeout
    /// and the scoped abort.
    async fn drive(
        mut command: Command,
        instructions: &str,
        timeout: std::time::Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Option<WorkerOutput>, RunnerError> {
        let mut child = command.spawn().map_err(|e| RunnerError::Spawn(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(instructions.as_bytes()).await {
                tracing::debug!(error = %e, "worker stdin write failed");
            }
            drop(stdin);
        }

        let waited = tokio::select! {
            // Dropping the in-flight wait drops the child; kill_on_drop
            // reaps it. Report a graceful cancel.
            _ = cancel.cancelled() => return Ok(None),
            waited = tokio::time::timeout(timeout, child.wait_with_output()) => waited,
        };

        match waited {
            Ok(Ok(output)) => Ok(Some(WorkerOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })),
            Ok(Err(e)) => Err(RunnerError::Spawn(e.to_string())),
            // Attempt timeout: surface as a transient failure upstream.
            Err(_) => Ok(Some(WorkerOutput {
                exit_code: -2,
                stdout: String::new(),
                stderr: "worker timed out".to_string(),
            })),
        }
    }
}

impl StepRunner for LocalProcessRunner {
    async fn run_step(&self, request: StepRunRequest) -> StepRunResult {
        let Some(kind) = request.step.worker else {
            return StepRunResult::failed(
                ErrorClass::NonRetryable,
                "step has no worker (subworkflow steps use the workflow runner)",
            );
        };

        let command = self.build_command(
            kind,
            request.step.model.as_deref(),
            &request.step.capabilities,
            request.step.instructions.as_deref(),
            &request.workspace,
            &request.env,
        );

        tracing::debug!(
            step_id = request.step_id.as_str(),
            worker = ?kind,
            iteration = request.iteration,
            "spawning worker"
        );

        let driven =
            Self::drive(command, &request.instructions, request.timeout, &request.cancel).await;
        match driven {
            Ok(None) => StepRunResult::failed(ErrorClass::NonRetryable, "worker cancelled"),
            Ok(Some(output)) if output.exit_code == 0 => StepRunResult::succeeded(),
            Ok(Some(output)) if output.exit_code == -2 => {
                StepRunResult::failed(ErrorClass::RetryableTransient, "worker timed out")
            }
            Ok(Some(output)) => {
                let tail_start = output
                    .stderr
                    .char_indices()
                    .rev()
                    .nth(499)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                StepRunResult::failed(
                    ErrorClass::RetryableTransient,
                    format!(
                        "worker exited with {}: {}",
                        output.exit_code,
                        output.stderr[tail_start..].trim()
                    ),
                )
            }
            Err(e) => StepRunResult::failed(ErrorClass::NonRetryable, e.to_string()),
        }
    }

    async fn run_check(&self, request: CheckRequest) -> Result<CheckOutcome, RunnerError> {
        let started_at = SystemTime::now();
        let check = &request.check;

        let command = self.build_command(
            check.worker,
            check.model.as_deref(),
            &check.capabilities,
            check.command.as_deref(),
            &request.workspace,
            &request.env,
        );

        // The check id is embedded so the worker can reference it in its
        // decision file.
        let instructions = format!("{}\n\n(check id: {})", check.instructions, request.check_id);
        let output = Self::drive(command, &instructions, request.timeout, &request.cancel)
            .await?
            .ok_or(RunnerError::Cancelled)?;

        if check.worker == WorkerKind::Custom {
            let complete = custom_exit_decision(output.exit_code)?;
            return Ok(CheckOutcome { complete, fingerprints: Vec::new(), reason: None });
        }

        if output.exit_code != 0 {
            return Err(RunnerError::CheckFailed(format!(
                "check worker exited with {}",
                output.exit_code
            )));
        }

        let decision_file = check
            .decision_file
            .as_deref()
            .ok_or_else(|| RunnerError::CheckFailed("missing decision_file".to_string()))?;
        resolve_decision(
            &request.workspace,
            decision_file,
            &request.check_id,
            started_at,
            Some(&output.stdout),
        )
        .await
    }
}
