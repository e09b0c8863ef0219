//! The step-runner contract between the executor and worker backends.
//!
//! Two implementations live in `conveyor-infra`: the local worker-CLI
//! runner and the engine IPC runner (supervised mode). The executor is
//! generic over `R: StepRunner`, mirroring the storage-trait pattern used
//! throughout the workspace.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use conveyor_types::permit::{CheckOutcome, StepRunResult};
use conveyor_types::workflow::{CompletionCheckDef, StepDefinition};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from completion-check invocations. A check error marks the step
/// FAILED; run errors are encoded in `StepRunResult` instead.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("worker spawn failed: {0}")]
    Spawn(String),

    #[error("completion check produced no decision: {0}")]
    NoDecision(String),

    #[error("check execution failed: {0}")]
    CheckFailed(String),

    #[error("cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// One step attempt.
#[derive(Debug, Clone)]
pub struct StepRunRequest {
    pub step_id: String,
    pub step: StepDefinition,
    /// Fully composed instructions (base + convergence + management
    /// overlays). The runner uses this, not `step.instructions`.
    pub instructions: String,
    pub workspace: PathBuf,
    pub env: HashMap<String, String>,
    /// 1-based iteration of the completion-check loop.
    pub iteration: u32,
    /// Advisory budget for this attempt; also seeds permit deadlines.
    pub timeout: Duration,
    /// Scoped abort: fires on workflow timeout or daemon shutdown.
    pub cancel: CancellationToken,
}

/// One completion-check invocation.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub step_id: String,
    pub check: CompletionCheckDef,
    /// Fresh id the check worker may embed in its decision file.
    pub check_id: String,
    pub workspace: PathBuf,
    pub env: HashMap<String, String>,
    pub iteration: u32,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes steps and completion checks on behalf of the executor.
pub trait StepRunner: Send + Sync + 'static {
    /// Run one step attempt. Failures are reported in the result, not as
    /// errors; the runner must return promptly once `cancel` fires.
    fn run_step(
        &self,
        request: StepRunRequest,
    ) -> impl std::future::Future<Output = StepRunResult> + Send;

    /// Run one completion check.
    fn run_check(
        &self,
        request: CheckRequest,
    ) -> impl std::future::Future<Output = Result<CheckOutcome, RunnerError>> + Send;
}
