//! Permit-gate and worker-task types: jobs, rejections, error classes, and
//! step run results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of worker work submitted to the engine. Immutable per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    /// Worker/provider type (e.g. "claude_code"). The permit gate derives
    /// its circuit-breaker key from this.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Lower number = higher priority. Backpressure degrade mode lowers it.
    #[serde(default)]
    pub priority: u8,
    pub payload: Value,
    pub limits: JobLimits,
    pub context: JobContext,
}

/// Budget limits for one job attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLimits {
    pub timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Estimated cost deducted from the gate's budget on grant.
    #[serde(default)]
    pub cost_hint: f64,
}

fn default_max_attempts() -> u32 {
    1
}

/// Correlation metadata carried through the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobContext {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub correlation_id: String,
}

// ---------------------------------------------------------------------------
// Permit rejection
// ---------------------------------------------------------------------------

/// Why the permit gate refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    RateLimit,
    ConcurrencyLimit,
    BudgetExhausted,
    DuplicatePermit,
    FatalMode,
    CircuitOpen,
    GlobalShed,
    Deferred,
    QueueStall,
}

impl RejectReason {
    /// The error class a runner assigns when this rejection is final.
    pub fn error_class(self) -> ErrorClass {
        match self {
            RejectReason::FatalMode => ErrorClass::Fatal,
            RejectReason::BudgetExhausted | RejectReason::DuplicatePermit => {
                ErrorClass::NonRetryable
            }
            RejectReason::RateLimit => ErrorClass::RetryableRateLimit,
            RejectReason::CircuitOpen => ErrorClass::RetryableService,
            RejectReason::GlobalShed
            | RejectReason::ConcurrencyLimit
            | RejectReason::Deferred
            | RejectReason::QueueStall => ErrorClass::RetryableTransient,
        }
    }

    /// Rejections the permit-request loop must not retry past.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RejectReason::BudgetExhausted | RejectReason::FatalMode | RejectReason::DuplicatePermit
        )
    }
}

/// A refused permit request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermitRejection {
    pub reason: RejectReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PermitRejection {
    pub fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self { reason, detail: Some(detail.into()) }
    }
}

// ---------------------------------------------------------------------------
// Error classes and worker outcomes
// ---------------------------------------------------------------------------

/// Failure taxonomy driving retry and abort policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    Fatal,
    NonRetryable,
    RetryableTransient,
    RetryableRateLimit,
    RetryableService,
}

impl ErrorClass {
    /// True when `on_failure = retry` is allowed to re-attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::RetryableTransient
                | ErrorClass::RetryableRateLimit
                | ErrorClass::RetryableService
        )
    }
}

/// Terminal outcome reported by a worker for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Succeeded,
    Failed,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Step run results
// ---------------------------------------------------------------------------

/// Status of one step attempt as seen by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepRunStatus {
    Succeeded,
    Failed,
}

/// Normalized result of one step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunResult {
    pub status: StepRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Artifact names the worker reported producing.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Free-form worker observations (token counts, notes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observations: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl StepRunResult {
    pub fn succeeded() -> Self {
        Self {
            status: StepRunStatus::Succeeded,
            error_class: None,
            error: None,
            artifacts: Vec::new(),
            observations: None,
            cost: None,
        }
    }

    pub fn failed(class: ErrorClass, error: impl Into<String>) -> Self {
        Self {
            status: StepRunStatus::Failed,
            error_class: Some(class),
            error: Some(error.into()),
            artifacts: Vec::new(),
            observations: None,
            cost: None,
        }
    }

    /// Map a worker outcome onto the executor's result surface:
    /// CANCELLED becomes a non-retryable failure, FAILED keeps its error
    /// class (defaulting to retryable-transient).
    pub fn from_worker(status: WorkerStatus, error_class: Option<ErrorClass>, error: Option<String>) -> Self {
        match status {
            WorkerStatus::Succeeded => Self::succeeded(),
            WorkerStatus::Cancelled => Self::failed(
                ErrorClass::NonRetryable,
                error.unwrap_or_else(|| "worker cancelled".to_string()),
            ),
            WorkerStatus::Failed => Self::failed(
                error_class.unwrap_or(ErrorClass::RetryableTransient),
                error.unwrap_or_else(|| "worker failed".to_string()),
            ),
        }
    }
}

/// Verdict of one completion-check invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub complete: bool,
    /// Opaque progress fingerprints compared across iterations by the
    /// convergence controller.
    #[serde(default)]
    pub fingerprints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
