//! Workflow domain types: definitions, step shapes, and runtime state.
//!
//! A `WorkflowDefinition` is the parsed form of a workflow YAML file. Steps
//! keep their document order (admission and launch iteration is
//! deterministic), and each step is either a **leaf** (delegates to a worker
//! CLI) or a **subworkflow** (references another workflow file) — the two
//! shapes are mutually exclusive and checked during validation in
//! `conveyor-core`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::serde_ext::ordered_map;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Step ids that collide with context-directory bookkeeping entries.
pub const RESERVED_STEP_IDS: &[&str] = &[
    "_subworkflows",
    "_workflow",
    "_workflow.json",
    "_meta.json",
    "_resolved.json",
    "_convergence",
    "_management",
];

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// A parsed workflow definition (immutable for the life of a run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,
    /// Definition format version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Workflow-level timeout (duration string, e.g. "30m"). Required.
    pub timeout: String,
    /// Maximum steps in RUNNING/CHECKING at once (None = unbounded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Override for the context directory (defaults under the workspace).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_dir: Option<PathBuf>,
    /// Branch to create before the first step runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_branch: Option<String>,
    /// The one step allowed to move the workspace to a different branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_transition_step: Option<String>,
    /// Branch every other step must observe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_work_branch: Option<String>,
    /// Workflow-level management hook configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management: Option<ManagementConfig>,
    /// Steps in document order. Non-empty (validated).
    #[serde(deserialize_with = "ordered_map")]
    pub steps: Vec<(String, StepDefinition)>,
}

fn default_version() -> String {
    "1".to_string()
}

impl WorkflowDefinition {
    /// Look up a step definition by id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|(sid, _)| sid == id).map(|(_, s)| s)
    }
}

// ---------------------------------------------------------------------------
// Step definition
// ---------------------------------------------------------------------------

/// One step of the workflow DAG.
///
/// Exactly one of `worker` (leaf) or `workflow` (subworkflow) must be set;
/// `conveyor-core::workflow::definition` enforces the exclusivity and the
/// per-shape field rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Worker kind for a leaf step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerKind>,
    /// Workflow file path for a subworkflow step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<PathBuf>,
    /// Instructions handed to the worker (leaf only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Capabilities granted to the worker. Non-empty for leaves.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Model override for the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Workspace override (defaults to the workflow workspace).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    /// Step timeout (duration string). Advisory to the runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Retry attempts beyond the initial run when `on_failure = retry`.
    #[serde(default)]
    pub max_retries: u32,
    /// Upper bound on worker agent steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    /// Upper bound on a single worker command (duration string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_command_time: Option<String>,
    /// Step ids this step depends on (DAG edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Artifacts staged into the workspace before the step runs.
    #[serde(default)]
    pub inputs: Vec<ArtifactInput>,
    /// Artifacts collected from the workspace after the step succeeds.
    #[serde(default)]
    pub outputs: Vec<ArtifactOutput>,
    /// Artifacts re-exported from a subworkflow's context.
    #[serde(default)]
    pub exports: Vec<ArtifactOutput>,
    /// Per-iteration completion decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_check: Option<CompletionCheckDef>,
    /// Iteration cap when `completion_check` is set (must be >= 2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Failure policy.
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Policy when `max_iterations` is reached without completion.
    #[serde(default)]
    pub on_iterations_exhausted: OnIterationsExhausted,
    /// Convergence controller configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convergence: Option<ConvergenceConfig>,
    /// Step-level management override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management: Option<ManagementConfig>,
}

impl StepDefinition {
    /// True when this step references another workflow file.
    pub fn is_subworkflow(&self) -> bool {
        self.workflow.is_some()
    }
}

/// Worker CLI backing a leaf step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    CodexCli,
    ClaudeCode,
    Opencode,
    Custom,
}

/// Capability granted to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Edit,
    RunTests,
    RunCommands,
}

/// What to do when a step run fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Retry,
    Continue,
    #[default]
    Abort,
}

/// What to do when the completion-check iteration budget runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnIterationsExhausted {
    #[default]
    Abort,
    Continue,
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// An artifact copied from a predecessor's context into the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInput {
    /// Producing step id.
    pub from: String,
    /// Artifact name under `context/<from>/`.
    pub artifact: String,
    /// Destination name in the workspace (defaults to `artifact`).
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub rename: Option<String>,
}

/// An artifact collected from the workspace into `context/<step>/<name>/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactOutput {
    /// Artifact name in the context directory.
    pub name: String,
    /// Source path relative to the workspace.
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Completion check
// ---------------------------------------------------------------------------

/// Per-iteration completion decision definition.
///
/// Shares the worker surface of a leaf step. `decision_file` is required
/// unless `worker = custom`, which uses exit-code semantics instead
/// (0 = complete, 1 = incomplete, anything else = check failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionCheckDef {
    pub worker: WorkerKind,
    pub instructions: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_file: Option<String>,
    /// Command line for `custom` workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

// ---------------------------------------------------------------------------
// Convergence
// ---------------------------------------------------------------------------

/// Convergence controller configuration for an iterating step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Consecutive no-progress checks before the stage escalates.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
    /// Highest stage the controller will escalate to.
    #[serde(default = "default_max_stage")]
    pub max_stage: u32,
    /// Per-stage instruction appendices. Stage N (N >= 2) uses entry N-2;
    /// stages past the end reuse the last entry.
    #[serde(default)]
    pub stages: Vec<ConvergenceStage>,
    /// When set, any git-tracked change outside these globs forces the
    /// iteration INCOMPLETE regardless of the check verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_paths: Option<Vec<String>>,
    /// Fail the step when the max stage is reached with no progress.
    #[serde(default)]
    pub fail_on_max_stage: bool,
}

/// One escalation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceStage {
    pub append_instructions: String,
}

fn default_true() -> bool {
    true
}
fn default_stall_threshold() -> u32 {
    2
}
fn default_max_stage() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// Management hooks
// ---------------------------------------------------------------------------

/// Management-agent interposition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub pre_step: bool,
    #[serde(default)]
    pub post_step: bool,
    /// How long to wait for a decision (duration string, default "60s").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_timeout: Option<String>,
    /// Suppress the hook once the last N decisions were non-proceed.
    #[serde(default = "default_max_interventions")]
    pub max_consecutive_interventions: u32,
    /// Skip the hook when workflow remaining time is below this (duration).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_remaining_time: Option<String>,
}

fn default_max_interventions() -> u32 {
    3
}

/// Hook interposition points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    PreStep,
    PostStep,
}

impl HookPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::PreStep => "pre_step",
            HookPoint::PostStep => "post_step",
        }
    }
}

/// Directive returned by the management controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum ManagementDirective {
    Proceed,
    Skip { reason: String },
    ModifyInstructions { append: String },
    AbortWorkflow { reason: String },
    Annotate { message: String },
}

impl ManagementDirective {
    /// Directive name as logged in `decisions.jsonl`.
    pub fn name(&self) -> &'static str {
        match self {
            ManagementDirective::Proceed => "proceed",
            ManagementDirective::Skip { .. } => "skip",
            ManagementDirective::ModifyInstructions { .. } => "modify_instructions",
            ManagementDirective::AbortWorkflow { .. } => "abort_workflow",
            ManagementDirective::Annotate { .. } => "annotate",
        }
    }

    /// True for every directive other than `proceed`.
    pub fn is_intervention(&self) -> bool {
        !matches!(self, ManagementDirective::Proceed)
    }
}

/// Where a logged decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionSource {
    FileJson,
    None,
    Decided,
    Fallback,
    ToolCall,
}

/// One line of `context/_management/decisions.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub ts: DateTime<Utc>,
    pub hook_id: String,
    pub hook: HookPoint,
    pub step_id: String,
    pub directive: String,
    pub applied: bool,
    pub wall_time_ms: u64,
    pub source: DecisionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

/// Status of a single step. Transitions are monotone into the terminal set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Checking,
    Succeeded,
    Failed,
    Incomplete,
    Skipped,
    Cancelled,
    Omitted,
}

impl StepStatus {
    /// True for statuses no step ever leaves.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded
                | StepStatus::Failed
                | StepStatus::Incomplete
                | StepStatus::Skipped
                | StepStatus::Cancelled
                | StepStatus::Omitted
        )
    }

    /// True while the step occupies a concurrency slot.
    pub fn is_active(self) -> bool {
        matches!(self, StepStatus::Running | StepStatus::Checking)
    }
}

/// Runtime state of one step, snapshotted into the final `WorkflowState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    /// Current iteration, 1-based once the step has started.
    pub iteration: u32,
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Convergence stage (>= 1) when a convergence controller is attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convergence_stage: Option<u32>,
    /// Set while a management overlay is installed for the next iteration.
    #[serde(default)]
    pub management_pending: bool,
}

impl StepState {
    pub fn pending(max_iterations: u32) -> Self {
        Self {
            status: StepStatus::Pending,
            iteration: 0,
            max_iterations,
            started_at: None,
            completed_at: None,
            error: None,
            convergence_stage: None,
            management_pending: false,
        }
    }
}

/// Final status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

/// Result of a workflow run, returned by the executor and recorded by the
/// trigger engine as the last result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    /// Per-step final states, keyed by step id.
    pub steps: BTreeMap<String, StepState>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Synthesize a CANCELLED result without running anything (used when the
    /// daemon is shutting down or an evaluate gate says skip).
    pub fn cancelled(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: Uuid::now_v7(),
            name: name.into(),
            status: WorkflowStatus::Cancelled,
            steps: BTreeMap::new(),
            started_at: now,
            completed_at: now,
        }
    }

    /// Synthesize a FAILED result carrying an error message (used when the
    /// launcher itself failed before the executor produced a state).
    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut steps = BTreeMap::new();
        steps.insert(
            "_launch".to_string(),
            StepState {
                status: StepStatus::Failed,
                iteration: 0,
                max_iterations: 1,
                started_at: Some(now),
                completed_at: Some(now),
                error: Some(error.into()),
                convergence_stage: None,
                management_pending: false,
            },
        );
        Self {
            workflow_id: Uuid::now_v7(),
            name: name.into(),
            status: WorkflowStatus::Failed,
            steps,
            started_at: now,
            completed_at: now,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == WorkflowStatus::Succeeded
    }
}
