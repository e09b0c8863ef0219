//! Event-driven workflow DAG executor.
//!
//! The scheduling loop resolves PENDING steps against their dependencies,
//! launches READY steps up to the concurrency cap, and sleeps on a
//! single-slot notifier (`tokio::sync::Notify` — `notify_one` stores a
//! permit, giving the required pending-notification coalescing). Every step
//! lifecycle runs in its own task and reports transitions through the
//! shared step table, which is the only place statuses change.
//!
//! # Step lifecycle
//!
//! `PENDING -> READY -> RUNNING (-> CHECKING -> RUNNING)* -> terminal`,
//! with `SKIPPED` for unreachable steps, `CANCELLED` on workflow abort,
//! and `OMITTED` when a management hook declines the step. Terminal
//! statuses are never left.
//!
//! A single workflow abort signal drives the timeout; an optional external
//! signal (daemon shutdown) is linked into it. Step runners receive child
//! tokens and must return promptly once cancelled.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use conveyor_types::permit::{ErrorClass, StepRunStatus};
use conveyor_types::workflow::{
    HookPoint, ManagementDirective, OnFailure, OnIterationsExhausted, StepDefinition, StepState,
    StepStatus, WorkflowDefinition, WorkflowState, WorkflowStatus,
};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::util::duration::{parse_duration, parse_duration_or};
use crate::workflow::artifacts::{collect_outputs, stage_inputs, write_context_json};
use crate::workflow::branch::BranchGuard;
use crate::workflow::convergence::{compose_instructions, ConvergenceTracker};
use crate::workflow::definition::{validate_definition, WorkflowError};
use crate::workflow::management::ManagementHub;
use crate::workflow::runner::{CheckRequest, StepRunner, StepRunRequest};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default per-step timeout when the definition does not set one.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Retry backoff base; doubles per retry, capped below.
const RETRY_BACKOFF_BASE_MS: u64 = 100;
const RETRY_BACKOFF_CAP_MS: u64 = 5_000;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Catastrophic executor self-errors. Step failures never surface here —
/// they terminate through state transitions and land in the final
/// `WorkflowState`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Definition(#[from] WorkflowError),

    #[error("context initialization failed: {0}")]
    ContextInit(String),
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Executor wiring beyond the definition itself.
#[derive(Default)]
pub struct ExecutorOptions {
    /// External abort (daemon shutdown); linked into the workflow signal.
    pub external_cancel: Option<CancellationToken>,
    /// Branch-lock enforcement, when the definition declares expectations.
    pub branch_guard: Option<Arc<BranchGuard>>,
    /// Management-hook controller.
    pub management: Option<Arc<ManagementHub>>,
}

// ---------------------------------------------------------------------------
// Shared execution state
// ---------------------------------------------------------------------------

struct StepTable {
    steps: BTreeMap<String, StepState>,
    /// Steps whose failure skips dependents regardless of `on_failure`.
    force_abort: HashSet<String>,
    running: usize,
}

struct ExecCore {
    table: Mutex<StepTable>,
    notify: Notify,
    cancel: CancellationToken,
    timed_out: AtomicBool,
    external_cancelled: AtomicBool,
    management_abort: AtomicBool,
    concurrency: usize,
}

impl ExecCore {
    fn new(definition: &WorkflowDefinition) -> Self {
        let steps = definition
            .steps
            .iter()
            .map(|(id, step)| {
                (id.clone(), StepState::pending(step.max_iterations.unwrap_or(1)))
            })
            .collect();
        Self {
            table: Mutex::new(StepTable { steps, force_abort: HashSet::new(), running: 0 }),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            timed_out: AtomicBool::new(false),
            external_cancelled: AtomicBool::new(false),
            management_abort: AtomicBool::new(false),
            concurrency: definition.concurrency.unwrap_or(usize::MAX).max(1),
        }
    }

    fn status_of(&self, step_id: &str) -> StepStatus {
        self.table
            .lock()
            .unwrap()
            .steps
            .get(step_id)
            .map(|s| s.status)
            .unwrap_or(StepStatus::Pending)
    }

    fn iteration_of(&self, step_id: &str) -> u32 {
        self.table
            .lock()
            .unwrap()
            .steps
            .get(step_id)
            .map(|s| s.iteration)
            .unwrap_or(0)
    }

    fn all_terminal(&self) -> bool {
        self.table
            .lock()
            .unwrap()
            .steps
            .values()
            .all(|s| s.status.is_terminal())
    }

    /// Apply a transition if the step is not already terminal. Keeps the
    /// running count consistent and wakes the scheduling loop.
    fn transition(&self, step_id: &str, apply: impl FnOnce(&mut StepState)) {
        {
            let mut table = self.table.lock().unwrap();
            let Some(state) = table.steps.get_mut(step_id) else { return };
            if state.status.is_terminal() {
                return;
            }
            let was_active = state.status.is_active();
            apply(state);
            let is_active = state.status.is_active();
            if state.status.is_terminal() {
                state.completed_at = Some(Utc::now());
            }
            match (was_active, is_active) {
                (true, false) => table.running -= 1,
                (false, true) => table.running += 1,
                _ => {}
            }
        }
        self.notify.notify_one();
    }

    fn set_running(&self, step_id: &str) {
        self.transition(step_id, |s| s.status = StepStatus::Running);
    }

    fn set_checking(&self, step_id: &str) {
        self.transition(step_id, |s| s.status = StepStatus::Checking);
    }

    fn set_incomplete(&self, step_id: &str) {
        self.transition(step_id, |s| s.status = StepStatus::Incomplete);
    }

    fn set_omitted(&self, step_id: &str, reason: String) {
        tracing::info!(step_id, reason = reason.as_str(), "step omitted by management");
        self.transition(step_id, |s| {
            s.status = StepStatus::Omitted;
            s.error = None;
        });
    }

    fn mark_failed(&self, step_id: &str, error: String, abort_dependents: bool) {
        tracing::warn!(step_id, error = error.as_str(), "step failed");
        if abort_dependents {
            self.table.lock().unwrap().force_abort.insert(step_id.to_string());
        }
        self.transition(step_id, |s| {
            s.status = StepStatus::Failed;
            s.error = Some(error);
        });
    }

    fn mark_succeeded(&self, step_id: &str) {
        self.transition(step_id, |s| s.status = StepStatus::Succeeded);
    }

    fn bump_iteration(&self, step_id: &str) {
        self.transition(step_id, |s| s.iteration += 1);
    }

    fn set_convergence_stage(&self, step_id: &str, stage: u32) {
        self.transition(step_id, |s| s.convergence_stage = Some(stage));
    }

    fn set_management_pending(&self, step_id: &str, pending: bool) {
        self.transition(step_id, |s| s.management_pending = pending);
    }

    /// Workflow abort: cancel running work, skip everything not started.
    fn handle_abort(&self) {
        let mut table = self.table.lock().unwrap();
        let now = Utc::now();
        for state in table.steps.values_mut() {
            match state.status {
                StepStatus::Running | StepStatus::Checking => {
                    state.status = StepStatus::Cancelled;
                    state.error = Some("workflow aborted".to_string());
                    state.completed_at = Some(now);
                }
                StepStatus::Pending | StepStatus::Ready => {
                    state.status = StepStatus::Skipped;
                    state.completed_at = Some(now);
                }
                _ => {}
            }
        }
        table.running = 0;
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Executes one workflow definition against a step runner.
pub struct WorkflowExecutor<R: StepRunner> {
    definition: Arc<WorkflowDefinition>,
    runner: Arc<R>,
    workspace: PathBuf,
    context_dir: PathBuf,
    env: HashMap<String, String>,
    options: ExecutorOptions,
}

impl<R: StepRunner> WorkflowExecutor<R> {
    pub fn new(
        definition: WorkflowDefinition,
        runner: Arc<R>,
        workspace: PathBuf,
        context_dir: PathBuf,
        env: HashMap<String, String>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            definition: Arc::new(definition),
            runner,
            workspace,
            context_dir,
            env,
            options,
        }
    }

    /// Run the workflow to a final state.
    ///
    /// Returns `Err` only for definition validation and context-directory
    /// initialization failures; every runtime outcome is encoded in the
    /// returned `WorkflowState`.
    pub async fn execute(&self) -> Result<WorkflowState, ExecutorError> {
        validate_definition(&self.definition)?;
        let timeout = parse_duration(&self.definition.timeout).map_err(|e| {
            WorkflowError::InvalidDuration { field: "timeout".to_string(), reason: e.to_string() }
        })?;

        self.init_context().await?;

        let workflow_id = Uuid::now_v7();
        let started_at = Utc::now();

        if let Err(e) = write_context_json(
            &self.context_dir,
            std::path::Path::new("_workflow.json"),
            &json!({
                "id": workflow_id,
                "name": self.definition.name,
                "status": "RUNNING",
                "started_at": started_at,
            }),
        )
        .await
        {
            tracing::warn!(error = %e, "initial workflow record write failed");
        }
        let core = Arc::new(ExecCore::new(&self.definition));
        let deadline = tokio::time::Instant::now() + timeout;

        tracing::info!(
            workflow_id = %workflow_id,
            workflow = self.definition.name.as_str(),
            steps = self.definition.steps.len(),
            timeout_secs = timeout.as_secs(),
            "starting workflow execution"
        );

        // Timeout watchdog: fires the workflow abort.
        let watchdog = {
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                core.timed_out.store(true, Ordering::SeqCst);
                core.cancel.cancel();
            })
        };

        // External abort (daemon shutdown) links into the workflow signal.
        let external_link = self.options.external_cancel.clone().map(|external| {
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                external.cancelled().await;
                core.external_cancelled.store(true, Ordering::SeqCst);
                core.cancel.cancel();
            })
        });

        let mut lifecycles: JoinSet<()> = JoinSet::new();

        loop {
            self.update_ready_steps(&core);
            self.launch_ready_steps(&core, &mut lifecycles, deadline);

            if core.all_terminal() {
                break;
            }

            tokio::select! {
                _ = core.notify.notified() => {}
                _ = core.cancel.cancelled() => {
                    core.handle_abort();
                    break;
                }
            }
        }

        // Wait for lifecycles to observe the signal and wind down.
        while lifecycles.join_next().await.is_some() {}

        watchdog.abort();
        if let Some(link) = external_link {
            link.abort();
        }

        let status = self.resolve_status(&core);
        let steps = core.table.lock().unwrap().steps.clone();
        let state = WorkflowState {
            workflow_id,
            name: self.definition.name.clone(),
            status,
            steps,
            started_at,
            completed_at: Utc::now(),
        };

        if let Err(e) = write_context_json(
            &self.context_dir,
            std::path::Path::new("_workflow.json"),
            &json!({
                "id": state.workflow_id,
                "name": state.name,
                "status": state.status,
                "started_at": state.started_at,
                "completed_at": state.completed_at,
            }),
        )
        .await
        {
            tracing::warn!(error = %e, "final workflow record write failed");
        }

        tracing::info!(
            workflow_id = %workflow_id,
            status = ?state.status,
            "workflow execution finished"
        );
        Ok(state)
    }

    async fn init_context(&self) -> Result<(), ExecutorError> {
        let io = |e: std::io::Error| ExecutorError::ContextInit(e.to_string());
        tokio::fs::create_dir_all(&self.context_dir).await.map_err(io)?;
        for (step_id, _) in &self.definition.steps {
            tokio::fs::create_dir_all(self.context_dir.join(step_id)).await.map_err(io)?;
        }
        Ok(())
    }

    /// Resolve PENDING steps: skip the unreachable, ready the unblocked.
    /// Loops to a fixed point so skips propagate in one pass.
    fn update_ready_steps(&self, core: &ExecCore) {
        let mut table = core.table.lock().unwrap();
        loop {
            let mut changed = false;

            for (step_id, step) in &self.definition.steps {
                let pending = table
                    .steps
                    .get(step_id)
                    .is_some_and(|s| s.status == StepStatus::Pending);
                if !pending {
                    continue;
                }

                let mut next = StepStatus::Ready;
                for dep in &step.depends_on {
                    // Dependencies were validated against the step set.
                    let Some(dep_def) = self.definition.step(dep) else { continue };
                    let dep_status = table
                        .steps
                        .get(dep)
                        .map(|s| s.status)
                        .unwrap_or(StepStatus::Pending);
                    match dep_status {
                        StepStatus::Skipped | StepStatus::Cancelled => {
                            next = StepStatus::Skipped;
                            break;
                        }
                        StepStatus::Failed => {
                            let forced = table.force_abort.contains(dep);
                            if forced || dep_def.on_failure != OnFailure::Continue {
                                next = StepStatus::Skipped;
                                break;
                            }
                        }
                        // OMITTED allows progress; missing inputs are
                        // tolerated downstream.
                        StepStatus::Succeeded | StepStatus::Incomplete | StepStatus::Omitted => {}
                        _ => {
                            next = StepStatus::Pending;
                        }
                    }
                }

                if next != StepStatus::Pending {
                    if let Some(state) = table.steps.get_mut(step_id) {
                        state.status = next;
                        if next == StepStatus::Skipped {
                            state.completed_at = Some(Utc::now());
                        }
                        changed = true;
                    }
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Launch READY steps, in definition order, while slots remain.
    fn launch_ready_steps(
        &self,
        core: &Arc<ExecCore>,
        lifecycles: &mut JoinSet<()>,
        deadline: tokio::time::Instant,
    ) {
        let mut to_launch = Vec::new();
        {
            let mut table = core.table.lock().unwrap();
            for (step_id, _) in &self.definition.steps {
                if table.running >= core.concurrency {
                    break;
                }
                if let Some(state) = table.steps.get_mut(step_id) {
                    if state.status == StepStatus::Ready {
                        state.status = StepStatus::Running;
                        state.iteration = 1;
                        state.started_at = Some(Utc::now());
                        table.running += 1;
                        to_launch.push(step_id.clone());
                    }
                }
            }
        }

        for step_id in to_launch {
            tracing::debug!(step_id = step_id.as_str(), "launching step");
            let ctx = LifecycleCtx {
                core: Arc::clone(core),
                definition: Arc::clone(&self.definition),
                runner: Arc::clone(&self.runner),
                workspace: self.workspace.clone(),
                context_dir: self.context_dir.clone(),
                env: self.env.clone(),
                branch_guard: self.options.branch_guard.clone(),
                management: self.options.management.clone(),
                deadline,
                step_id,
            };
            lifecycles.spawn(step_lifecycle(ctx));
        }
    }

    fn resolve_status(&self, core: &ExecCore) -> WorkflowStatus {
        if core.timed_out.load(Ordering::SeqCst) {
            return WorkflowStatus::TimedOut;
        }
        if core.external_cancelled.load(Ordering::SeqCst)
            || core.management_abort.load(Ordering::SeqCst)
        {
            return WorkflowStatus::Cancelled;
        }
        let table = core.table.lock().unwrap();
        if table.steps.values().any(|s| s.status == StepStatus::Failed) {
            WorkflowStatus::Failed
        } else if table.steps.values().any(|s| s.status == StepStatus::Cancelled) {
            WorkflowStatus::Cancelled
        } else {
            WorkflowStatus::Succeeded
        }
    }
}

// ---------------------------------------------------------------------------
// Step lifecycle
// ---------------------------------------------------------------------------

struct LifecycleCtx<R: StepRunner> {
    core: Arc<ExecCore>,
    definition: Arc<WorkflowDefinition>,
    runner: Arc<R>,
    workspace: PathBuf,
    context_dir: PathBuf,
    env: HashMap<String, String>,
    branch_guard: Option<Arc<BranchGuard>>,
    management: Option<Arc<ManagementHub>>,
    deadline: tokio::time::Instant,
    step_id: String,
}

impl<R: StepRunner> LifecycleCtx<R> {
    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(tokio::time::Instant::now())
    }

    fn hook_input(&self, hook: HookPoint) -> serde_json::Value {
        json!({
            "workflow": self.definition.name,
            "hook": hook.as_str(),
            "step_id": self.step_id,
            "iteration": self.core.iteration_of(&self.step_id),
            "status": self.core.status_of(&self.step_id),
        })
    }
}

/// What a management directive told the lifecycle to do next.
enum HookFlow {
    Continue,
    ReturnNow,
}

async fn apply_hook<R: StepRunner>(
    ctx: &LifecycleCtx<R>,
    hook: HookPoint,
    management_overlay: &mut Option<String>,
) -> HookFlow {
    let Some(hub) = &ctx.management else { return HookFlow::Continue };
    if !hub.hook_enabled(hook) {
        return HookFlow::Continue;
    }

    let decision = hub
        .invoke(hook, &ctx.step_id, ctx.hook_input(hook), ctx.remaining())
        .await;
    if !decision.applied {
        return HookFlow::Continue;
    }

    match decision.directive {
        ManagementDirective::Proceed => {
            // Proceed clears any installed overlay.
            *management_overlay = None;
            ctx.core.set_management_pending(&ctx.step_id, false);
            HookFlow::Continue
        }
        ManagementDirective::Skip { reason } => {
            ctx.core.set_omitted(&ctx.step_id, reason);
            HookFlow::ReturnNow
        }
        ManagementDirective::ModifyInstructions { append } => {
            *management_overlay = Some(append);
            ctx.core.set_management_pending(&ctx.step_id, true);
            HookFlow::Continue
        }
        ManagementDirective::AbortWorkflow { reason } => {
            tracing::warn!(
                step_id = ctx.step_id.as_str(),
                reason = reason.as_str(),
                "management aborted workflow"
            );
            ctx.core.management_abort.store(true, Ordering::SeqCst);
            ctx.core.cancel.cancel();
            HookFlow::ReturnNow
        }
        ManagementDirective::Annotate { message } => {
            tracing::info!(
                step_id = ctx.step_id.as_str(),
                message = message.as_str(),
                "management annotation"
            );
            HookFlow::Continue
        }
    }
}

async fn step_lifecycle<R: StepRunner>(ctx: LifecycleCtx<R>) {
    let Some(step) = ctx.definition.step(&ctx.step_id).cloned() else {
        return;
    };
    let step_id = ctx.step_id.clone();
    let base_instructions = step.instructions.clone().unwrap_or_default();
    let max_iterations = step.max_iterations.unwrap_or(1);
    let step_timeout = parse_duration_or(step.timeout.as_deref(), DEFAULT_STEP_TIMEOUT);
    let step_workspace = step
        .workspace
        .clone()
        .map(|w| ctx.workspace.join(w))
        .unwrap_or_else(|| ctx.workspace.clone());

    let mut retry_count: u32 = 0;
    let mut management_overlay: Option<String> = None;
    let mut tracker = step
        .convergence
        .as_ref()
        .filter(|c| c.enabled)
        .map(|c| ConvergenceTracker::new(c.clone()));

    // Inputs stage once, before the first attempt; predecessors are
    // already terminal and their outputs collected.
    if let Err(e) = stage_inputs(&ctx.context_dir, &step_workspace, &step.inputs).await {
        ctx.core.mark_failed(&step_id, format!("input staging failed: {e}"), false);
        return;
    }

    if let Err(e) = write_context_json(
        &ctx.context_dir,
        &PathBuf::from(&step_id).join("_resolved.json"),
        &json!({
            "workerKind": step.worker,
            "timeoutMs": step_timeout.as_millis() as u64,
            "workspaceRef": step_workspace,
            "maxSteps": step.max_steps,
        }),
    )
    .await
    {
        tracing::debug!(error = %e, "resolved-params write failed");
    }

    if step.is_subworkflow() {
        run_subworkflow(&ctx, &step).await;
        return;
    }

    loop {
        if ctx.core.cancel.is_cancelled() {
            return;
        }

        // Pre-step management interposition.
        if matches!(
            apply_hook(&ctx, HookPoint::PreStep, &mut management_overlay).await,
            HookFlow::ReturnNow
        ) {
            return;
        }
        if ctx.core.cancel.is_cancelled() {
            return;
        }

        // Branch lock: drift fails the step and aborts dependents.
        if let Some(guard) = &ctx.branch_guard {
            if let Err(e) = guard.check_before_step(&step_id).await {
                ctx.core
                    .mark_failed(&step_id, format!("Branch drift detected: {e}"), true);
                return;
            }
        }

        ctx.core.set_running(&step_id);

        let instructions = compose_instructions(
            &base_instructions,
            tracker.as_ref().and_then(|t| t.stage_overlay()),
            management_overlay.as_deref(),
        );

        let result = ctx
            .runner
            .run_step(StepRunRequest {
                step_id: step_id.clone(),
                step: step.clone(),
                instructions,
                workspace: step_workspace.clone(),
                env: ctx.env.clone(),
                iteration: ctx.core.iteration_of(&step_id),
                timeout: step_timeout,
                cancel: ctx.core.cancel.child_token(),
            })
            .await;

        if ctx.core.cancel.is_cancelled() {
            return;
        }

        if result.status == StepRunStatus::Failed {
            let error = result.error.unwrap_or_else(|| "step failed".to_string());
            if result.error_class == Some(ErrorClass::Fatal) {
                // FATAL overrides on_failure entirely.
                ctx.core.mark_failed(&step_id, error, true);
                return;
            }

            let on_failure = step.on_failure;
            if on_failure == OnFailure::Retry && retry_count < step.max_retries {
                retry_count += 1;
                let backoff = Duration::from_millis(
                    (RETRY_BACKOFF_BASE_MS << (retry_count - 1).min(6)).min(RETRY_BACKOFF_CAP_MS),
                );
                tracing::debug!(
                    step_id = step_id.as_str(),
                    retry = retry_count,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying step"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = ctx.core.cancel.cancelled() => return,
                }
                continue;
            }

            ctx.core
                .mark_failed(&step_id, error, on_failure != OnFailure::Continue);
            return;
        }

        // Success. Without a completion check the step is done.
        let Some(check_def) = step.completion_check.clone() else {
            finish_success(&ctx, &step, &mut management_overlay).await;
            return;
        };

        ctx.core.set_checking(&step_id);
        let check_id = format!("chk-{}-{}", step_id, Uuid::now_v7());
        let check_timeout = parse_duration_or(check_def.timeout.as_deref(), step_timeout);
        let check = ctx
            .runner
            .run_check(CheckRequest {
                step_id: step_id.clone(),
                check: check_def,
                check_id,
                workspace: step_workspace.clone(),
                env: ctx.env.clone(),
                iteration: ctx.core.iteration_of(&step_id),
                timeout: check_timeout,
                cancel: ctx.core.cancel.child_token(),
            })
            .await;

        if ctx.core.cancel.is_cancelled() {
            return;
        }

        let outcome = match check {
            Ok(outcome) => outcome,
            Err(e) => {
                ctx.core.mark_failed(
                    &step_id,
                    format!("completion check failed: {e}"),
                    step.on_failure != OnFailure::Continue,
                );
                return;
            }
        };

        // Out-of-scope edits force INCOMPLETE regardless of the verdict.
        let mut complete = outcome.complete;
        if let (Some(t), Some(guard)) = (&tracker, &ctx.branch_guard) {
            match guard.changed_paths().await {
                Ok(changed) if t.paths_violation(&changed) => {
                    tracing::warn!(
                        step_id = step_id.as_str(),
                        "changes outside allowed paths, forcing incomplete"
                    );
                    complete = false;
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "changed-path probe failed"),
            }
        }

        // Post-step interposition between iterations.
        if matches!(
            apply_hook(&ctx, HookPoint::PostStep, &mut management_overlay).await,
            HookFlow::ReturnNow
        ) {
            return;
        }
        if ctx.core.cancel.is_cancelled() {
            return;
        }

        if let Some(t) = &mut tracker {
            let stage = t.observe(&outcome.fingerprints);
            ctx.core.set_convergence_stage(&step_id, stage);
            if !complete && t.exhausted() && t.fail_on_max_stage() {
                ctx.core.mark_failed(
                    &step_id,
                    "no progress at max convergence stage".to_string(),
                    step.on_failure != OnFailure::Continue,
                );
                return;
            }
        }

        if complete {
            finish_success(&ctx, &step, &mut management_overlay).await;
            return;
        }

        let iteration = ctx.core.iteration_of(&step_id);
        if iteration >= max_iterations {
            match step.on_iterations_exhausted {
                OnIterationsExhausted::Abort => {
                    ctx.core
                        .mark_failed(&step_id, "Max iterations exhausted".to_string(), true);
                }
                OnIterationsExhausted::Continue => {
                    ctx.core.set_incomplete(&step_id);
                }
            }
            return;
        }

        // Next iteration: overlays recompose at the top of the loop.
        ctx.core.bump_iteration(&step_id);
        retry_count = 0;
    }
}

/// Run a subworkflow step: load and execute the referenced workflow in a
/// nested executor, then re-export declared artifacts into the parent
/// context. Nested workflows inherit the runner and link into the parent's
/// abort signal; box-pinned to break the async recursion.
async fn run_subworkflow<R: StepRunner>(ctx: &LifecycleCtx<R>, step: &StepDefinition) {
    let step_id = &ctx.step_id;
    let Some(relative) = &step.workflow else { return };
    let path = ctx.workspace.join(relative);

    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) => {
            ctx.core.mark_failed(
                step_id,
                format!("subworkflow read {}: {e}", path.display()),
                step.on_failure != OnFailure::Continue,
            );
            return;
        }
    };
    let definition = match crate::workflow::definition::parse_workflow(&text) {
        Ok(definition) => definition,
        Err(e) => {
            ctx.core.mark_failed(
                step_id,
                format!("subworkflow invalid: {e}"),
                step.on_failure != OnFailure::Continue,
            );
            return;
        }
    };

    let sub_context = ctx.context_dir.join(step_id).join("_subworkflows");
    let executor = WorkflowExecutor::new(
        definition,
        Arc::clone(&ctx.runner),
        ctx.workspace.clone(),
        sub_context.clone(),
        ctx.env.clone(),
        ExecutorOptions {
            external_cancel: Some(ctx.core.cancel.child_token()),
            branch_guard: None,
            management: None,
        },
    );

    match Box::pin(executor.execute()).await {
        Ok(state) if state.status == WorkflowStatus::Succeeded => {
            if let Err(e) =
                collect_outputs(&ctx.context_dir, step_id, &sub_context, &step.exports).await
            {
                ctx.core.mark_failed(
                    step_id,
                    format!("subworkflow export failed: {e}"),
                    step.on_failure != OnFailure::Continue,
                );
                return;
            }
            ctx.core.mark_succeeded(step_id);
        }
        Ok(state) => {
            ctx.core.mark_failed(
                step_id,
                format!("subworkflow ended {:?}", state.status),
                step.on_failure != OnFailure::Continue,
            );
        }
        Err(e) => {
            ctx.core.mark_failed(
                step_id,
                format!("subworkflow failed to start: {e}"),
                step.on_failure != OnFailure::Continue,
            );
        }
    }
}

async fn finish_success<R: StepRunner>(
    ctx: &LifecycleCtx<R>,
    step: &StepDefinition,
    management_overlay: &mut Option<String>,
) {
    let step_workspace = step
        .workspace
        .clone()
        .map(|w| ctx.workspace.join(w))
        .unwrap_or_else(|| ctx.workspace.clone());

    if let Err(e) =
        collect_outputs(&ctx.context_dir, &ctx.step_id, &step_workspace, &step.outputs).await
    {
        ctx.core.mark_failed(
            &ctx.step_id,
            format!("output collection failed: {e}"),
            step.on_failure != OnFailure::Continue,
        );
        return;
    }

    // Post-step hook for steps without a check loop (annotate / abort).
    if step.completion_check.is_none()
        && matches!(
            apply_hook(ctx, HookPoint::PostStep, management_overlay).await,
            HookFlow::ReturnNow
        )
    {
        return;
    }

    ctx.core.mark_succeeded(&ctx.step_id);

    let meta = json!({
        "step_id": ctx.step_id,
        "iteration": ctx.core.iteration_of(&ctx.step_id),
        "completed_at": Utc::now(),
    });
    if let Err(e) = write_context_json(
        &ctx.context_dir,
        &PathBuf::from(&ctx.step_id).join("_meta.json"),
        &meta,
    )
    .await
    {
        tracing::debug!(error = %e, "step meta write failed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::management::ManagementEngine;
    use crate::workflow::runner::RunnerError;
    use conveyor_types::permit::{CheckOutcome, StepRunResult};
    use conveyor_types::workflow::ManagementConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    // -------------------------------------------------------------------
    // Scripted runner
    // -------------------------------------------------------------------

    #[derive(Clone)]
    enum RunScript {
        Succeed,
        SucceedAfter(Duration),
        Fail(ErrorClass),
        HangUntilCancel,
    }

    #[derive(Clone)]
    enum CheckScript {
        Complete,
        Incomplete(Vec<&'static str>),
        Broken,
    }

    #[derive(Default)]
    struct ScriptedRunner {
        runs: StdMutex<HashMap<String, VecDeque<RunScript>>>,
        checks: StdMutex<HashMap<String, VecDeque<CheckScript>>>,
        start_order: StdMutex<Vec<String>>,
        instructions: StdMutex<Vec<(String, String)>>,
        run_counts: StdMutex<HashMap<String, u32>>,
        check_counts: StdMutex<HashMap<String, u32>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedRunner {
        fn script_runs(&self, step_id: &str, scripts: Vec<RunScript>) {
            self.runs.lock().unwrap().insert(step_id.to_string(), scripts.into());
        }

        fn script_checks(&self, step_id: &str, scripts: Vec<CheckScript>) {
            self.checks.lock().unwrap().insert(step_id.to_string(), scripts.into());
        }

        fn run_count(&self, step_id: &str) -> u32 {
            *self.run_counts.lock().unwrap().get(step_id).unwrap_or(&0)
        }

        fn check_count(&self, step_id: &str) -> u32 {
            *self.check_counts.lock().unwrap().get(step_id).unwrap_or(&0)
        }

        fn order(&self) -> Vec<String> {
            self.start_order.lock().unwrap().clone()
        }
    }

    impl StepRunner for ScriptedRunner {
        async fn run_step(&self, request: StepRunRequest) -> StepRunResult {
            self.start_order.lock().unwrap().push(request.step_id.clone());
            self.instructions
                .lock()
                .unwrap()
                .push((request.step_id.clone(), request.instructions.clone()));
            *self.run_counts.lock().unwrap().entry(request.step_id.clone()).or_insert(0) += 1;

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let script = self
                .runs
                .lock()
                .unwrap()
                .get_mut(&request.step_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(RunScript::Succeed);

            let result = match script {
                RunScript::Succeed => StepRunResult::succeeded(),
                RunScript::SucceedAfter(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => StepRunResult::succeeded(),
                        _ = request.cancel.cancelled() => {
                            StepRunResult::failed(ErrorClass::NonRetryable, "cancelled")
                        }
                    }
                }
                RunScript::Fail(class) => StepRunResult::failed(class, "scripted failure"),
                RunScript::HangUntilCancel => {
                    request.cancel.cancelled().await;
                    StepRunResult::failed(ErrorClass::NonRetryable, "cancelled")
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn run_check(
            &self,
            request: CheckRequest,
        ) -> Result<CheckOutcome, RunnerError> {
            *self.check_counts.lock().unwrap().entry(request.step_id.clone()).or_insert(0) += 1;

            let script = self
                .checks
                .lock()
                .unwrap()
                .get_mut(&request.step_id)
                .and_then(|q| q.pop_front())
                .unwrap_or(CheckScript::Complete);

            match script {
                CheckScript::Complete => {
                    Ok(CheckOutcome { complete: true, fingerprints: vec![], reason: None })
                }
                CheckScript::Incomplete(prints) => Ok(CheckOutcome {
                    complete: false,
                    fingerprints: prints.iter().map(|s| s.to_string()).collect(),
                    reason: None,
                }),
                CheckScript::Broken => Err(RunnerError::NoDecision("scripted".to_string())),
            }
        }
    }

    // -------------------------------------------------------------------
    // Harness
    // -------------------------------------------------------------------

    fn parse(yaml: &str) -> WorkflowDefinition {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    async fn run(
        definition: WorkflowDefinition,
        runner: Arc<ScriptedRunner>,
        options: ExecutorOptions,
    ) -> WorkflowState {
        let workspace = tempfile::tempdir().unwrap();
        let context = tempfile::tempdir().unwrap();
        let executor = WorkflowExecutor::new(
            definition,
            runner,
            workspace.path().to_path_buf(),
            context.path().to_path_buf(),
            HashMap::new(),
            options,
        );
        executor.execute().await.unwrap()
    }

    const LINEAR: &str = r#"
name: linear
timeout: 30s
steps:
  a:
    worker: custom
    instructions: "do a"
    capabilities: [read]
  b:
    worker: custom
    instructions: "do b"
    capabilities: [read]
    depends_on: [a]
  c:
    worker: custom
    instructions: "do c"
    capabilities: [read]
    depends_on: [b]
"#;

    // S1: linear DAG, all succeed, observed order a, b, c.
    #[tokio::test]
    async fn test_linear_dag_succeeds_in_order() {
        let runner = Arc::new(ScriptedRunner::default());
        let state = run(parse(LINEAR), Arc::clone(&runner), ExecutorOptions::default()).await;

        assert_eq!(state.status, WorkflowStatus::Succeeded);
        assert_eq!(runner.order(), vec!["a", "b", "c"]);
        for id in ["a", "b", "c"] {
            let step = &state.steps[id];
            assert_eq!(step.status, StepStatus::Succeeded, "step {id}");
            assert_eq!(step.iteration, 1, "step {id}");
            assert!(step.started_at.is_some() && step.completed_at.is_some());
        }
    }

    // S2: fan-out A -> {B, C} -> D with parallelism observed.
    #[tokio::test]
    async fn test_fan_out_runs_concurrently() {
        let yaml = r#"
name: fanout
timeout: 30s
concurrency: 4
steps:
  a:
    worker: custom
    instructions: "root"
    capabilities: [read]
  b:
    worker: custom
    instructions: "left"
    capabilities: [read]
    depends_on: [a]
  c:
    worker: custom
    instructions: "right"
    capabilities: [read]
    depends_on: [a]
  d:
    worker: custom
    instructions: "join"
    capabilities: [read]
    depends_on: [b, c]
"#;
        let runner = Arc::new(ScriptedRunner::default());
        for id in ["a", "b", "c", "d"] {
            runner.script_runs(id, vec![RunScript::SucceedAfter(Duration::from_millis(10))]);
        }

        let state = run(parse(yaml), Arc::clone(&runner), ExecutorOptions::default()).await;
        assert_eq!(state.status, WorkflowStatus::Succeeded);

        let order = runner.order();
        assert_eq!(order.first().map(String::as_str), Some("a"));
        assert_eq!(order.last().map(String::as_str), Some("d"));
        assert!(
            runner.peak.load(Ordering::SeqCst) >= 2,
            "b and c should overlap, peak was {}",
            runner.peak.load(Ordering::SeqCst)
        );
    }

    // S3: completion-check loop converges on the third iteration.
    #[tokio::test]
    async fn test_completion_check_iterations() {
        let yaml = r#"
name: looped
timeout: 30s
steps:
  s:
    worker: custom
    instructions: "iterate"
    capabilities: [read, edit]
    max_iterations: 5
    completion_check:
      worker: custom
      instructions: "done?"
      command: "check.sh"
"#;
        let runner = Arc::new(ScriptedRunner::default());
        runner.script_checks(
            "s",
            vec![
                CheckScript::Incomplete(vec![]),
                CheckScript::Incomplete(vec![]),
                CheckScript::Complete,
            ],
        );

        let state = run(parse(yaml), Arc::clone(&runner), ExecutorOptions::default()).await;
        assert_eq!(state.status, WorkflowStatus::Succeeded);
        assert_eq!(state.steps["s"].status, StepStatus::Succeeded);
        assert_eq!(state.steps["s"].iteration, 3);
        assert_eq!(runner.run_count("s"), 3);
        assert_eq!(runner.check_count("s"), 3);
    }

    // S4: iterations exhausted with abort skips the dependent.
    #[tokio::test]
    async fn test_iterations_exhausted_aborts() {
        let yaml = r#"
name: exhausted
timeout: 30s
steps:
  s:
    worker: custom
    instructions: "never done"
    capabilities: [read]
    max_iterations: 3
    completion_check:
      worker: custom
      instructions: "done?"
      command: "check.sh"
  t:
    worker: custom
    instructions: "downstream"
    capabilities: [read]
    depends_on: [s]
"#;
        let runner = Arc::new(ScriptedRunner::default());
        runner.script_checks(
            "s",
            vec![
                CheckScript::Incomplete(vec!["a"]),
                CheckScript::Incomplete(vec!["b"]),
                CheckScript::Incomplete(vec!["c"]),
            ],
        );

        let state = run(parse(yaml), Arc::clone(&runner), ExecutorOptions::default()).await;
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.steps["s"].status, StepStatus::Failed);
        assert_eq!(state.steps["s"].error.as_deref(), Some("Max iterations exhausted"));
        assert_eq!(state.steps["t"].status, StepStatus::Skipped);
        assert_eq!(runner.run_count("s"), 3);
    }

    // S4 variant: on_iterations_exhausted = continue yields INCOMPLETE.
    #[tokio::test]
    async fn test_iterations_exhausted_continue_is_incomplete() {
        let yaml = r#"
name: incomplete
timeout: 30s
steps:
  s:
    worker: custom
    instructions: "never done"
    capabilities: [read]
    max_iterations: 2
    on_iterations_exhausted: continue
    completion_check:
      worker: custom
      instructions: "done?"
      command: "check.sh"
  t:
    worker: custom
    instructions: "downstream"
    capabilities: [read]
    depends_on: [s]
"#;
        let runner = Arc::new(ScriptedRunner::default());
        runner.script_checks(
            "s",
            vec![CheckScript::Incomplete(vec![]), CheckScript::Incomplete(vec![])],
        );

        let state = run(parse(yaml), Arc::clone(&runner), ExecutorOptions::default()).await;
        // INCOMPLETE allows the dependent and does not fail the workflow.
        assert_eq!(state.steps["s"].status, StepStatus::Incomplete);
        assert_eq!(state.steps["t"].status, StepStatus::Succeeded);
        assert_eq!(state.status, WorkflowStatus::Succeeded);
    }

    // S5: retry with exponential backoff.
    #[tokio::test]
    async fn test_retry_with_backoff() {
        let yaml = r#"
name: retry
timeout: 30s
steps:
  s:
    worker: custom
    instructions: "flaky"
    capabilities: [read]
    on_failure: retry
    max_retries: 2
"#;
        let runner = Arc::new(ScriptedRunner::default());
        runner.script_runs(
            "s",
            vec![RunScript::Fail(ErrorClass::RetryableTransient), RunScript::Succeed],
        );

        let started = std::time::Instant::now();
        let state = run(parse(yaml), Arc::clone(&runner), ExecutorOptions::default()).await;
        let elapsed = started.elapsed();

        assert_eq!(state.status, WorkflowStatus::Succeeded);
        assert_eq!(runner.run_count("s"), 2);
        assert!(elapsed >= Duration::from_millis(100), "backoff base, got {elapsed:?}");
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_and_skips() {
        let yaml = r#"
name: retry-out
timeout: 30s
steps:
  s:
    worker: custom
    instructions: "flaky"
    capabilities: [read]
    on_failure: retry
    max_retries: 1
  t:
    worker: custom
    instructions: "downstream"
    capabilities: [read]
    depends_on: [s]
"#;
        let runner = Arc::new(ScriptedRunner::default());
        runner.script_runs(
            "s",
            vec![
                RunScript::Fail(ErrorClass::RetryableTransient),
                RunScript::Fail(ErrorClass::RetryableTransient),
            ],
        );

        let state = run(parse(yaml), Arc::clone(&runner), ExecutorOptions::default()).await;
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.steps["s"].status, StepStatus::Failed);
        assert_eq!(state.steps["t"].status, StepStatus::Skipped);
        assert_eq!(runner.run_count("s"), 2, "initial + one retry");
    }

    // S8: workflow timeout cancels in-flight work, skips the rest.
    #[tokio::test]
    async fn test_workflow_timeout() {
        let yaml = r#"
name: timeout
timeout: 500ms
steps:
  a:
    worker: custom
    instructions: "hang"
    capabilities: [read]
  b:
    worker: custom
    instructions: "never"
    capabilities: [read]
    depends_on: [a]
"#;
        let runner = Arc::new(ScriptedRunner::default());
        runner.script_runs("a", vec![RunScript::HangUntilCancel]);

        let state = run(parse(yaml), Arc::clone(&runner), ExecutorOptions::default()).await;
        assert_eq!(state.status, WorkflowStatus::TimedOut);
        assert_eq!(state.steps["a"].status, StepStatus::Cancelled);
        assert_eq!(state.steps["b"].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_external_cancel_yields_cancelled() {
        let yaml = r#"
name: external
timeout: 30s
steps:
  a:
    worker: custom
    instructions: "hang"
    capabilities: [read]
"#;
        let runner = Arc::new(ScriptedRunner::default());
        runner.script_runs("a", vec![RunScript::HangUntilCancel]);

        let external = CancellationToken::new();
        let trip = external.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trip.cancel();
        });

        let state = run(
            parse(yaml),
            Arc::clone(&runner),
            ExecutorOptions { external_cancel: Some(external), ..Default::default() },
        )
        .await;
        assert_eq!(state.status, WorkflowStatus::Cancelled);
        assert_eq!(state.steps["a"].status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_on_failure_continue_lets_dependents_run() {
        let yaml = r#"
name: continue
timeout: 30s
steps:
  a:
    worker: custom
    instructions: "fails"
    capabilities: [read]
    on_failure: continue
  b:
    worker: custom
    instructions: "still runs"
    capabilities: [read]
    depends_on: [a]
"#;
        let runner = Arc::new(ScriptedRunner::default());
        runner.script_runs("a", vec![RunScript::Fail(ErrorClass::NonRetryable)]);

        let state = run(parse(yaml), Arc::clone(&runner), ExecutorOptions::default()).await;
        assert_eq!(state.steps["a"].status, StepStatus::Failed);
        assert_eq!(state.steps["b"].status, StepStatus::Succeeded);
        // A failed step still fails the workflow.
        assert_eq!(state.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_fatal_overrides_continue() {
        let yaml = r#"
name: fatal
timeout: 30s
steps:
  a:
    worker: custom
    instructions: "fatal"
    capabilities: [read]
    on_failure: continue
  b:
    worker: custom
    instructions: "never"
    capabilities: [read]
    depends_on: [a]
"#;
        let runner = Arc::new(ScriptedRunner::default());
        runner.script_runs("a", vec![RunScript::Fail(ErrorClass::Fatal)]);

        let state = run(parse(yaml), Arc::clone(&runner), ExecutorOptions::default()).await;
        assert_eq!(state.steps["a"].status, StepStatus::Failed);
        assert_eq!(state.steps["b"].status, StepStatus::Skipped, "FATAL ignores continue");
        assert_eq!(state.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_concurrency_cap_serializes() {
        let yaml = r#"
name: capped
timeout: 30s
concurrency: 1
steps:
  a:
    worker: custom
    instructions: "one"
    capabilities: [read]
  b:
    worker: custom
    instructions: "two"
    capabilities: [read]
"#;
        let runner = Arc::new(ScriptedRunner::default());
        for id in ["a", "b"] {
            runner.script_runs(id, vec![RunScript::SucceedAfter(Duration::from_millis(20))]);
        }

        let state = run(parse(yaml), Arc::clone(&runner), ExecutorOptions::default()).await;
        assert_eq!(state.status, WorkflowStatus::Succeeded);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_check_error_fails_step() {
        let yaml = r#"
name: badcheck
timeout: 30s
steps:
  s:
    worker: custom
    instructions: "x"
    capabilities: [read]
    max_iterations: 3
    completion_check:
      worker: custom
      instructions: "done?"
      command: "check.sh"
"#;
        let runner = Arc::new(ScriptedRunner::default());
        runner.script_checks("s", vec![CheckScript::Broken]);

        let state = run(parse(yaml), Arc::clone(&runner), ExecutorOptions::default()).await;
        assert_eq!(state.steps["s"].status, StepStatus::Failed);
        assert!(state.steps["s"].error.as_deref().unwrap().contains("completion check"));
    }

    #[tokio::test]
    async fn test_convergence_overlay_composed_after_stall() {
        let yaml = r#"
name: converge
timeout: 30s
steps:
  s:
    worker: custom
    instructions: "base work"
    capabilities: [read, edit]
    max_iterations: 5
    convergence:
      enabled: true
      stall_threshold: 1
      max_stage: 3
      stages:
        - append_instructions: "Narrow the scope."
    completion_check:
      worker: custom
      instructions: "done?"
      command: "check.sh"
"#;
        let runner = Arc::new(ScriptedRunner::default());
        runner.script_checks(
            "s",
            vec![
                CheckScript::Incomplete(vec!["same"]),
                CheckScript::Incomplete(vec!["same"]),
                CheckScript::Complete,
            ],
        );

        let state = run(parse(yaml), Arc::clone(&runner), ExecutorOptions::default()).await;
        assert_eq!(state.status, WorkflowStatus::Succeeded);
        assert_eq!(state.steps["s"].convergence_stage, Some(2));

        let instructions = runner.instructions.lock().unwrap().clone();
        assert_eq!(instructions.len(), 3);
        assert!(!instructions[0].1.contains("[Convergence Controller]"));
        // The stall is observed after iteration 2's check, so iteration 3
        // carries the escalated overlay.
        assert!(instructions[2].1.contains("[Convergence Controller] Narrow the scope."));
        assert!(instructions[2].1.starts_with("base work"));
    }

    #[tokio::test]
    async fn test_management_skip_marks_omitted() {
        let yaml = r#"
name: managed
timeout: 30s
management:
  enabled: true
  pre_step: true
steps:
  a:
    worker: custom
    instructions: "runs"
    capabilities: [read]
  b:
    worker: custom
    instructions: "skipped by mgmt"
    capabilities: [read]
    depends_on: [a]
  c:
    worker: custom
    instructions: "still runs"
    capabilities: [read]
    depends_on: [b]
"#;
        let definition = parse(yaml);
        let mgmt_dir = tempfile::tempdir().unwrap();
        let engine: ManagementEngine = Arc::new(|invocation| {
            Box::pin(async move {
                if invocation.step_id == "b" {
                    Some(ManagementDirective::Skip { reason: "redundant".to_string() })
                } else {
                    Some(ManagementDirective::Proceed)
                }
            })
        });
        let hub = Arc::new(ManagementHub::new(
            mgmt_dir.path().to_path_buf(),
            definition.management.clone().unwrap_or(ManagementConfig {
                enabled: true,
                pre_step: true,
                post_step: false,
                agent_timeout: None,
                max_consecutive_interventions: 10,
                min_remaining_time: None,
            }),
            Some(engine),
        ));

        let runner = Arc::new(ScriptedRunner::default());
        let state = run(
            definition,
            Arc::clone(&runner),
            ExecutorOptions { management: Some(hub), ..Default::default() },
        )
        .await;

        assert_eq!(state.steps["a"].status, StepStatus::Succeeded);
        assert_eq!(state.steps["b"].status, StepStatus::Omitted);
        // OMITTED is success-equivalent for dependents.
        assert_eq!(state.steps["c"].status, StepStatus::Succeeded);
        assert_eq!(state.status, WorkflowStatus::Succeeded);
        assert_eq!(runner.run_count("b"), 0, "omitted step never ran");
    }

    #[tokio::test]
    async fn test_management_abort_cancels_workflow() {
        let yaml = r#"
name: mgmt-abort
timeout: 30s
management:
  enabled: true
  pre_step: true
steps:
  a:
    worker: custom
    instructions: "denied"
    capabilities: [read]
"#;
        let definition = parse(yaml);
        let mgmt_dir = tempfile::tempdir().unwrap();
        let engine: ManagementEngine = Arc::new(|_invocation| {
            Box::pin(async move {
                Some(ManagementDirective::AbortWorkflow { reason: "policy".to_string() })
            })
        });
        let hub = Arc::new(ManagementHub::new(
            mgmt_dir.path().to_path_buf(),
            definition.management.clone().unwrap(),
            Some(engine),
        ));

        let runner = Arc::new(ScriptedRunner::default());
        let state = run(
            definition,
            Arc::clone(&runner),
            ExecutorOptions { management: Some(hub), ..Default::default() },
        )
        .await;

        assert_eq!(state.status, WorkflowStatus::Cancelled);
        assert_eq!(runner.run_count("a"), 0);
    }

    #[tokio::test]
    async fn test_subworkflow_step_runs_nested() {
        let workspace = tempfile::tempdir().unwrap();
        let context = tempfile::tempdir().unwrap();
        tokio::fs::write(
            workspace.path().join("sub.yaml"),
            r#"
name: nested
timeout: 10s
steps:
  inner:
    worker: custom
    instructions: "nested work"
    capabilities: [read]
"#,
        )
        .await
        .unwrap();

        let yaml = r#"
name: parent
timeout: 30s
steps:
  sub:
    workflow: sub.yaml
  after:
    worker: custom
    instructions: "after"
    capabilities: [read]
    depends_on: [sub]
"#;
        let runner = Arc::new(ScriptedRunner::default());
        let executor = WorkflowExecutor::new(
            parse(yaml),
            Arc::clone(&runner),
            workspace.path().to_path_buf(),
            context.path().to_path_buf(),
            HashMap::new(),
            ExecutorOptions::default(),
        );
        let state = executor.execute().await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Succeeded);
        assert_eq!(state.steps["sub"].status, StepStatus::Succeeded);
        assert_eq!(state.steps["after"].status, StepStatus::Succeeded);
        let order = runner.order();
        assert_eq!(order, vec!["inner", "after"], "nested step runs before the dependent");
    }

    #[tokio::test]
    async fn test_subworkflow_missing_file_fails_step() {
        let workspace = tempfile::tempdir().unwrap();
        let context = tempfile::tempdir().unwrap();
        let yaml = r#"
name: parent
timeout: 30s
steps:
  sub:
    workflow: ghost.yaml
"#;
        let runner = Arc::new(ScriptedRunner::default());
        let executor = WorkflowExecutor::new(
            parse(yaml),
            runner,
            workspace.path().to_path_buf(),
            context.path().to_path_buf(),
            HashMap::new(),
            ExecutorOptions::default(),
        );
        let state = executor.execute().await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.steps["sub"].error.as_deref().unwrap().contains("subworkflow read"));
    }

    #[tokio::test]
    async fn test_step_statuses_are_monotone_terminal() {
        // After a full run every step is terminal; no PENDING/READY leaks.
        let runner = Arc::new(ScriptedRunner::default());
        let state = run(parse(LINEAR), runner, ExecutorOptions::default()).await;
        assert!(state.steps.values().all(|s| s.status.is_terminal()));
    }
}
