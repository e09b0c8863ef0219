//! The daemon's workflow invoker: everything between "a trigger fired"
//! and "the executor returned".
//!
//! Per invocation: sanitize the trigger id for on-disk naming, run the
//! optional evaluate gate, stage trigger context (`last-result.json`,
//! `event.json`, env), load and validate the workflow definition, wire the
//! executor (branch guard, management hub, shutdown link), execute, then
//! run the optional analyze worker. Failures before the executor produce a
//! FAILED `WorkflowState` so the trigger engine's failure counting still
//! applies.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use conveyor_core::daemon::WorkflowInvoker;
use conveyor_core::state::StateStore;
use conveyor_core::workflow::branch::{BranchGuard, BranchPolicy};
use conveyor_core::workflow::definition::parse_workflow;
use conveyor_core::workflow::management::ManagementHub;
use conveyor_core::util::TemplateContext;
use conveyor_core::workflow::runner::{CheckRequest, RunnerError, StepRunner, StepRunRequest};
use conveyor_core::workflow::{ExecutorOptions, WorkflowExecutor};
use conveyor_infra::git;
use conveyor_infra::ipc::{EngineConnection, EngineRunnerOptions, EngineStepRunner};
use conveyor_infra::state::FsStateStore;
use conveyor_infra::worker::LocalProcessRunner;
use conveyor_types::config::{sanitize_id, AgentCatalog, DaemonConfig};
use conveyor_types::event::Event;
use conveyor_types::permit::{CheckOutcome, StepRunResult};
use conveyor_types::trigger::TriggerDef;
use conveyor_types::workflow::{CompletionCheckDef, WorkflowState};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Gate/analyze worker budget.
const HOOK_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Runner selection
// ---------------------------------------------------------------------------

/// Local or supervised execution backend.
pub enum WorkerBackend {
    Local(LocalProcessRunner),
    Engine(EngineStepRunner),
}

impl StepRunner for WorkerBackend {
    async fn run_step(&self, request: StepRunRequest) -> StepRunResult {
        match self {
            WorkerBackend::Local(r) => r.run_step(request).await,
            WorkerBackend::Engine(r) => r.run_step(request).await,
        }
    }

    async fn run_check(&self, request: CheckRequest) -> Result<CheckOutcome, RunnerError> {
        match self {
            WorkerBackend::Local(r) => r.run_check(request).await,
            WorkerBackend::Engine(r) => r.run_check(request).await,
        }
    }
}

// ---------------------------------------------------------------------------
// DaemonInvoker
// ---------------------------------------------------------------------------

/// Application-layer workflow execution for the daemon.
pub struct DaemonInvoker {
    config: DaemonConfig,
    catalog: AgentCatalog,
    store: Arc<FsStateStore>,
    /// Daemon shutdown; linked into every executor.
    shutdown: CancellationToken,
    /// Engine connection in supervised mode.
    engine: Option<Arc<EngineConnection>>,
}

impl DaemonInvoker {
    pub fn new(
        config: DaemonConfig,
        catalog: AgentCatalog,
        store: Arc<FsStateStore>,
        shutdown: CancellationToken,
        engine: Option<Arc<EngineConnection>>,
    ) -> Self {
        Self { config, catalog, store, shutdown, engine }
    }

    fn backend(&self) -> Arc<WorkerBackend> {
        Arc::new(match &self.engine {
            Some(conn) => WorkerBackend::Engine(EngineStepRunner::new(
                Arc::clone(conn),
                EngineRunnerOptions::default(),
            )),
            None => WorkerBackend::Local(LocalProcessRunner::new(self.catalog.clone())),
        })
    }

    /// Run a gate/analyze worker; `None` means it could not decide.
    async fn run_hook_check(
        &self,
        label: String,
        check: &CompletionCheckDef,
        env: &HashMap<String, String>,
    ) -> Option<CheckOutcome> {
        let result = self
            .backend()
            .run_check(CheckRequest {
                step_id: label,
                check: check.clone(),
                check_id: format!("hook-{}", Uuid::now_v7()),
                workspace: self.config.workspace.clone(),
                env: env.clone(),
                iteration: 1,
                timeout: HOOK_TIMEOUT,
                cancel: self.shutdown.child_token(),
            })
            .await;
        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!(error = %e, "hook worker failed");
                None
            }
        }
    }

    async fn try_execute(
        &self,
        trigger_id: &str,
        trigger: &TriggerDef,
        event: &Event,
    ) -> anyhow::Result<WorkflowState> {
        let safe_id = sanitize_id(trigger_id);
        let workspace = self.config.workspace.clone();
        let context_dir = workspace.join(".conveyor").join("context").join(&safe_id);
        tokio::fs::create_dir_all(&context_dir).await?;

        // Per-workflow env from the trigger's context block. Values may
        // reference the fixed template variable set.
        let mut template = TemplateContext::new();
        template.trigger_id = Some(trigger_id.to_string());
        template.timestamp = Some(chrono::Utc::now().to_rfc3339());
        if let Ok(Some(state)) = self.store.load(trigger_id).await {
            template.execution_count = Some(state.execution_count);
        }
        if let Ok(Some(last)) = self.store.load_last_result(trigger_id).await {
            template.workflow_status = serde_json::to_value(last.status)
                .ok()
                .and_then(|v| v.as_str().map(String::from));
        }

        let mut env: HashMap<String, String> = HashMap::new();
        if let Some(context) = &trigger.context {
            for (key, value) in &context.env {
                env.insert(key.clone(), template.render(value));
            }
        }

        // Evaluate gate: an incomplete verdict means "skip this firing".
        if let Some(gate) = &trigger.evaluate {
            let verdict = self
                .run_hook_check(format!("{safe_id}-evaluate"), gate, &env)
                .await;
            if let Some(outcome) = verdict {
                if !outcome.complete {
                    tracing::info!(
                        trigger_id,
                        reason = outcome.reason.as_deref().unwrap_or(""),
                        "evaluate gate skipped this firing"
                    );
                    return Ok(WorkflowState::cancelled(
                        trigger.workflow.display().to_string(),
                    ));
                }
            }
        }

        // Context staging.
        if let Some(context) = &trigger.context {
            if context.last_result {
                if let Ok(Some(last)) = self.store.load_last_result(trigger_id).await {
                    tokio::fs::write(
                        context_dir.join("last-result.json"),
                        serde_json::to_vec_pretty(&last)?,
                    )
                    .await?;
                }
            }
            if context.event_payload {
                tokio::fs::write(
                    context_dir.join("event.json"),
                    serde_json::to_vec_pretty(&event.to_json())?,
                )
                .await?;
            }
        }

        // Load and validate the workflow definition.
        let path = workspace.join(&trigger.workflow);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?;
        let definition = parse_workflow(&text)?;

        // Branch lock, when the definition declares expectations.
        let branch_guard = definition.expected_work_branch.as_ref().map(|expected| {
            Arc::new(BranchGuard::new(
                git::inspect_fn(),
                Some(git::changed_fn()),
                BranchPolicy {
                    expected_work_branch: Some(expected.clone()),
                    transition_step: definition.branch_transition_step.clone(),
                    protected_branches: Vec::new(),
                    allow_protected: false,
                },
                workspace.clone(),
            ))
        });

        // Management hub, when enabled.
        let management = definition
            .management
            .clone()
            .filter(|m| m.enabled)
            .map(|m| Arc::new(ManagementHub::new(context_dir.join("_management"), m, None)));

        let executor = WorkflowExecutor::new(
            definition,
            self.backend(),
            workspace,
            context_dir,
            env.clone(),
            ExecutorOptions {
                external_cancel: Some(self.shutdown.child_token()),
                branch_guard,
                management,
            },
        );
        let state = executor.execute().await?;

        // Post-run analysis is best-effort and never changes the result.
        if let Some(analyze) = &trigger.analyze {
            let _ = self
                .run_hook_check(format!("{safe_id}-analyze"), analyze, &env)
                .await;
        }

        Ok(state)
    }
}

impl WorkflowInvoker for DaemonInvoker {
    async fn execute(
        &self,
        trigger_id: String,
        trigger: TriggerDef,
        event: Event,
    ) -> WorkflowState {
        match self.try_execute(&trigger_id, &trigger, &event).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(
                    trigger_id = trigger_id.as_str(),
                    error = %e,
                    "workflow invocation failed"
                );
                WorkflowState::failed(trigger.workflow.display().to_string(), e.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// One-shot execution (workflow run)
// ---------------------------------------------------------------------------

/// Execute a workflow file once against the local worker runner.
pub async fn run_workflow_once(
    file: &PathBuf,
    workspace: PathBuf,
    catalog: AgentCatalog,
) -> anyhow::Result<WorkflowState> {
    let text = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| anyhow::anyhow!("read {}: {e}", file.display()))?;
    let definition = parse_workflow(&text)?;

    let context_dir = workspace.join(".conveyor").join("context").join("oneshot");
    let management = definition
        .management
        .clone()
        .filter(|m| m.enabled)
        .map(|m| Arc::new(ManagementHub::new(context_dir.join("_management"), m, None)));

    let executor = WorkflowExecutor::new(
        definition,
        Arc::new(WorkerBackend::Local(LocalProcessRunner::new(catalog))),
        workspace,
        context_dir,
        HashMap::new(),
        ExecutorOptions { management, ..Default::default() },
    );
    Ok(executor.execute().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::workflow::WorkflowStatus;

    #[tokio::test]
    async fn test_run_workflow_once_custom_steps() {
        let workspace = tempfile::tempdir().unwrap();
        let file = workspace.path().join("wf.yaml");
        tokio::fs::write(
            &file,
            r#"
name: smoke
timeout: 30s
steps:
  touch:
    worker: custom
    instructions: "echo made > made.txt"
    capabilities: [run_commands]
  verify:
    worker: custom
    instructions: "test -f made.txt"
    capabilities: [read]
    depends_on: [touch]
"#,
        )
        .await
        .unwrap();

        let state = run_workflow_once(
            &file,
            workspace.path().to_path_buf(),
            AgentCatalog::default(),
        )
        .await
        .unwrap();
        assert_eq!(state.status, WorkflowStatus::Succeeded);
        assert!(workspace.path().join("made.txt").exists());
    }

    #[tokio::test]
    async fn test_run_workflow_once_rejects_invalid() {
        let workspace = tempfile::tempdir().unwrap();
        let file = workspace.path().join("wf.yaml");
        tokio::fs::write(&file, "name: bad\ntimeout: 1m\nsteps: {}\n").await.unwrap();

        let result = run_workflow_once(
            &file,
            workspace.path().to_path_buf(),
            AgentCatalog::default(),
        )
        .await;
        assert!(result.is_err());
    }
}
