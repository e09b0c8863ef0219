//! Branch lock: the workspace git branch must stay on the expected work
//! branch for the life of a workflow, except across the one nominated
//! transition step. Protected branches are refused outright unless
//! explicitly allowed.
//!
//! Git access is injected as boxed async callbacks so the executor stays
//! agnostic of how the repository is inspected (`conveyor-infra` shells
//! out to the git CLI).

use std::path::PathBuf;

use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::util::glob::matches_any;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from branch-lock enforcement.
#[derive(Debug, thiserror::Error)]
pub enum BranchError {
    #[error("git inspection failed: {0}")]
    Probe(String),

    #[error("branch drift detected: on '{actual}', expected '{expected}'")]
    Drift { actual: String, expected: String },

    #[error("execution on protected branch '{0}' is blocked")]
    Protected(String),
}

// ---------------------------------------------------------------------------
// Probe callbacks
// ---------------------------------------------------------------------------

/// Snapshot of the repository position.
#[derive(Debug, Clone)]
pub struct BranchInfo {
    pub toplevel: PathBuf,
    pub branch: String,
    pub head: String,
}

/// Inspect the repository at a workspace path.
pub type GitInspectFn =
    Arc<dyn Fn(PathBuf) -> BoxFuture<'static, Result<BranchInfo, BranchError>> + Send + Sync>;

/// List git-tracked paths changed in the working tree.
pub type GitChangedFn =
    Arc<dyn Fn(PathBuf) -> BoxFuture<'static, Result<Vec<String>, BranchError>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Policy and guard
// ---------------------------------------------------------------------------

/// Branch expectations for one workflow.
#[derive(Debug, Clone, Default)]
pub struct BranchPolicy {
    /// Branch every step must observe.
    pub expected_work_branch: Option<String>,
    /// The one step allowed to move the branch.
    pub transition_step: Option<String>,
    /// Glob list of branches execution is blocked on.
    pub protected_branches: Vec<String>,
    /// Explicit override for protected branches.
    pub allow_protected: bool,
}

/// Enforces a `BranchPolicy` before each step.
pub struct BranchGuard {
    inspect: GitInspectFn,
    changed: Option<GitChangedFn>,
    policy: BranchPolicy,
    workspace: PathBuf,
    /// The transition step may change the branch exactly once.
    transition_used: Mutex<bool>,
    /// Expected branch, updated after a legal transition.
    expected: Mutex<Option<String>>,
}

impl BranchGuard {
    pub fn new(
        inspect: GitInspectFn,
        changed: Option<GitChangedFn>,
        policy: BranchPolicy,
        workspace: PathBuf,
    ) -> Self {
        let expected = policy.expected_work_branch.clone();
        Self {
            inspect,
            changed,
            policy,
            workspace,
            transition_used: Mutex::new(false),
            expected: Mutex::new(expected),
        }
    }

    /// Check the repository position before launching `step_id`.
    pub async fn check_before_step(&self, step_id: &str) -> Result<(), BranchError> {
        let info = (self.inspect)(self.workspace.clone()).await?;

        if matches_any(&self.policy.protected_branches, &info.branch)
            && !self.policy.allow_protected
        {
            return Err(BranchError::Protected(info.branch));
        }

        let mut expected = self.expected.lock().await;
        let Some(expected_branch) = expected.as_ref() else {
            return Ok(());
        };

        if info.branch == *expected_branch {
            return Ok(());
        }

        // Drift — tolerated exactly once, across the nominated transition
        // step, which re-baselines the expectation.
        let mut used = self.transition_used.lock().await;
        if !*used && self.policy.transition_step.as_deref() == Some(step_id) {
            tracing::info!(
                step_id,
                from = expected_branch.as_str(),
                to = info.branch.as_str(),
                "branch transition observed"
            );
            *used = true;
            *expected = Some(info.branch);
            return Ok(());
        }

        Err(BranchError::Drift { actual: info.branch, expected: expected_branch.clone() })
    }

    /// Paths changed in the working tree (for convergence allowed-paths).
    pub async fn changed_paths(&self) -> Result<Vec<String>, BranchError> {
        match &self.changed {
            Some(changed) => (changed)(self.workspace.clone()).await,
            None => Ok(Vec::new()),
        }
    }
}
