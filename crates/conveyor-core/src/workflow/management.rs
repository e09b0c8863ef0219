//! Management-hook interposition.
//!
//! At `pre_step` / `post_step` the executor asks the management controller
//! for a directive. Each invocation writes `inv/<hook_id>/input.json` under
//! `context/_management/`, then either calls a pluggable engine callback or
//! waits for `decision.json` to appear, bounded by the agent timeout. A
//! missing decision or engine error falls back to `proceed` with
//! `applied = false`. Every decision is appended to `decisions.jsonl`.
//!
//! Guards: the hook is suppressed once the last
//! `max_consecutive_interventions` decisions were non-proceed, and when the
//! workflow's remaining time is below `min_remaining_time`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use conveyor_types::workflow::{
    DecisionRecord, DecisionSource, HookPoint, ManagementConfig, ManagementDirective,
};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::util::duration::parse_duration_or;

// ---------------------------------------------------------------------------
// Engine callback
// ---------------------------------------------------------------------------

/// One hook invocation handed to a management engine.
#[derive(Debug, Clone)]
pub struct HookInvocation {
    pub hook_id: String,
    pub hook: HookPoint,
    pub step_id: String,
    pub input: Value,
    /// `inv/<hook_id>/` directory for this invocation.
    pub dir: PathBuf,
}

/// Out-of-band decision engine. Returns `None` when it could not decide
/// (the hub falls back to `proceed`).
pub type ManagementEngine =
    Arc<dyn Fn(HookInvocation) -> BoxFuture<'static, Option<ManagementDirective>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// A resolved hook decision.
#[derive(Debug, Clone)]
pub struct ManagementDecision {
    pub directive: ManagementDirective,
    /// False when the directive is a fallback, not a real decision.
    pub applied: bool,
    pub source: DecisionSource,
}

impl ManagementDecision {
    fn fallback(source: DecisionSource) -> Self {
        Self { directive: ManagementDirective::Proceed, applied: false, source }
    }
}

// ---------------------------------------------------------------------------
// ManagementHub
// ---------------------------------------------------------------------------

/// Coordinates hook invocations for one workflow run.
pub struct ManagementHub {
    /// `context/_management/` for this run.
    dir: PathBuf,
    config: ManagementConfig,
    agent_timeout: Duration,
    min_remaining: Option<Duration>,
    engine: Option<ManagementEngine>,
    consecutive_interventions: Mutex<u32>,
}

impl ManagementHub {
    pub fn new(dir: PathBuf, config: ManagementConfig, engine: Option<ManagementEngine>) -> Self {
        let agent_timeout =
            parse_duration_or(config.agent_timeout.as_deref(), Duration::from_secs(60));
        let min_remaining = config
            .min_remaining_time
            .as_deref()
            .map(|t| parse_duration_or(Some(t), Duration::from_secs(0)));
        Self {
            dir,
            config,
            agent_timeout,
            min_remaining,
            engine,
            consecutive_interventions: Mutex::new(0),
        }
    }

    pub fn hook_enabled(&self, hook: HookPoint) -> bool {
        self.config.enabled
            && match hook {
                HookPoint::PreStep => self.config.pre_step,
                HookPoint::PostStep => self.config.post_step,
            }
    }

    /// Run one hook and return its decision. Never fails: every path
    /// resolves to a directive, with fallback `proceed` where needed.
    pub async fn invoke(
        &self,
        hook: HookPoint,
        step_id: &str,
        input: Value,
        workflow_remaining: Duration,
    ) -> ManagementDecision {
        let started = Instant::now();
        let hook_id = format!("{}-{}-{}", hook.as_str(), step_id, Uuid::now_v7());

        // Guard: not enough workflow time left to consult the agent.
        if let Some(min) = self.min_remaining {
            if workflow_remaining < min {
                let decision = ManagementDecision::fallback(DecisionSource::None);
                self.log_decision(&hook_id, hook, step_id, &decision, started, Some("low remaining time"))
                    .await;
                return decision;
            }
        }

        // Guard: too many consecutive interventions.
        {
            let count = self.consecutive_interventions.lock().await;
            if *count >= self.config.max_consecutive_interventions {
                let decision = ManagementDecision::fallback(DecisionSource::None);
                self.log_decision(&hook_id, hook, step_id, &decision, started, Some("intervention cap"))
                    .await;
                return decision;
            }
        }

        let inv_dir = self.dir.join("inv").join(&hook_id);
        if let Err(e) = tokio::fs::create_dir_all(&inv_dir).await {
            tracing::warn!(hook_id = hook_id.as_str(), error = %e, "hook dir create failed");
            let decision = ManagementDecision::fallback(DecisionSource::Fallback);
            self.log_decision(&hook_id, hook, step_id, &decision, started, Some("io error")).await;
            return decision;
        }
        if let Err(e) = tokio::fs::write(
            inv_dir.join("input.json"),
            serde_json::to_vec_pretty(&input).unwrap_or_default(),
        )
        .await
        {
            tracing::warn!(hook_id = hook_id.as_str(), error = %e, "hook input write failed");
        }

        let decision = match &self.engine {
            Some(engine) => {
                let invocation = HookInvocation {
                    hook_id: hook_id.clone(),
                    hook,
                    step_id: step_id.to_string(),
                    input,
                    dir: inv_dir.clone(),
                };
                match tokio::time::timeout(self.agent_timeout, engine(invocation)).await {
                    Ok(Some(directive)) => ManagementDecision {
                        directive,
                        applied: true,
                        source: DecisionSource::Decided,
                    },
                    Ok(None) => ManagementDecision::fallback(DecisionSource::Fallback),
                    Err(_) => {
                        tracing::warn!(hook_id = hook_id.as_str(), "management engine timed out");
                        ManagementDecision::fallback(DecisionSource::Fallback)
                    }
                }
            }
            None => self.await_decision_file(&inv_dir).await,
        };

        // Track the intervention streak.
        {
            let mut count = self.consecutive_interventions.lock().await;
            if decision.applied && decision.directive.is_intervention() {
                *count += 1;
            } else if decision.applied {
                *count = 0;
            }
        }

        self.log_decision(&hook_id, hook, step_id, &decision, started, None).await;
        decision
    }

    /// Poll `decision.json` until the agent timeout elapses.
    async fn await_decision_file(&self, inv_dir: &std::path::Path) -> ManagementDecision {
        let path = inv_dir.join("decision.json");
        let deadline = Instant::now() + self.agent_timeout;

        loop {
            if let Ok(text) = tokio::fs::read_to_string(&path).await {
                match serde_json::from_str::<ManagementDirective>(&text) {
                    Ok(directive) => {
                        return ManagementDecision {
                            directive,
                            applied: true,
                            source: DecisionSource::FileJson,
                        };
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "bad decision file");
                        return ManagementDecision::fallback(DecisionSource::Fallback);
                    }
                }
            }
            if Instant::now() >= deadline {
                return ManagementDecision::fallback(DecisionSource::Fallback);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn log_decision(
        &self,
        hook_id: &str,
        hook: HookPoint,
        step_id: &str,
        decision: &ManagementDecision,
        started: Instant,
        reason: Option<&str>,
    ) {
        let record = DecisionRecord {
            ts: Utc::now(),
            hook_id: hook_id.to_string(),
            hook,
            step_id: step_id.to_string(),
            directive: decision.directive.name().to_string(),
            applied: decision.applied,
            wall_time_ms: started.elapsed().as_millis() as u64,
            source: decision.source,
            reason: reason.map(String::from),
        };

        if let Err(e) = self.append_jsonl(&record).await {
            tracing::warn!(error = %e, "decisions.jsonl append failed");
        }
    }

    async fn append_jsonl(&self, record: &DecisionRecord) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_vec(record).unwrap_or_default();
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("decisions.jsonl"))
            .await?;
        file.write_all(&line).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(pre: bool, post: bool) -> ManagementConfig {
        ManagementConfig {
            enabled: true,
            pre_step: pre,
            post_step: post,
            agent_timeout: Some("200ms".to_string()),
            max_consecutive_interventions: 3,
            min_remaining_time: None,
        }
    }

    fn engine_returning(directive: Option<ManagementDirective>) -> ManagementEngine {
        Arc::new(move |_inv| {
            let d = directive.clone();
            Box::pin(async move { d })
        })
    }

    #[tokio::test]
    async fn test_hook_enabled_flags() {
        let dir = tempfile::tempdir().unwrap();
        let hub = ManagementHub::new(dir.path().to_path_buf(), config(true, false), None);
        assert!(hub.hook_enabled(HookPoint::PreStep));
        assert!(!hub.hook_enabled(HookPoint::PostStep));
    }

    #[tokio::test]
    async fn test_engine_decision_applied_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let hub = ManagementHub::new(
            dir.path().to_path_buf(),
            config(true, true),
            Some(engine_returning(Some(ManagementDirective::Skip {
                reason: "redundant".to_string(),
            }))),
        );

        let decision = hub
            .invoke(HookPoint::PreStep, "build", json!({}), Duration::from_secs(600))
            .await;
        assert!(decision.applied);
        assert_eq!(decision.source, DecisionSource::Decided);
        assert!(matches!(decision.directive, ManagementDirective::Skip { .. }));

        let log = tokio::fs::read_to_string(dir.path().join("decisions.jsonl")).await.unwrap();
        assert!(log.contains("\"skip\""));
        assert!(log.contains("pre_step"));
    }

    #[tokio::test]
    async fn test_missing_decision_falls_back_to_proceed() {
        let dir = tempfile::tempdir().unwrap();
        let hub = ManagementHub::new(dir.path().to_path_buf(), config(true, true), None);

        let decision = hub
            .invoke(HookPoint::PreStep, "build", json!({}), Duration::from_secs(600))
            .await;
        assert!(!decision.applied);
        assert_eq!(decision.directive, ManagementDirective::Proceed);
        assert_eq!(decision.source, DecisionSource::Fallback);

        // input.json was still written.
        let inv = dir.path().join("inv");
        let mut entries = tokio::fs::read_dir(&inv).await.unwrap();
        let entry = entries.next_entry().await.unwrap().unwrap();
        assert!(tokio::fs::metadata(entry.path().join("input.json")).await.is_ok());
    }

    #[tokio::test]
    async fn test_decision_file_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(ManagementHub::new(dir.path().to_path_buf(), config(true, true), None));

        // Writer task drops decision.json into whichever inv dir appears.
        let inv_root = dir.path().join("inv");
        let writer = tokio::spawn(async move {
            loop {
                if let Ok(mut entries) = tokio::fs::read_dir(&inv_root).await {
                    if let Ok(Some(entry)) = entries.next_entry().await {
                        tokio::fs::write(
                            entry.path().join("decision.json"),
                            r#"{"directive":"modify_instructions","append":"tighten scope"}"#,
                        )
                        .await
                        .unwrap();
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let decision = hub
            .invoke(HookPoint::PostStep, "build", json!({}), Duration::from_secs(600))
            .await;
        writer.await.unwrap();

        assert!(decision.applied);
        assert_eq!(decision.source, DecisionSource::FileJson);
        assert!(matches!(decision.directive, ManagementDirective::ModifyInstructions { .. }));
    }

    #[tokio::test]
    async fn test_intervention_cap_suppresses_hook() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(true, true);
        cfg.max_consecutive_interventions = 2;
        let hub = ManagementHub::new(
            dir.path().to_path_buf(),
            cfg,
            Some(engine_returning(Some(ManagementDirective::ModifyInstructions {
                append: "x".to_string(),
            }))),
        );

        for _ in 0..2 {
            let d = hub
                .invoke(HookPoint::PreStep, "s", json!({}), Duration::from_secs(600))
                .await;
            assert!(d.applied);
        }
        // Third call is suppressed.
        let d = hub.invoke(HookPoint::PreStep, "s", json!({}), Duration::from_secs(600)).await;
        assert!(!d.applied);
        assert_eq!(d.source, DecisionSource::None);
    }

    #[tokio::test]
    async fn test_min_remaining_time_guard() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(true, true);
        cfg.min_remaining_time = Some("5m".to_string());
        let hub = ManagementHub::new(
            dir.path().to_path_buf(),
            cfg,
            Some(engine_returning(Some(ManagementDirective::Skip { reason: "x".to_string() }))),
        );

        let d = hub.invoke(HookPoint::PreStep, "s", json!({}), Duration::from_secs(10)).await;
        assert!(!d.applied, "hook skipped below the remaining-time floor");
        assert_eq!(d.source, DecisionSource::None);
    }
}
