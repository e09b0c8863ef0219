//! Trigger admission engine.
//!
//! `handle_event` walks the triggers bound to the event's source in config
//! order and produces exactly one `TriggerAction` per trigger:
//!
//! 1. disabled (config or sticky state)
//! 2. filtered (field rules)
//! 3. debounced (event-timestamp window)
//! 4. cooldown (wall-clock quiet period)
//! 5. launch -> queued (no state change) or executed (state updated,
//!    failure counting, auto-pause, persistence)
//!
//! Debounce compares event timestamps; cooldown compares the wall clock.
//! A `Queued` outcome leaves the trigger state bitwise unchanged.

use chrono::Utc;
use conveyor_types::event::Event;
use conveyor_types::trigger::{
    OnWorkflowFailure, ScheduleOutcome, TriggerAction, TriggerDef, TriggerState,
};
use conveyor_types::workflow::WorkflowState;
use serde_json::json;

use crate::state::{StateStore, StateStoreError};
use crate::trigger::filter::match_filter;
use crate::util::duration::parse_duration;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from event handling. Launch failures are folded into the workflow
/// result; only persistence failures propagate.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error("invalid trigger '{trigger_id}': {reason}")]
    InvalidTrigger { trigger_id: String, reason: String },
}

// ---------------------------------------------------------------------------
// WorkflowLauncher
// ---------------------------------------------------------------------------

/// The dispatch surface the engine fires workflows through.
///
/// An `Err` is treated as a failed workflow run (status FAILED), not as an
/// engine error — state updates and failure counting still apply.
pub trait WorkflowLauncher: Send + Sync {
    fn launch(
        &self,
        trigger_id: &str,
        trigger: &TriggerDef,
        event: &Event,
    ) -> impl std::future::Future<Output = Result<ScheduleOutcome, String>> + Send;
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Tunables for behaviors the source material leaves open.
#[derive(Debug, Clone, Default)]
pub struct TriggerEngineOptions {
    /// Clear `cooldown_until` when a trigger auto-pauses. Default false:
    /// the cooldown survives so a re-enabled trigger does not fire
    /// immediately.
    pub clear_cooldown_on_pause: bool,
}

// ---------------------------------------------------------------------------
// TriggerEngine
// ---------------------------------------------------------------------------

/// Per-event admission over the configured trigger set.
pub struct TriggerEngine<S: StateStore> {
    /// Triggers in config order; iteration order is deterministic.
    triggers: Vec<(String, TriggerDef)>,
    store: S,
    options: TriggerEngineOptions,
}

impl<S: StateStore> TriggerEngine<S> {
    pub fn new(triggers: Vec<(String, TriggerDef)>, store: S) -> Self {
        Self { triggers, store, options: TriggerEngineOptions::default() }
    }

    pub fn with_options(mut self, options: TriggerEngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Handle one event: one `TriggerAction` per trigger bound to its
    /// source, in config order.
    pub async fn handle_event<L: WorkflowLauncher>(
        &self,
        event: &Event,
        launcher: &L,
    ) -> Result<Vec<TriggerAction>, TriggerError> {
        let mut actions = Vec::new();
        let event_json = event.to_json();

        for (trigger_id, trigger) in self.triggers.iter().filter(|(_, t)| t.on == event.source_id) {
            let action = self
                .admit_one(trigger_id, trigger, event, &event_json, launcher)
                .await?;
            tracing::info!(
                trigger_id = trigger_id.as_str(),
                source_id = event.source_id.as_str(),
                action = action.kind(),
                "trigger action"
            );
            actions.push(action);
        }

        Ok(actions)
    }

    async fn admit_one<L: WorkflowLauncher>(
        &self,
        trigger_id: &str,
        trigger: &TriggerDef,
        event: &Event,
        event_json: &serde_json::Value,
        launcher: &L,
    ) -> Result<TriggerAction, TriggerError> {
        let state = self.store.load(trigger_id).await?.unwrap_or_default();

        // 1. Enable switches: persisted state is sticky, config wins too.
        if !state.enabled || trigger.enabled == Some(false) {
            return Ok(TriggerAction::Disabled { trigger_id: trigger_id.to_string() });
        }

        // 2. Field filter.
        if let Some(filter) = &trigger.filter {
            if !match_filter(filter, event_json) {
                return Ok(TriggerAction::Filtered { trigger_id: trigger_id.to_string() });
            }
        }

        // 3. Debounce, on event timestamps.
        if let Some(debounce) = &trigger.debounce {
            let window = parse_duration(debounce).map_err(|e| TriggerError::InvalidTrigger {
                trigger_id: trigger_id.to_string(),
                reason: e.to_string(),
            })?;
            if let Some(last) = state.last_fired_at {
                if event.timestamp_ms < last + window.as_millis() as u64 {
                    return Ok(TriggerAction::Debounced { trigger_id: trigger_id.to_string() });
                }
            }
        }

        // 4. Cooldown, on the wall clock.
        let wall_now_ms = Utc::now().timestamp_millis() as u64;
        if let Some(until) = state.cooldown_until {
            if wall_now_ms < until {
                return Ok(TriggerAction::Cooldown { trigger_id: trigger_id.to_string() });
            }
        }

        // 5. Launch. Queued leaves state untouched; a launch error counts
        // as a failed run.
        let result = match launcher.launch(trigger_id, trigger, event).await {
            Ok(ScheduleOutcome::Queued) => {
                return Ok(TriggerAction::Queued { trigger_id: trigger_id.to_string() });
            }
            Ok(ScheduleOutcome::Executed(result)) => result,
            Err(error) => {
                tracing::warn!(trigger_id, error = error.as_str(), "workflow launch failed");
                WorkflowState::failed(trigger.workflow.display().to_string(), error)
            }
        };

        // 6.-7. State update and auto-pause.
        let succeeded = result.succeeded();
        let mut updated = state.clone();
        updated.last_fired_at = Some(event.timestamp_ms);
        updated.execution_count += 1;
        if succeeded {
            updated.consecutive_failures = 0;
            if let Some(cooldown) = &trigger.cooldown {
                let quiet = parse_duration(cooldown).map_err(|e| TriggerError::InvalidTrigger {
                    trigger_id: trigger_id.to_string(),
                    reason: e.to_string(),
                })?;
                updated.cooldown_until = Some(wall_now_ms + quiet.as_millis() as u64);
            }
        } else {
            updated.consecutive_failures += 1;
            if trigger.on_workflow_failure == OnWorkflowFailure::PauseTrigger
                && updated.consecutive_failures >= trigger.max_retries
            {
                tracing::warn!(
                    trigger_id,
                    failures = updated.consecutive_failures,
                    "pausing trigger after consecutive workflow failures"
                );
                updated.enabled = false;
                if self.options.clear_cooldown_on_pause {
                    updated.cooldown_until = None;
                }
            }
        }

        // 8. Persist; failures here propagate, the workflow result stands.
        self.store.save(trigger_id, &updated).await?;
        self.store.save_last_result(trigger_id, &result).await?;
        self.store
            .append_execution(
                trigger_id,
                &json!({
                    "ts": Utc::now().to_rfc3339(),
                    "workflow_id": result.workflow_id,
                    "workflow": result.name,
                    "status": result.status,
                    "event_timestamp_ms": event.timestamp_ms,
                    "execution_count": updated.execution_count,
                }),
            )
            .await?;

        Ok(TriggerAction::Executed { trigger_id: trigger_id.to_string(), result })
    }
}
