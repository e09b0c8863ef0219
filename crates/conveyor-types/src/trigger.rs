//! Trigger configuration, persisted state, and per-event actions.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{CompletionCheckDef, WorkflowState};

// ---------------------------------------------------------------------------
// Trigger definition (config, immutable per daemon lifetime)
// ---------------------------------------------------------------------------

/// A single (event source -> workflow) binding with admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDef {
    /// Source id this trigger listens to (`events:` key).
    pub on: String,
    /// Workflow file to run, relative to the daemon workspace.
    pub workflow: PathBuf,
    /// AND-combined field filters over the event JSON (dotted paths).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<HashMap<String, FilterRule>>,
    /// Config-level enable switch. `Some(false)` disables regardless of
    /// persisted state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Minimum interval between firings, measured on event timestamps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce: Option<String>,
    /// Post-success quiet period, measured on the wall clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<String>,
    /// Consecutive-failure threshold for `pause_trigger`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// What happens when the launched workflow fails.
    #[serde(default)]
    pub on_workflow_failure: OnWorkflowFailure,
    /// Per-trigger dispatch queue bound (drop-oldest beyond this).
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    /// Context staging for the launched workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TriggerContextConfig>,
    /// Optional pre-execution gate: a check worker deciding run vs. skip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluate: Option<CompletionCheckDef>,
    /// Optional post-execution analysis worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyze: Option<CompletionCheckDef>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_queue() -> usize {
    10
}

/// Policy applied when a launched workflow does not succeed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnWorkflowFailure {
    #[default]
    None,
    PauseTrigger,
}

/// Context staging options for workflows launched by a trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerContextConfig {
    /// Extra environment variables for worker invocations.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Stage the previous workflow result as `last-result.json`.
    #[serde(default)]
    pub last_result: bool,
    /// Stage the triggering event as `event.json`.
    #[serde(default)]
    pub event_payload: bool,
}

// ---------------------------------------------------------------------------
// Filter rules
// ---------------------------------------------------------------------------

/// Match rule for one dotted-path field of the event JSON.
///
/// Untagged: `{ in: [...] }` and `{ pattern: "..." }` are recognized by their
/// key; anything else is a primitive compared by string coercion
/// (`"7" == 7`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterRule {
    In {
        #[serde(rename = "in")]
        any_of: Vec<Value>,
    },
    Pattern {
        pattern: String,
    },
    Equals(Value),
}

// ---------------------------------------------------------------------------
// Trigger state (mutable, persisted)
// ---------------------------------------------------------------------------

/// Persisted admission-policy state of one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerState {
    /// Sticky enable flag; `false` only flips back via admin action.
    pub enabled: bool,
    /// Event timestamp (ms) of the last non-queued firing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<u64>,
    /// Wall-clock epoch ms until which the trigger is cooling down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<u64>,
    pub execution_count: u64,
    pub consecutive_failures: u32,
}

impl Default for TriggerState {
    fn default() -> Self {
        Self {
            enabled: true,
            last_fired_at: None,
            cooldown_until: None,
            execution_count: 0,
            consecutive_failures: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger actions and schedule outcomes
// ---------------------------------------------------------------------------

/// The admission decision for one (event, trigger) pair. Exactly one is
/// produced per matching trigger per event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TriggerAction {
    /// Trigger is disabled (config or persisted state).
    Disabled { trigger_id: String },
    /// The event did not pass the trigger's filter.
    Filtered { trigger_id: String },
    /// The event arrived inside the debounce window.
    Debounced { trigger_id: String },
    /// The trigger is in its post-success cooldown.
    Cooldown { trigger_id: String },
    /// The workflow was enqueued, not executed; state unchanged.
    Queued { trigger_id: String },
    /// The workflow ran (or failed to launch) and state was updated.
    Executed {
        trigger_id: String,
        result: WorkflowState,
    },
}

impl TriggerAction {
    pub fn trigger_id(&self) -> &str {
        match self {
            TriggerAction::Disabled { trigger_id }
            | TriggerAction::Filtered { trigger_id }
            | TriggerAction::Debounced { trigger_id }
            | TriggerAction::Cooldown { trigger_id }
            | TriggerAction::Queued { trigger_id }
            | TriggerAction::Executed { trigger_id, .. } => trigger_id,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            TriggerAction::Disabled { .. } => "disabled",
            TriggerAction::Filtered { .. } => "filtered",
            TriggerAction::Debounced { .. } => "debounced",
            TriggerAction::Cooldown { .. } => "cooldown",
            TriggerAction::Queued { .. } => "queued",
            TriggerAction::Executed { .. } => "executed",
        }
    }
}

/// Result of asking the daemon to run a workflow: either it ran to a final
/// state, or it was enqueued behind the global concurrency cap.
#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    Executed(WorkflowState),
    Queued,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trigger_def_defaults() {
        let yaml = "on: ticks\nworkflow: wf/nightly.yaml\n";
        let def: TriggerDef = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.max_retries, 3);
        assert_eq!(def.max_queue, 10);
        assert_eq!(def.on_workflow_failure, OnWorkflowFailure::None);
        assert!(def.enabled.is_none());
    }

    #[test]
    fn test_filter_rule_untagged_shapes() {
        let rule: FilterRule = serde_yaml_ng::from_str("in: [a, b]\n").unwrap();
        assert!(matches!(rule, FilterRule::In { .. }));

        let rule: FilterRule = serde_yaml_ng::from_str("pattern: '^v[0-9]+'\n").unwrap();
        assert!(matches!(rule, FilterRule::Pattern { .. }));

        let rule: FilterRule = serde_yaml_ng::from_str("7\n").unwrap();
        match rule {
            FilterRule::Equals(v) => assert_eq!(v, json!(7)),
            other => panic!("expected Equals, got {other:?}"),
        }
    }

    #[test]
    fn test_trigger_state_default() {
        let state = TriggerState::default();
        assert!(state.enabled);
        assert_eq!(state.execution_count, 0);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_fired_at.is_none());
        assert!(state.cooldown_until.is_none());
    }

    #[test]
    fn test_trigger_action_kind_names() {
        let action = TriggerAction::Queued { trigger_id: "t1".to_string() };
        assert_eq!(action.kind(), "queued");
        assert_eq!(action.trigger_id(), "t1");
    }
}
