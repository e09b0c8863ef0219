//! Daemon configuration and the agent catalog.
//!
//! Both files are YAML, capped at 1 MiB before parsing. `events` and
//! `triggers` keep their document order (the trigger engine iterates in
//! insertion order).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::serde_ext::ordered_map;
use crate::trigger::TriggerDef;
use crate::workflow::WorkerKind;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a daemon config or workflow YAML file.
pub const MAX_YAML_BYTES: usize = 1_048_576;

fn default_max_concurrent() -> usize {
    5
}

// ---------------------------------------------------------------------------
// Daemon config
// ---------------------------------------------------------------------------

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub name: String,
    /// Root directory for workflow workspaces and context directories.
    pub workspace: PathBuf,
    /// Where trigger state and the execution log live. Defaults to
    /// `<workspace>/.conveyor/state`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Global cap on concurrently running workflows.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_workflows: usize,
    /// Worker catalog file (YAML). Optional; built-in defaults otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents_file: Option<PathBuf>,
    /// Event sources, in document order.
    #[serde(default, deserialize_with = "ordered_map")]
    pub events: Vec<(String, EventDef)>,
    /// Triggers, in document order.
    #[serde(default, deserialize_with = "ordered_map")]
    pub triggers: Vec<(String, TriggerDef)>,
}

impl DaemonConfig {
    /// Parse a config document, enforcing the size cap first.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.len() > MAX_YAML_BYTES {
            return Err(ConfigError::TooLarge { size: text.len(), max: MAX_YAML_BYTES });
        }
        serde_yaml_ng::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Effective state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.workspace.join(".conveyor").join("state"))
    }

    /// Look up a trigger definition by id.
    pub fn trigger(&self, id: &str) -> Option<&TriggerDef> {
        self.triggers.iter().find(|(tid, _)| tid == id).map(|(_, t)| t)
    }
}

// ---------------------------------------------------------------------------
// Event source definitions
// ---------------------------------------------------------------------------

/// Configuration of one event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDef {
    /// Fixed-interval ticks.
    Interval {
        /// Tick period (duration string, e.g. "30s").
        every: String,
    },
    /// Cron schedule (5/6-field cron or a human-readable phrase).
    Cron { schedule: String },
    /// Debounced filesystem watch.
    Fswatch {
        paths: Vec<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        patterns: Option<Vec<String>>,
        /// Debounce window (duration string, default "2s").
        #[serde(default, skip_serializing_if = "Option::is_none")]
        debounce: Option<String>,
    },
    /// HTTP webhook listener.
    Webhook {
        /// Request path that emits events (e.g. "/hooks/deploy").
        path: String,
        /// Listen address, default "127.0.0.1:8787".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
        /// Shared secret for HMAC-SHA256 signature verification.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    /// Periodically run a command; each completion is an event.
    Command {
        run: String,
        every: String,
    },
}

// ---------------------------------------------------------------------------
// Agent catalog
// ---------------------------------------------------------------------------

/// How to invoke one worker kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Binary name or path.
    pub bin: String,
    /// Fixed leading arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Default model identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Catalog mapping worker kinds to their CLI invocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCatalog {
    #[serde(default)]
    pub agents: HashMap<WorkerKind, AgentSpec>,
}

impl AgentCatalog {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.len() > MAX_YAML_BYTES {
            return Err(ConfigError::TooLarge { size: text.len(), max: MAX_YAML_BYTES });
        }
        serde_yaml_ng::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Resolve the spec for a worker kind, falling back to built-in
    /// defaults for known CLIs.
    pub fn resolve(&self, kind: WorkerKind) -> AgentSpec {
        if let Some(spec) = self.agents.get(&kind) {
            return spec.clone();
        }
        match kind {
            WorkerKind::CodexCli => AgentSpec {
                bin: "codex".to_string(),
                args: vec!["exec".to_string()],
                model: None,
            },
            WorkerKind::ClaudeCode => AgentSpec {
                bin: "claude".to_string(),
                args: vec!["-p".to_string()],
                model: None,
            },
            WorkerKind::Opencode => AgentSpec {
                bin: "opencode".to_string(),
                args: vec!["run".to_string()],
                model: None,
            },
            WorkerKind::Custom => AgentSpec {
                bin: "sh".to_string(),
                args: vec!["-c".to_string()],
                model: None,
            },
        }
    }
}

/// Sanitize an id for on-disk naming: `/`, `\` and `.` become `_`.
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if matches!(c, '/' | '\\' | '.') { '_' } else { c })
        .collect()
}

/// True when a string is usable as a single path segment: non-empty, no
/// separators, not `.`/`..`, and not a reserved context entry.
pub fn is_safe_path_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains('/')
        && !segment.contains('\\')
        && !segment.contains("..")
}

/// Check that `candidate`, resolved relative to `base`, cannot escape it.
/// Rejects absolute paths and any `..` component without touching the
/// filesystem.
pub fn is_contained_relative(candidate: &Path) -> bool {
    use std::path::Component;
    if candidate.is_absolute() {
        return false;
    }
    candidate.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: nightly-daemon
workspace: /srv/conveyor
max_concurrent_workflows: 3
events:
  ticks:
    type: interval
    every: 30s
  hooks:
    type: webhook
    path: /hooks/deploy
    secret: shhh
triggers:
  nightly:
    on: ticks
    workflow: wf/nightly.yaml
    debounce: 5m
"#;

    #[test]
    fn test_daemon_config_parses() {
        let cfg = DaemonConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.name, "nightly-daemon");
        assert_eq!(cfg.max_concurrent_workflows, 3);
        assert_eq!(cfg.events.len(), 2);
        assert_eq!(cfg.events[0].0, "ticks");
        assert!(matches!(cfg.events[1].1, EventDef::Webhook { .. }));
        assert_eq!(cfg.triggers[0].0, "nightly");
    }

    #[test]
    fn test_size_cap_enforced() {
        let huge = "x".repeat(MAX_YAML_BYTES + 1);
        let err = DaemonConfig::from_yaml(&huge).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge { .. }));
    }

    #[test]
    fn test_state_dir_default() {
        let cfg = DaemonConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.state_dir(), PathBuf::from("/srv/conveyor/.conveyor/state"));
    }

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("team/nightly.v2"), "team_nightly_v2");
        assert_eq!(sanitize_id("plain"), "plain");
        assert_eq!(sanitize_id("a\\b"), "a_b");
    }

    #[test]
    fn test_safe_path_segment() {
        assert!(is_safe_path_segment("build"));
        assert!(is_safe_path_segment("step-1"));
        assert!(!is_safe_path_segment(""));
        assert!(!is_safe_path_segment(".."));
        assert!(!is_safe_path_segment("a/b"));
        assert!(!is_safe_path_segment("a\\b"));
    }

    #[test]
    fn test_contained_relative() {
        assert!(is_contained_relative(Path::new("out/report.json")));
        assert!(!is_contained_relative(Path::new("../escape")));
        assert!(!is_contained_relative(Path::new("/etc/passwd")));
        assert!(!is_contained_relative(Path::new("ok/../../bad")));
    }

    #[test]
    fn test_agent_catalog_fallbacks() {
        let catalog = AgentCatalog::default();
        assert_eq!(catalog.resolve(WorkerKind::ClaudeCode).bin, "claude");
        assert_eq!(catalog.resolve(WorkerKind::CodexCli).bin, "codex");

        let yaml = "agents:\n  claude_code:\n    bin: /opt/claude\n    model: sonnet\n";
        let catalog = AgentCatalog::from_yaml(yaml).unwrap();
        let spec = catalog.resolve(WorkerKind::ClaudeCode);
        assert_eq!(spec.bin, "/opt/claude");
        assert_eq!(spec.model.as_deref(), Some("sonnet"));
    }
}
