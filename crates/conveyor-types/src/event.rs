//! Event types emitted by daemon event sources.
//!
//! An `Event` is immutable once emitted: a source id, a millisecond
//! timestamp, and a payload variant describing what happened. Trigger filters
//! resolve dotted paths against the JSON projection of the whole event
//! (`Event::to_json`), so payload field names are part of the config surface.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A single occurrence observed by an event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// The configured source id this event came from (`events:` key).
    pub source_id: String,
    /// Milliseconds since the Unix epoch at emission. Non-decreasing per
    /// source; debounce comparisons use this, never the wall clock at
    /// processing time.
    pub timestamp_ms: u64,
    /// What happened.
    pub payload: EventPayload,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn now(source_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp_ms: Utc::now().timestamp_millis() as u64,
            payload,
        }
    }

    /// JSON projection of the whole event, used for filter path resolution
    /// and for `event.json` context staging.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Source-specific payload of an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Fixed-interval tick.
    Interval {
        /// 1-based tick counter since the source started.
        tick: u64,
    },
    /// Cron schedule fired.
    Cron {
        /// The normalized cron expression that fired.
        schedule: String,
        /// Wall-clock fire time.
        fired_at: DateTime<Utc>,
    },
    /// Filesystem change batch (debounced).
    Fswatch {
        /// Paths that changed within the debounce window.
        paths: Vec<PathBuf>,
        /// Coarse change kind.
        kind: FsChangeKind,
    },
    /// Incoming webhook request.
    Webhook {
        /// The request path that matched.
        path: String,
        /// Selected request headers (lowercased names).
        headers: HashMap<String, String>,
        /// Parsed JSON body (`null` when the body was empty or not JSON).
        body: Value,
    },
    /// Watched command completed.
    Command {
        /// The command line that ran.
        command: String,
        /// Process exit code (-1 when terminated by signal).
        exit_code: i32,
        /// Trailing portion of stdout (bounded).
        stdout_tail: String,
    },
}

/// Coarse classification of a filesystem change batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsChangeKind {
    Any,
    Create,
    Modify,
    Remove,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_to_json_exposes_payload_fields() {
        let event = Event {
            source_id: "hooks".to_string(),
            timestamp_ms: 1_700_000_000_000,
            payload: EventPayload::Webhook {
                path: "/hooks/deploy".to_string(),
                headers: HashMap::new(),
                body: json!({ "branch": "main" }),
            },
        };

        let v = event.to_json();
        assert_eq!(v["source_id"], json!("hooks"));
        assert_eq!(v["payload"]["type"], json!("webhook"));
        assert_eq!(v["payload"]["body"]["branch"], json!("main"));
    }

    #[test]
    fn test_payload_tagging_roundtrip() {
        let payload = EventPayload::Command {
            command: "make check".to_string(),
            exit_code: 0,
            stdout_tail: "ok".to_string(),
        };
        let s = serde_json::to_string(&payload).unwrap();
        assert!(s.contains("\"type\":\"command\""));
        let back: EventPayload = serde_json::from_str(&s).unwrap();
        assert!(matches!(back, EventPayload::Command { exit_code: 0, .. }));
    }

    #[test]
    fn test_event_now_stamps_recent_timestamp() {
        let before = Utc::now().timestamp_millis() as u64;
        let event = Event::now("ticks", EventPayload::Interval { tick: 1 });
        let after = Utc::now().timestamp_millis() as u64;
        assert!(event.timestamp_ms >= before && event.timestamp_ms <= after);
    }
}
