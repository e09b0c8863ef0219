//! Engine IPC protocol: framed JSON lines between the daemon-side step
//! runner and the engine process.
//!
//! One message per line, internally tagged by `type`. Duplicates, unknown
//! job ids on `job_completed`, and messages arriving after waiter cleanup
//! are dropped (with a debug log) on the receiving side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::permit::{ErrorClass, Job, PermitRejection};

// ---------------------------------------------------------------------------
// Client -> Engine
// ---------------------------------------------------------------------------

/// Messages sent by the daemon-side runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SubmitJob {
        request_id: Uuid,
        job: Job,
    },
    RequestPermit {
        request_id: Uuid,
        job: Job,
        /// How long the job has already been waiting client-side.
        queued_for_ms: u64,
    },
    CancelJob {
        request_id: Uuid,
        job_id: Uuid,
        reason: String,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> Uuid {
        match self {
            ClientMessage::SubmitJob { request_id, .. }
            | ClientMessage::RequestPermit { request_id, .. }
            | ClientMessage::CancelJob { request_id, .. } => *request_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine -> Client
// ---------------------------------------------------------------------------

/// Messages sent by the engine process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineMessage {
    JobAck {
        request_id: Uuid,
    },
    PermitGranted {
        request_id: Uuid,
        job_id: Uuid,
    },
    PermitRejected {
        request_id: Uuid,
        rejection: PermitRejection,
    },
    JobCompleted {
        job_id: Uuid,
        outcome: JobOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_class: Option<ErrorClass>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    JobEvent {
        job_id: Uuid,
        ts: DateTime<Utc>,
        event: Value,
    },
}

/// Terminal outcome of an engine-executed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Job payload
// ---------------------------------------------------------------------------

/// What kind of work a submitted job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPayloadKind {
    Step,
    Check,
}

/// The worker invocation encoded in `Job::payload` for engine execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub kind: JobPayloadKind,
    pub step_id: String,
    pub worker: crate::workflow::WorkerKind,
    pub instructions: String,
    #[serde(default)]
    pub capabilities: Vec<crate::workflow::Capability>,
    pub workspace: std::path::PathBuf,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Command line for custom workers and custom checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_id: Option<String>,
}
