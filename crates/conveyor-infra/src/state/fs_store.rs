//! Filesystem state store.
//!
//! Layout under `state_dir`:
//! - `daemon.json` — daemon-level record
//! - `triggers/<sanitized-id>.json` — per-trigger `TriggerState`
//! - `triggers/<sanitized-id>.last-result.json` — last workflow result
//! - `executions.jsonl` — append-only execution log
//!
//! Every non-append write goes write-temp-then-rename, so no torn state
//! file is ever observable and no `.tmp` files remain after success.

use std::path::{Path, PathBuf};

use conveyor_core::state::{StateStore, StateStoreError};
use conveyor_types::config::sanitize_id;
use conveyor_types::trigger::TriggerState;
use conveyor_types::workflow::WorkflowState;
use tokio::io::AsyncWriteExt;

/// JSON-file-backed state store.
pub struct FsStateStore {
    state_dir: PathBuf,
}

impl FsStateStore {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    /// Create the directory layout. Call once at daemon start.
    pub async fn init(&self) -> Result<(), StateStoreError> {
        tokio::fs::create_dir_all(self.state_dir.join("triggers"))
            .await
            .map_err(|e| StateStoreError::Unavailable(e.to_string()))
    }

    fn trigger_path(&self, trigger_id: &str) -> PathBuf {
        self.state_dir
            .join("triggers")
            .join(format!("{}.json", sanitize_id(trigger_id)))
    }

    fn last_result_path(&self, trigger_id: &str) -> PathBuf {
        self.state_dir
            .join("triggers")
            .join(format!("{}.last-result.json", sanitize_id(trigger_id)))
    }

    /// Persist the daemon-level record.
    pub async fn save_daemon(&self, record: &serde_json::Value) -> Result<(), StateStoreError> {
        write_atomic(&self.state_dir.join("daemon.json"), record)
            .await
            .map_err(|e| StateStoreError::Unavailable(e.to_string()))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        path: &Path,
        trigger_id: &str,
    ) -> Result<Option<T>, StateStoreError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
                StateStoreError::Read { trigger_id: trigger_id.to_string(), reason: e.to_string() }
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateStoreError::Read {
                trigger_id: trigger_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Serialize to a sibling temp file, then rename into place.
async fn write_atomic(path: &Path, value: &impl serde::Serialize) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(text.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await
}

impl StateStore for FsStateStore {
    async fn load(&self, trigger_id: &str) -> Result<Option<TriggerState>, StateStoreError> {
        Self::read_json(&self.trigger_path(trigger_id), trigger_id).await
    }

    async fn save(&self, trigger_id: &str, state: &TriggerState) -> Result<(), StateStoreError> {
        write_atomic(&self.trigger_path(trigger_id), state)
            .await
            .map_err(|e| StateStoreError::Write {
                trigger_id: trigger_id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn save_last_result(
        &self,
        trigger_id: &str,
        result: &WorkflowState,
    ) -> Result<(), StateStoreError> {
        write_atomic(&self.last_result_path(trigger_id), result)
            .await
            .map_err(|e| StateStoreError::Write {
                trigger_id: trigger_id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn load_last_result(
        &self,
        trigger_id: &str,
    ) -> Result<Option<WorkflowState>, StateStoreError> {
        Self::read_json(&self.last_result_path(trigger_id), trigger_id).await
    }

    async fn append_execution(
        &self,
        trigger_id: &str,
        record: &serde_json::Value,
    ) -> Result<(), StateStoreError> {
        let map_err = |e: std::io::Error| StateStoreError::Write {
            trigger_id: trigger_id.to_string(),
            reason: e.to_string(),
        };

        tokio::fs::create_dir_all(&self.state_dir).await.map_err(map_err)?;
        let mut line = serde_json::to_vec(record).map_err(|e| StateStoreError::Write {
            trigger_id: trigger_id.to_string(),
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.state_dir.join("executions.jsonl"))
            .await
            .map_err(map_err)?;
        file.write_all(&line).await.map_err(map_err)
    }
}
