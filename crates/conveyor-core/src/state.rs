//! State-store trait: per-trigger policy timers and counters.
//!
//! The store is advisory (policy timers, not a journal of step progress);
//! the daemon keeps working if a read fails, but a persistence failure
//! after a firing propagates to the caller. The filesystem implementation
//! in `conveyor-infra` writes temp-then-rename.

use conveyor_types::trigger::TriggerState;
use conveyor_types::workflow::WorkflowState;

/// Errors from trigger-state persistence.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("state read error for '{trigger_id}': {reason}")]
    Read { trigger_id: String, reason: String },

    #[error("state write error for '{trigger_id}': {reason}")]
    Write { trigger_id: String, reason: String },

    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence surface the trigger engine depends on.
///
/// Uses native async fn in traits; the engine is generic over the store.
pub trait StateStore: Send + Sync {
    /// Load the persisted state for a trigger; `None` when never fired.
    fn load(
        &self,
        trigger_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<TriggerState>, StateStoreError>> + Send;

    /// Persist the state for a trigger.
    fn save(
        &self,
        trigger_id: &str,
        state: &TriggerState,
    ) -> impl std::future::Future<Output = Result<(), StateStoreError>> + Send;

    /// Persist the last workflow result for a trigger.
    fn save_last_result(
        &self,
        trigger_id: &str,
        result: &WorkflowState,
    ) -> impl std::future::Future<Output = Result<(), StateStoreError>> + Send;

    /// Load the last workflow result for a trigger, if any.
    fn load_last_result(
        &self,
        trigger_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowState>, StateStoreError>> + Send;

    /// Append an execution record to the append-only log.
    fn append_execution(
        &self,
        trigger_id: &str,
        record: &serde_json::Value,
    ) -> impl std::future::Future<Output = Result<(), StateStoreError>> + Send;
}

impl<S: StateStore> StateStore for std::sync::Arc<S> {
    async fn load(&self, trigger_id: &str) -> Result<Option<TriggerState>, StateStoreError> {
        (**self).load(trigger_id).await
    }

    async fn save(&self, trigger_id: &str, state: &TriggerState) -> Result<(), StateStoreError> {
        (**self).save(trigger_id, state).await
    }

    async fn save_last_result(
        &self,
        trigger_id: &str,
        result: &WorkflowState,
    ) -> Result<(), StateStoreError> {
        (**self).save_last_result(trigger_id, result).await
    }

    async fn load_last_result(
        &self,
        trigger_id: &str,
    ) -> Result<Option<WorkflowState>, StateStoreError> {
        (**self).load_last_result(trigger_id).await
    }

    async fn append_execution(
        &self,
        trigger_id: &str,
        record: &serde_json::Value,
    ) -> Result<(), StateStoreError> {
        (**self).append_execution(trigger_id, record).await
    }
}

// ---------------------------------------------------------------------------
// In-memory store (tests and single-shot runs)
// ---------------------------------------------------------------------------

/// Memory-backed store used by tests and `workflow run` one-shots.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: dashmap::DashMap<String, TriggerState>,
    last_results: dashmap::DashMap<String, WorkflowState>,
    executions: dashmap::DashMap<String, Vec<serde_json::Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of execution records logged for a trigger.
    pub fn execution_count(&self, trigger_id: &str) -> usize {
        self.executions.get(trigger_id).map(|v| v.len()).unwrap_or(0)
    }
}

impl StateStore for MemoryStateStore {
    async fn load(&self, trigger_id: &str) -> Result<Option<TriggerState>, StateStoreError> {
        Ok(self.states.get(trigger_id).map(|s| s.clone()))
    }

    async fn save(&self, trigger_id: &str, state: &TriggerState) -> Result<(), StateStoreError> {
        self.states.insert(trigger_id.to_string(), state.clone());
        Ok(())
    }

    async fn save_last_result(
        &self,
        trigger_id: &str,
        result: &WorkflowState,
    ) -> Result<(), StateStoreError> {
        self.last_results.insert(trigger_id.to_string(), result.clone());
        Ok(())
    }

    async fn load_last_result(
        &self,
        trigger_id: &str,
    ) -> Result<Option<WorkflowState>, StateStoreError> {
        Ok(self.last_results.get(trigger_id).map(|r| r.clone()))
    }

    async fn append_execution(
        &self,
        trigger_id: &str,
        record: &serde_json::Value,
    ) -> Result<(), StateStoreError> {
        self.executions
            .entry(trigger_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        assert!(store.load("t1").await.unwrap().is_none());

        let state = TriggerState { execution_count: 4, ..Default::default() };
        store.save("t1", &state).await.unwrap();
        let loaded = store.load("t1").await.unwrap().unwrap();
        assert_eq!(loaded.execution_count, 4);
    }

    #[tokio::test]
    async fn test_memory_store_last_result_and_log() {
        let store = MemoryStateStore::new();
        let result = WorkflowState::cancelled("wf");
        store.save_last_result("t1", &result).await.unwrap();
        assert!(store.load_last_result("t1").await.unwrap().is_some());
        assert!(store.load_last_result("other").await.unwrap().is_none());

        store
            .append_execution("t1", &serde_json::json!({ "status": "CANCELLED" }))
            .await
            .unwrap();
        assert_eq!(store.execution_count("t1"), 1);
    }
}
