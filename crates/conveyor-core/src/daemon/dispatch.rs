//! Daemon dispatch: the global concurrent-workflow cap, the per-trigger
//! bounded queue, and graceful shutdown.
//!
//! `Daemon` sits between the trigger engine and the workflow invoker. A
//! launch request either executes immediately (capacity available), is
//! enqueued (`ScheduleOutcome::Queued`), or — during shutdown — resolves to
//! a synthesized CANCELLED result. Every completed execution releases its
//! slot and drains at most one queued item, so queued workflows start
//! one-at-a-time in arrival order.

use std::sync::Arc;
use std::time::Duration;

use conveyor_types::event::Event;
use conveyor_types::trigger::{ScheduleOutcome, TriggerDef};
use conveyor_types::workflow::WorkflowState;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::daemon::queue::{DispatchQueue, QueuedItem};
use crate::trigger::engine::WorkflowLauncher;

// ---------------------------------------------------------------------------
// WorkflowInvoker
// ---------------------------------------------------------------------------

/// Executes one workflow end to end: evaluate gate, context staging,
/// definition loading, executor run, analyze. Implemented by the
/// application layer; the daemon only manages slots and queueing.
///
/// Must not panic; failures are reported as a FAILED `WorkflowState`.
pub trait WorkflowInvoker: Send + Sync + 'static {
    fn execute(
        &self,
        trigger_id: String,
        trigger: TriggerDef,
        event: Event,
    ) -> impl std::future::Future<Output = WorkflowState> + Send;
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Dispatch tunables.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Global cap on concurrently running workflows.
    pub max_concurrent: usize,
    /// How long `stop()` waits for running workflows to settle.
    pub drain_timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { max_concurrent: 5, drain_timeout: Duration::from_secs(30) }
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

struct DispatchState {
    running: usize,
    queue: DispatchQueue,
    shutdown: bool,
}

struct DaemonInner<I: WorkflowInvoker> {
    invoker: I,
    options: DispatchOptions,
    state: Mutex<DispatchState>,
    /// Cancelled on `stop()`; linked into every executor as the external
    /// abort signal.
    shutdown_token: CancellationToken,
    /// Notified whenever running hits zero with an empty queue.
    idle: Notify,
}

/// The dispatch half of the daemon.
pub struct Daemon<I: WorkflowInvoker> {
    inner: Arc<DaemonInner<I>>,
}

impl<I: WorkflowInvoker> Clone for Daemon<I> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<I: WorkflowInvoker> Daemon<I> {
    pub fn new(invoker: I, options: DispatchOptions) -> Self {
        Self {
            inner: Arc::new(DaemonInner {
                invoker,
                options,
                state: Mutex::new(DispatchState {
                    running: 0,
                    queue: DispatchQueue::new(),
                    shutdown: false,
                }),
                shutdown_token: CancellationToken::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// The shutdown signal workflows should link as their external abort.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown_token.clone()
    }

    /// Currently running workflow count.
    pub async fn running(&self) -> usize {
        self.inner.state.lock().await.running
    }

    /// Currently queued item count.
    pub async fn queued(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Schedule a workflow for a trigger firing.
    ///
    /// Runs inline when a slot is free; otherwise enqueues under the
    /// trigger's `max_queue` bound and reports `Queued`. During shutdown
    /// nothing runs and a CANCELLED result is synthesized.
    pub async fn schedule_workflow(
        &self,
        trigger_id: &str,
        trigger: &TriggerDef,
        event: &Event,
    ) -> ScheduleOutcome {
        {
            let mut state = self.inner.state.lock().await;
            if state.shutdown {
                return ScheduleOutcome::Executed(WorkflowState::cancelled(
                    trigger.workflow.display().to_string(),
                ));
            }
            if state.running >= self.inner.options.max_concurrent {
                state.queue.push(trigger_id, trigger.clone(), event.clone(), trigger.max_queue);
                tracing::debug!(
                    trigger_id,
                    queued = state.queue.len(),
                    "workflow enqueued, at concurrency cap"
                );
                return ScheduleOutcome::Queued;
            }
            state.running += 1;
        }

        let result = DaemonInner::execute_and_release(
            &self.inner,
            trigger_id.to_string(),
            trigger.clone(),
            event.clone(),
        )
        .await;
        ScheduleOutcome::Executed(result)
    }

    /// Idempotent graceful shutdown: stop admitting, cancel the shared
    /// abort signal, drop queued items, and wait up to `drain_timeout` for
    /// running workflows to settle.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let dropped = state.queue.len();
            state.queue.clear();
            if dropped > 0 {
                tracing::info!(dropped, "dropped queued workflows on shutdown");
            }
        }

        self.inner.shutdown_token.cancel();

        let deadline = tokio::time::Instant::now() + self.inner.options.drain_timeout;
        loop {
            if self.inner.state.lock().await.running == 0 {
                break;
            }
            let wait = self.inner.idle.notified();
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                let still = self.inner.state.lock().await.running;
                tracing::warn!(running = still, "shutdown drain timed out");
                break;
            }
        }
    }
}

impl<I: WorkflowInvoker> DaemonInner<I> {
    /// Run one workflow, then release the slot: drain at most one queued
    /// item and fire the idle notifier when fully drained.
    async fn execute_and_release(
        inner: &Arc<Self>,
        trigger_id: String,
        trigger: TriggerDef,
        event: Event,
    ) -> WorkflowState {
        tracing::info!(trigger_id = trigger_id.as_str(), "starting workflow");
        let result = inner.invoker.execute(trigger_id.clone(), trigger, event).await;
        tracing::info!(
            trigger_id = trigger_id.as_str(),
            status = ?result.status,
            "workflow finished"
        );

        // Release path: runs even though `execute` cannot fail — the
        // invoker contract is result-typed, not panic-based.
        let next = {
            let mut state = inner.state.lock().await;
            state.running -= 1;

            let next = if !state.shutdown
                && state.running < inner.options.max_concurrent
                && !state.queue.is_empty()
            {
                // Start at most one per release; its own completion drains
                // the next.
                let item = state.queue.pop_front();
                if item.is_some() {
                    state.running += 1;
                }
                item
            } else {
                None
            };

            if state.running == 0 && state.queue.is_empty() {
                inner.idle.notify_waiters();
            }
            next
        };

        if let Some(item) = next {
            Self::spawn_queued(inner, item);
        }

        result
    }

    fn spawn_queued(inner: &Arc<Self>, item: QueuedItem) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let QueuedItem { trigger_id, trigger, event, .. } = item;
            let _ = Self::execute_and_release(&inner, trigger_id, trigger, event).await;
        });
    }
}

impl<I: WorkflowInvoker> WorkflowLauncher for Daemon<I> {
    async fn launch(
        &self,
        trigger_id: &str,
        trigger: &TriggerDef,
        event: &Event,
    ) -> Result<ScheduleOutcome, String> {
        Ok(self.schedule_workflow(trigger_id, trigger, event).await)
    }
}
