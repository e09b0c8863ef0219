//! The permit gate: non-blocking, atomic admission decisions for worker
//! tasks.
//!
//! Decision order (first refusal wins): backpressure, circuit breaker,
//! cost budget, RPS window, concurrency, duplicate permit, fatal mode.
//! Grants insert into the permit map, bump the RPS window, and deduct cost;
//! `complete` and `revoke` are idempotent and keep every counter
//! consistent under back-to-back calls. All state lives behind one mutex —
//! the gate is the single source of truth for permit liveness.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use conveyor_types::permit::{Job, PermitRejection, RejectReason};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::permit::backpressure::{BackpressureController, LoadMode};
use crate::permit::breaker::CircuitBreaker;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Gate tunables.
#[derive(Debug, Clone)]
pub struct GateOptions {
    pub max_concurrency: usize,
    /// Sliding 1-second request cap; `None` disables the window.
    pub max_rps: Option<u32>,
    /// Total cost budget; `None` disables budgeting.
    pub max_cost_budget: Option<f64>,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
    pub backpressure: BackpressureController,
    /// Queue wait beyond which a request is refused as QUEUE_STALL.
    pub queue_stall_after: Duration,
    /// DEFERRED refuses the request (default). When false, defer mode
    /// degrades instead of refusing.
    pub defer_rejects: bool,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            max_rps: None,
            max_cost_budget: None,
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            backpressure: BackpressureController::default(),
            queue_stall_after: Duration::from_secs(60),
            defer_rejects: true,
        }
    }
}

// ---------------------------------------------------------------------------
// PermitHandle
// ---------------------------------------------------------------------------

/// A granted admission token, shared by gate and runner. Lives until
/// `complete_permit` or `revoke_permit`; revoke also fires the abort
/// signal.
#[derive(Debug, Clone)]
pub struct PermitHandle {
    pub permit_id: Uuid,
    pub job_id: Uuid,
    abort: CancellationToken,
}

impl PermitHandle {
    /// The abort signal the consumer should watch.
    pub fn abort_signal(&self) -> CancellationToken {
        self.abort.clone()
    }
}

// ---------------------------------------------------------------------------
// PermitGate
// ---------------------------------------------------------------------------

struct PermitEntry {
    job_id: Uuid,
    provider: String,
    cost: f64,
    abort: CancellationToken,
}

struct GateState {
    permits: HashMap<Uuid, PermitEntry>,
    /// Reverse index for duplicate detection.
    by_job: HashMap<Uuid, Uuid>,
    rps_window: VecDeque<Instant>,
    cost_spent: f64,
    breakers: HashMap<String, CircuitBreaker>,
    fatal: bool,
    /// Host-reported load inputs.
    queue_depth: usize,
    avg_latency_ms: u64,
}

/// Admission controller for worker tasks.
pub struct PermitGate {
    options: GateOptions,
    state: Mutex<GateState>,
}

impl PermitGate {
    pub fn new(options: GateOptions) -> Self {
        Self {
            options,
            state: Mutex::new(GateState {
                permits: HashMap::new(),
                by_job: HashMap::new(),
                rps_window: VecDeque::new(),
                cost_spent: 0.0,
                breakers: HashMap::new(),
                fatal: false,
                queue_depth: 0,
                avg_latency_ms: 0,
            }),
        }
    }

    /// Number of live permits.
    pub fn active_permits(&self) -> usize {
        self.state.lock().unwrap().permits.len()
    }

    /// Latch fatal mode; every subsequent request is refused FATAL_MODE.
    pub fn set_fatal(&self) {
        self.state.lock().unwrap().fatal = true;
    }

    /// Update host-observed load inputs for the backpressure controller.
    pub fn set_load_inputs(&self, queue_depth: usize, avg_latency_ms: u64) {
        let mut state = self.state.lock().unwrap();
        state.queue_depth = queue_depth;
        state.avg_latency_ms = avg_latency_ms;
    }

    /// Decide admission for one job. Non-blocking; the whole decision and
    /// any grant bookkeeping happen atomically under the gate lock.
    pub fn request_permit(
        &self,
        job: &Job,
        queued_for_ms: u64,
    ) -> Result<PermitHandle, PermitRejection> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        // 1. Backpressure (queue stall folds in here: the request waited
        // too long client-side to still be worth admitting).
        if queued_for_ms > self.options.queue_stall_after.as_millis() as u64 {
            return Err(PermitRejection::new(
                RejectReason::QueueStall,
                format!("queued for {queued_for_ms}ms"),
            ));
        }
        let load = self.options.backpressure.load(
            state.permits.len(),
            state.queue_depth,
            state.avg_latency_ms,
        );
        let mut degraded = false;
        match self.options.backpressure.mode(load) {
            LoadMode::Reject => {
                return Err(PermitRejection::new(
                    RejectReason::GlobalShed,
                    format!("load {load:.2}"),
                ));
            }
            LoadMode::Defer if self.options.defer_rejects => {
                return Err(PermitRejection::new(
                    RejectReason::Deferred,
                    format!("load {load:.2}"),
                ));
            }
            LoadMode::Defer | LoadMode::Degrade => degraded = true,
            LoadMode::Ok => {}
        }

        // 2. Circuit breaker by provider key.
        let provider = job.job_type.clone();
        if let Some(breaker) = state.breakers.get_mut(&provider) {
            if breaker.is_open() {
                return Err(PermitRejection::new(
                    RejectReason::CircuitOpen,
                    format!("provider '{provider}'"),
                ));
            }
        }

        // 3. Cost budget.
        if let Some(budget) = self.options.max_cost_budget {
            let remaining = budget - state.cost_spent;
            if remaining < job.limits.cost_hint {
                return Err(PermitRejection::new(
                    RejectReason::BudgetExhausted,
                    format!("remaining {remaining:.2} < hint {:.2}", job.limits.cost_hint),
                ));
            }
        }

        // 4. RPS sliding window.
        if let Some(max_rps) = self.options.max_rps {
            let window_start = now - Duration::from_secs(1);
            while state.rps_window.front().is_some_and(|t| *t < window_start) {
                state.rps_window.pop_front();
            }
            if state.rps_window.len() >= max_rps as usize {
                return Err(PermitRejection::new(
                    RejectReason::RateLimit,
                    format!("{max_rps} grants in the last second"),
                ));
            }
        }

        // 5. Concurrency.
        if state.permits.len() >= self.options.max_concurrency {
            return Err(PermitRejection::new(
                RejectReason::ConcurrencyLimit,
                format!("{} active permits", state.permits.len()),
            ));
        }

        // 6. Duplicate permit for the same job.
        if state.by_job.contains_key(&job.job_id) {
            return Err(PermitRejection::new(
                RejectReason::DuplicatePermit,
                job.job_id.to_string(),
            ));
        }

        // 7. Fatal latch.
        if state.fatal {
            return Err(PermitRejection::new(RejectReason::FatalMode, "gate is fatal"));
        }

        // Grant.
        let permit_id = Uuid::now_v7();
        let abort = CancellationToken::new();
        state.permits.insert(
            permit_id,
            PermitEntry {
                job_id: job.job_id,
                provider,
                cost: job.limits.cost_hint,
                abort: abort.clone(),
            },
        );
        state.by_job.insert(job.job_id, permit_id);
        if self.options.max_rps.is_some() {
            state.rps_window.push_back(now);
        }
        state.cost_spent += job.limits.cost_hint;

        tracing::debug!(
            permit_id = %permit_id,
            job_id = %job.job_id,
            active = state.permits.len(),
            degraded,
            "permit granted"
        );

        Ok(PermitHandle { permit_id, job_id: job.job_id, abort })
    }

    /// Release a permit after a successful run. Idempotent.
    pub fn complete_permit(&self, permit_id: Uuid) -> bool {
        self.release(permit_id, true, None)
    }

    /// Release a permit and abort its consumer. Idempotent; records a
    /// failure to the provider's breaker.
    pub fn revoke_permit(&self, permit_id: Uuid, reason: &str) -> bool {
        self.release(permit_id, false, Some(reason))
    }

    fn release(&self, permit_id: Uuid, success: bool, revoke_reason: Option<&str>) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.permits.remove(&permit_id) else {
            return false;
        };
        state.by_job.remove(&entry.job_id);

        let threshold = self.options.breaker_failure_threshold;
        let cooldown = self.options.breaker_cooldown;
        let breaker = state
            .breakers
            .entry(entry.provider.clone())
            .or_insert_with(|| CircuitBreaker::new(threshold, cooldown));
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }

        if let Some(reason) = revoke_reason {
            tracing::debug!(permit_id = %permit_id, reason, "permit revoked");
            entry.abort.cancel();
        }
        true
    }
}
