//! Per-provider circuit breaker.
//!
//! CLOSED until `failure_threshold` consecutive failures, then OPEN for
//! `cooldown`, then HALF_OPEN: the next outcome either closes the circuit
//! (success) or re-opens it (failure).

use std::time::{Duration, Instant};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure circuit breaker for one provider key.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    state: BreakerState,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            state: BreakerState::Closed,
            opened_at: None,
        }
    }

    /// Current state, applying the OPEN -> HALF_OPEN transition when the
    /// cooldown has elapsed.
    pub fn state(&mut self) -> BreakerState {
        if self.state == BreakerState::Open {
            if let Some(opened) = self.opened_at {
                if opened.elapsed() >= self.cooldown {
                    self.state = BreakerState::HalfOpen;
                }
            }
        }
        self.state
    }

    /// True when admission must be refused.
    pub fn is_open(&mut self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        match self.state() {
            // A probe failure re-opens immediately.
            BreakerState::HalfOpen => self.trip(),
            _ => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.trip();
                }
            }
        }
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
    }
}
