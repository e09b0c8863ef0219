//! Backpressure controller: a scalar load in [0, 1] derived from active
//! permits, queue depth, and average latency, compared against ordered
//! thresholds (`reject >= defer >= degrade`).

/// Threshold set for load-mode resolution.
#[derive(Debug, Clone, Copy)]
pub struct BackpressureThresholds {
    pub degrade: f64,
    pub defer: f64,
    pub reject: f64,
}

impl Default for BackpressureThresholds {
    fn default() -> Self {
        Self { degrade: 0.7, defer: 0.85, reject: 0.95 }
    }
}

impl BackpressureThresholds {
    /// Clamp into [0, 1] and restore the required ordering.
    pub fn normalized(self) -> Self {
        let degrade = self.degrade.clamp(0.0, 1.0);
        let defer = self.defer.clamp(degrade, 1.0);
        let reject = self.reject.clamp(defer, 1.0);
        Self { degrade, defer, reject }
    }
}

/// Admission-policy state derived from the load scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Ok,
    /// Admit, but at reduced priority.
    Degrade,
    /// Refuse with DEFERRED (caller backs off and retries).
    Defer,
    /// Refuse with GLOBAL_SHED.
    Reject,
}

/// Computes the load scalar and resolves it into a mode.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    thresholds: BackpressureThresholds,
    /// Normalization ceiling for active permits.
    max_active: usize,
    /// Normalization ceiling for queue depth.
    max_queue_depth: usize,
    /// Normalization ceiling for average latency.
    latency_budget_ms: u64,
}

impl BackpressureController {
    pub fn new(
        thresholds: BackpressureThresholds,
        max_active: usize,
        max_queue_depth: usize,
        latency_budget_ms: u64,
    ) -> Self {
        Self {
            thresholds: thresholds.normalized(),
            max_active: max_active.max(1),
            max_queue_depth: max_queue_depth.max(1),
            latency_budget_ms: latency_budget_ms.max(1),
        }
    }

    /// Weighted load: 50% slot usage, 30% queue depth, 20% latency.
    pub fn load(&self, active_permits: usize, queue_depth: usize, avg_latency_ms: u64) -> f64 {
        let slots = (active_permits as f64 / self.max_active as f64).min(1.0);
        let queue = (queue_depth as f64 / self.max_queue_depth as f64).min(1.0);
        let latency = (avg_latency_ms as f64 / self.latency_budget_ms as f64).min(1.0);
        (0.5 * slots + 0.3 * queue + 0.2 * latency).clamp(0.0, 1.0)
    }

    pub fn mode(&self, load: f64) -> LoadMode {
        if load >= self.thresholds.reject {
            LoadMode::Reject
        } else if load >= self.thresholds.defer {
            LoadMode::Defer
        } else if load >= self.thresholds.degrade {
            LoadMode::Degrade
        } else {
            LoadMode::Ok
        }
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(BackpressureThresholds::default(), 64, 256, 30_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BackpressureController {
        BackpressureController::new(BackpressureThresholds::default(), 10, 100, 1_000)
    }

    #[test]
    fn test_idle_load_is_zero() {
        let c = controller();
        assert_eq!(c.load(0, 0, 0), 0.0);
        assert_eq!(c.mode(0.0), LoadMode::Ok);
    }

    #[test]
    fn test_saturated_load_is_one() {
        let c = controller();
        let load = c.load(10, 100, 1_000);
        assert!((load - 1.0).abs() < f64::EPSILON);
        assert_eq!(c.mode(load), LoadMode::Reject);
    }

    #[test]
    fn test_components_cap_at_one() {
        let c = controller();
        // Each input far past its ceiling still caps per-component.
        let load = c.load(1_000, 10_000, 100_000);
        assert!(load <= 1.0);
    }

    #[test]
    fn test_mode_thresholds() {
        let c = controller();
        assert_eq!(c.mode(0.69), LoadMode::Ok);
        assert_eq!(c.mode(0.70), LoadMode::Degrade);
        assert_eq!(c.mode(0.85), LoadMode::Defer);
        assert_eq!(c.mode(0.95), LoadMode::Reject);
    }

    #[test]
    fn test_thresholds_normalized_ordering() {
        let t = BackpressureThresholds { degrade: 0.9, defer: 0.5, reject: 0.2 }.normalized();
        assert!(t.degrade <= t.defer && t.defer <= t.reject);
    }

    #[test]
    fn test_slot_weight_dominates() {
        let c = controller();
        // All slots busy, nothing else: 0.5 load => degrade range not yet.
        let load = c.load(10, 0, 0);
        assert!((load - 0.5).abs() < f64::EPSILON);
        assert_eq!(c.mode(load), LoadMode::Ok);
    }
}
