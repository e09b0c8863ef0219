//! Convergence controller for iterating steps.
//!
//! Tracks check fingerprints across iterations. When the same fingerprint
//! set comes back `stall_threshold` times in a row, the stage escalates
//! (capped at `max_stage`) and stronger instructions are appended to the
//! next iteration's overlay. With `fail_on_max_stage`, stalling again at
//! the top stage fails the step.

use std::collections::BTreeSet;

use conveyor_types::workflow::ConvergenceConfig;

use crate::util::glob::matches_any;

// ---------------------------------------------------------------------------
// ConvergenceTracker
// ---------------------------------------------------------------------------

/// Per-step stall tracking and stage escalation.
#[derive(Debug)]
pub struct ConvergenceTracker {
    config: ConvergenceConfig,
    stall_count: u32,
    stage: u32,
    /// Set when escalation is requested while already at `max_stage`.
    exhausted: bool,
    last_fingerprints: Option<BTreeSet<String>>,
}

impl ConvergenceTracker {
    pub fn new(config: ConvergenceConfig) -> Self {
        Self {
            config,
            stall_count: 0,
            stage: 1,
            exhausted: false,
            last_fingerprints: None,
        }
    }

    pub fn stage(&self) -> u32 {
        self.stage
    }

    /// True when the controller saw no progress while already at the top
    /// stage (the `fail_on_max_stage` condition).
    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    /// Whether exhaustion should fail the step.
    pub fn fail_on_max_stage(&self) -> bool {
        self.config.fail_on_max_stage
    }

    /// Record one check's fingerprints; returns the (possibly escalated)
    /// stage. Fingerprints compare as sets, so ordering is irrelevant.
    pub fn observe(&mut self, fingerprints: &[String]) -> u32 {
        let current: BTreeSet<String> = fingerprints.iter().cloned().collect();

        let stalled = self
            .last_fingerprints
            .as_ref()
            .is_some_and(|previous| *previous == current);

        if stalled {
            self.stall_count += 1;
            if self.stall_count >= self.config.stall_threshold.max(1) {
                self.stall_count = 0;
                if self.stage >= self.config.max_stage {
                    self.exhausted = true;
                } else {
                    self.stage += 1;
                    tracing::debug!(stage = self.stage, "convergence stage escalated");
                }
            }
        } else {
            self.stall_count = 0;
        }

        self.last_fingerprints = Some(current);
        self.stage
    }

    /// Instruction appendix for the current stage (stage 1 has none).
    pub fn stage_overlay(&self) -> Option<&str> {
        if self.stage <= 1 || self.config.stages.is_empty() {
            return None;
        }
        let index = ((self.stage - 2) as usize).min(self.config.stages.len() - 1);
        Some(self.config.stages[index].append_instructions.as_str())
    }

    /// True when any changed path falls outside the allowed globs.
    pub fn paths_violation(&self, changed_paths: &[String]) -> bool {
        let Some(allowed) = &self.config.allowed_paths else {
            return false;
        };
        changed_paths.iter().any(|path| !matches_any(allowed, path))
    }
}

// ---------------------------------------------------------------------------
// Overlay composition
// ---------------------------------------------------------------------------

/// Compose the instructions handed to a runner for one iteration:
/// base, then the convergence stage appendix, then the management overlay.
/// Rebuilt from scratch every iteration.
pub fn compose_instructions(
    base: &str,
    stage_overlay: Option<&str>,
    management_overlay: Option<&str>,
) -> String {
    let mut text = base.to_string();
    if let Some(stage) = stage_overlay {
        text.push_str("\n\n[Convergence Controller] ");
        text.push_str(stage);
    }
    if let Some(management) = management_overlay {
        text.push_str("\n\n[Management Agent] ");
        text.push_str(management);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::workflow::ConvergenceStage;

    fn config(stall_threshold: u32, max_stage: u32) -> ConvergenceConfig {
        ConvergenceConfig {
            enabled: true,
            stall_threshold,
            max_stage,
            stages: vec![
                ConvergenceStage { append_instructions: "Focus on the failing tests.".to_string() },
                ConvergenceStage { append_instructions: "Stop exploring, fix directly.".to_string() },
            ],
            allowed_paths: None,
            fail_on_max_stage: false,
        }
    }

    fn prints(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_progress_keeps_stage_one() {
        let mut t = ConvergenceTracker::new(config(2, 3));
        assert_eq!(t.observe(&prints(&["a"])), 1);
        assert_eq!(t.observe(&prints(&["b"])), 1);
        assert_eq!(t.observe(&prints(&["c"])), 1);
        assert!(t.stage_overlay().is_none());
    }

    #[test]
    fn test_stall_escalates_stage() {
        let mut t = ConvergenceTracker::new(config(2, 3));
        t.observe(&prints(&["a"]));
        // Two identical observations in a row reach the threshold.
        t.observe(&prints(&["a"]));
        let stage = t.observe(&prints(&["a"]));
        assert_eq!(stage, 2);
        assert_eq!(t.stage_overlay(), Some("Focus on the failing tests."));
    }

    #[test]
    fn test_fingerprints_compare_as_sets() {
        let mut t = ConvergenceTracker::new(config(1, 3));
        t.observe(&prints(&["a", "b"]));
        let stage = t.observe(&prints(&["b", "a"]));
        assert_eq!(stage, 2, "reordered fingerprints count as a stall");
    }

    #[test]
    fn test_stage_caps_and_exhausts() {
        let mut t = ConvergenceTracker::new(config(1, 2));
        t.observe(&prints(&["a"]));
        assert_eq!(t.observe(&prints(&["a"])), 2);
        assert!(!t.exhausted());
        // Stalling at the top stage flags exhaustion, stage stays capped.
        assert_eq!(t.observe(&prints(&["a"])), 2);
        assert!(t.exhausted());
    }

    #[test]
    fn test_last_stage_text_reused_past_configured_stages() {
        let mut t = ConvergenceTracker::new(config(1, 5));
        t.observe(&prints(&["a"]));
        t.observe(&prints(&["a"])); // stage 2
        t.observe(&prints(&["a"])); // stage 3
        t.observe(&prints(&["a"])); // stage 4, past the two configured texts
        assert_eq!(t.stage(), 4);
        assert_eq!(t.stage_overlay(), Some("Stop exploring, fix directly."));
    }

    #[test]
    fn test_progress_resets_stall_counter() {
        let mut t = ConvergenceTracker::new(config(2, 3));
        t.observe(&prints(&["a"]));
        t.observe(&prints(&["a"])); // stall 1
        t.observe(&prints(&["b"])); // progress resets
        t.observe(&prints(&["b"])); // stall 1 again
        assert_eq!(t.stage(), 1);
    }

    #[test]
    fn test_paths_violation() {
        let mut cfg = config(2, 3);
        cfg.allowed_paths = Some(vec!["src/*".to_string(), "tests/*".to_string()]);
        let t = ConvergenceTracker::new(cfg);

        assert!(!t.paths_violation(&prints(&["src/lib.rs", "tests/a.rs"])));
        assert!(t.paths_violation(&prints(&["src/lib.rs", "Cargo.toml"])));
        assert!(!t.paths_violation(&[]));
    }

    #[test]
    fn test_no_allowed_paths_means_no_violation() {
        let t = ConvergenceTracker::new(config(2, 3));
        assert!(!t.paths_violation(&prints(&["anything"])));
    }

    #[test]
    fn test_compose_instructions_layers() {
        let base = "Fix the bug.";
        assert_eq!(compose_instructions(base, None, None), "Fix the bug.");

        let with_stage = compose_instructions(base, Some("Narrow scope."), None);
        assert_eq!(with_stage, "Fix the bug.\n\n[Convergence Controller] Narrow scope.");

        let with_both = compose_instructions(base, Some("Narrow scope."), Some("Skip refactors."));
        assert!(with_both.ends_with("[Management Agent] Skip refactors."));
        assert!(with_both.contains("[Convergence Controller] Narrow scope."));
    }
}
