//! Trigger admission: filters and the per-event engine.

pub mod engine;
pub mod filter;

pub use engine::{TriggerEngine, TriggerEngineOptions, TriggerError, WorkflowLauncher};
pub use filter::{match_filter, resolve_path};
