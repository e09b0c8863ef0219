//! Observability wiring for Conveyor binaries.

pub mod tracing_setup;
