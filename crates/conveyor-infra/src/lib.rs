//! Infrastructure adapters for Conveyor.
//!
//! Implements the traits defined in `conveyor-core`: event sources
//! (interval, cron, fswatch, webhook, command), the filesystem state store,
//! the local worker-CLI step runner, the engine IPC client and server, and
//! the git CLI probe.

pub mod git;
pub mod ipc;
pub mod sources;
pub mod state;
pub mod worker;
