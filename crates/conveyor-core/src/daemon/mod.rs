//! Daemon dispatch: bounded per-trigger queueing and the global
//! concurrent-workflow cap.

pub mod dispatch;
pub mod queue;

pub use dispatch::{Daemon, DispatchOptions, WorkflowInvoker};
pub use queue::{DispatchQueue, QueuedItem};
