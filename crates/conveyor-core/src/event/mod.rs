//! Event-source contract and stream merging.

pub mod source;

pub use source::{merge_sources, EventSource, SourceError, DEFAULT_EVENT_CHANNEL_CAPACITY};
