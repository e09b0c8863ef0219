//! Engine IPC: framed JSON-line transport, the supervised-mode step
//! runner (client), and the engine-side server loop.

pub mod client;
pub mod server;
pub mod transport;

pub use client::{EngineRunnerOptions, EngineStepRunner};
pub use server::EngineServer;
pub use transport::{EngineConnection, IpcError};
