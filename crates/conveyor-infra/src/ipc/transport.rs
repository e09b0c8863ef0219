//! Framed JSON-line transport to the engine process.
//!
//! One JSON document per line in each direction. A reader task routes
//! inbound messages: acks and permit replies resolve by `request_id`,
//! `job_completed` resolves by `job_id`, `job_event` is logged. Duplicate,
//! unknown, and late messages (after waiter cleanup) are dropped with a
//! debug log rather than buffered.

use std::process::Stdio;
use std::sync::Arc;

use conveyor_types::ipc::{ClientMessage, EngineMessage};
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from the IPC transport.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("engine spawn failed: {0}")]
    Spawn(String),

    #[error("transport write failed: {0}")]
    Write(String),

    #[error("transport closed")]
    Closed,

    #[error("message encode failed: {0}")]
    Encode(String),

    #[error("request timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// EngineConnection
// ---------------------------------------------------------------------------

/// Client side of one engine connection.
pub struct EngineConnection {
    writer: Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
    pending_requests: Arc<DashMap<Uuid, oneshot::Sender<EngineMessage>>>,
    pending_completions: Arc<DashMap<Uuid, oneshot::Sender<EngineMessage>>>,
    reader: JoinHandle<()>,
    /// Owns the engine child process when spawned by `spawn_engine`.
    _child: Option<tokio::process::Child>,
}

impl EngineConnection {
    /// Build a connection over arbitrary stream halves (tests use an
    /// in-memory duplex).
    pub fn new(
        reader: impl AsyncRead + Unpin + Send + 'static,
        writer: impl AsyncWrite + Unpin + Send + 'static,
    ) -> Self {
        let pending_requests: Arc<DashMap<Uuid, oneshot::Sender<EngineMessage>>> =
            Arc::new(DashMap::new());
        let pending_completions: Arc<DashMap<Uuid, oneshot::Sender<EngineMessage>>> =
            Arc::new(DashMap::new());

        let reader_task = {
            let pending_requests = Arc::clone(&pending_requests);
            let pending_completions = Arc::clone(&pending_completions);
            tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let message: EngineMessage = match serde_json::from_str(&line) {
                                Ok(message) => message,
                                Err(e) => {
                                    tracing::warn!(error = %e, "undecodable engine frame");
                                    continue;
                                }
                            };
                            route(&pending_requests, &pending_completions, message);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "engine transport read error");
                            break;
                        }
                    }
                }
                tracing::debug!("engine transport reader stopped");
            })
        };

        Self {
            writer: Mutex::new(Box::new(writer)),
            pending_requests,
            pending_completions,
            reader: reader_task,
            _child: None,
        }
    }

    /// Spawn `program args...` as the engine process and connect over its
    /// stdio.
    pub fn spawn_engine(program: &str, args: &[&str]) -> Result<Self, IpcError> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IpcError::Spawn(e.to_string()))?;

        let stdout = child.stdout.take().ok_or_else(|| IpcError::Spawn("no stdout".into()))?;
        let stdin = child.stdin.take().ok_or_else(|| IpcError::Spawn("no stdin".into()))?;

        let mut conn = Self::new(stdout, stdin);
        conn._child = Some(child);
        Ok(conn)
    }

    /// Send a message without expecting a reply (best-effort cancel).
    pub async fn send(&self, message: &ClientMessage) -> Result<(), IpcError> {
        let mut line = serde_json::to_vec(message).map_err(|e| IpcError::Encode(e.to_string()))?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await.map_err(|e| IpcError::Write(e.to_string()))?;
        writer.flush().await.map_err(|e| IpcError::Write(e.to_string()))
    }

    /// Send a message and await the reply correlated by `request_id`.
    pub async fn request(&self, message: ClientMessage) -> Result<EngineMessage, IpcError> {
        let request_id = message.request_id();
        let (tx, rx) = oneshot::channel();
        self.pending_requests.insert(request_id, tx);

        if let Err(e) = self.send(&message).await {
            self.pending_requests.remove(&request_id);
            return Err(e);
        }

        let reply = rx.await.map_err(|_| IpcError::Closed);
        self.pending_requests.remove(&request_id);
        reply
    }

    /// Register interest in a job's `job_completed`. Register before
    /// submitting so an early completion is not dropped.
    pub fn register_completion(&self, job_id: Uuid) -> oneshot::Receiver<EngineMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending_completions.insert(job_id, tx);
        rx
    }

    /// Drop a job's completion waiter; later completions are discarded.
    pub fn clear_completion(&self, job_id: Uuid) {
        self.pending_completions.remove(&job_id);
    }
}

impl Drop for EngineConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn route(
    pending_requests: &DashMap<Uuid, oneshot::Sender<EngineMessage>>,
    pending_completions: &DashMap<Uuid, oneshot::Sender<EngineMessage>>,
    message: EngineMessage,
) {
    match &message {
        EngineMessage::JobAck { request_id }
        | EngineMessage::PermitGranted { request_id, .. }
        | EngineMessage::PermitRejected { request_id, .. } => {
            match pending_requests.remove(request_id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(message);
                }
                None => {
                    tracing::debug!(request_id = %request_id, "dropping late reply");
                }
            }
        }
        EngineMessage::JobCompleted { job_id, .. } => {
            match pending_completions.remove(job_id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(message);
                }
                None => {
                    tracing::debug!(job_id = %job_id, "dropping completion for unknown job");
                }
            }
        }
        EngineMessage::JobEvent { job_id, event, .. } => {
            tracing::debug!(job_id = %job_id, event = %event, "job event");
        }
    }
}
