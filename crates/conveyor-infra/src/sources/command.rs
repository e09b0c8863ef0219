//! Command event source: run a shell command on an interval and emit one
//! event per completion.

use std::process::Stdio;
use std::time::Duration;

use conveyor_core::event::{EventSource, SourceError};
use conveyor_core::util::parse_duration;
use conveyor_types::event::{Event, EventPayload};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bytes of stdout kept in the event payload.
const STDOUT_TAIL_BYTES: usize = 4_096;

/// Runs `sh -c <run>` every `period`; each completion emits a `Command`
/// event carrying the exit code and a stdout tail.
pub struct CommandSource {
    source_id: String,
    run: String,
    period: Duration,
}

impl CommandSource {
    pub fn new(source_id: &str, run: &str, every: &str) -> Result<Self, SourceError> {
        if run.trim().is_empty() {
            return Err(SourceError::InvalidConfig(format!(
                "command '{source_id}': 'run' must not be empty"
            )));
        }
        let period = parse_duration(every)
            .map_err(|e| SourceError::InvalidConfig(format!("command '{source_id}': {e}")))?;
        if period.is_zero() {
            return Err(SourceError::InvalidConfig(format!(
                "command '{source_id}': period must be > 0"
            )));
        }
        Ok(Self { source_id: source_id.to_string(), run: run.to_string(), period })
    }

    async fn run_once(&self) -> EventPayload {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.run)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let tail_start = stdout.len().saturating_sub(STDOUT_TAIL_BYTES);
                EventPayload::Command {
                    command: self.run.clone(),
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout_tail: stdout[tail_start..].to_string(),
                }
            }
            Err(e) => {
                tracing::warn!(
                    source_id = self.source_id.as_str(),
                    error = %e,
                    "command spawn failed"
                );
                EventPayload::Command {
                    command: self.run.clone(),
                    exit_code: -1,
                    stdout_tail: String::new(),
                }
            }
        }
    }
}

impl EventSource for CommandSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn run(
        self,
        tx: mpsc::Sender<Event>,
        stop: CancellationToken,
    ) -> Result<(), SourceError> {
        let mut ticker = tokio::time::interval(self.period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let payload = tokio::select! {
                        _ = stop.cancelled() => return Ok(()),
                        payload = self.run_once() => payload,
                    };
                    let event = Event::now(&self.source_id, payload);
                    tokio::select! {
                        _ = stop.cancelled() => return Ok(()),
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}
