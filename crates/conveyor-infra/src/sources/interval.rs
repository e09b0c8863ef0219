//! Fixed-interval tick source.

use std::time::Duration;

use conveyor_core::event::{EventSource, SourceError};
use conveyor_core::util::parse_duration;
use conveyor_types::event::{Event, EventPayload};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Emits an `Interval` event every `period`.
pub struct IntervalSource {
    source_id: String,
    period: Duration,
}

impl IntervalSource {
    pub fn new(source_id: &str, every: &str) -> Result<Self, SourceError> {
        let period = parse_duration(every)
            .map_err(|e| SourceError::InvalidConfig(format!("interval '{source_id}': {e}")))?;
        if period.is_zero() {
            return Err(SourceError::InvalidConfig(format!(
                "interval '{source_id}': period must be > 0"
            )));
        }
        Ok(Self { source_id: source_id.to_string(), period })
    }
}

impl EventSource for IntervalSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn run(
        self,
        tx: mpsc::Sender<Event>,
        stop: CancellationToken,
    ) -> Result<(), SourceError> {
        let mut ticker = tokio::time::interval(self.period);
        // The first tick is immediate; skip it so the period is honored.
        ticker.tick().await;

        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    tick += 1;
                    let event = Event::now(&self.source_id, EventPayload::Interval { tick });
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
