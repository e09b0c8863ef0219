//! Event-source contract: each source pushes `Event`s into a shared channel
//! until a stop signal fires.
//!
//! `merge_sources` fuses any number of sources into one multiplexed
//! `mpsc::Receiver<Event>`: every source gets a clone of the sender and a
//! child of the shared stop token. When the stop token cancels, all
//! producers wind down and the receiver drains to completion.

use conveyor_types::event::Event;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default bound of the merged event channel. Sources block (and therefore
/// naturally backpressure) when the daemon falls behind.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors an event source may report from its run loop.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source '{source_id}' failed to start: {reason}")]
    StartFailed { source_id: String, reason: String },

    #[error("source '{source_id}' stopped unexpectedly: {reason}")]
    Stopped { source_id: String, reason: String },

    #[error("invalid source configuration: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// EventSource
// ---------------------------------------------------------------------------

/// A producer of events.
///
/// `run` owns the production loop: it emits events into `tx` until `stop`
/// is cancelled, then returns. Implementations must treat a closed channel
/// as a stop request as well. Uses native async fn in traits; sources are
/// consumed by `merge_sources`, which boxes them per spawned task.
pub trait EventSource: Send + 'static {
    /// The configured source id stamped on every emitted event.
    fn source_id(&self) -> &str;

    /// Produce events until cancelled.
    fn run(
        self,
        tx: mpsc::Sender<Event>,
        stop: CancellationToken,
    ) -> impl std::future::Future<Output = Result<(), SourceError>> + Send;
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

/// Fuse many sources into a single event stream.
///
/// Returns the merged receiver and the producer join handles (useful for
/// surfacing startup failures in tests and for orderly shutdown). Each
/// producer gets a child of `stop`; cancelling it terminates all of them.
pub fn merge_sources<S: EventSource>(
    sources: Vec<S>,
    stop: &CancellationToken,
) -> (mpsc::Receiver<Event>, Vec<JoinHandle<Result<(), SourceError>>>) {
    let (tx, rx) = mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY);
    let mut handles = Vec::with_capacity(sources.len());

    for source in sources {
        let tx = tx.clone();
        let child_stop = stop.child_token();
        let id = source.source_id().to_string();
        handles.push(tokio::spawn(async move {
            let result = source.run(tx, child_stop).await;
            match &result {
                Ok(()) => tracing::debug!(source_id = id.as_str(), "event source stopped"),
                Err(e) => tracing::warn!(source_id = id.as_str(), error = %e, "event source failed"),
            }
            result
        }));
    }

    // Drop the original sender so the receiver closes once every producer
    // has exited.
    drop(tx);

    (rx, handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::event::EventPayload;

    /// Test source that emits `count` interval ticks then stops.
    struct TickSource {
        id: String,
        count: u64,
    }

    impl EventSource for TickSource {
        fn source_id(&self) -> &str {
            &self.id
        }

        async fn run(
            self,
            tx: mpsc::Sender<Event>,
            stop: CancellationToken,
        ) -> Result<(), SourceError> {
            for tick in 1..=self.count {
                let event = Event::now(&self.id, EventPayload::Interval { tick });
                tokio::select! {
                    _ = stop.cancelled() => return Ok(()),
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_merge_interleaves_all_sources() {
        let stop = CancellationToken::new();
        let sources = vec![
            TickSource { id: "a".to_string(), count: 3 },
            TickSource { id: "b".to_string(), count: 2 },
        ];
        let (mut rx, handles) = merge_sources(sources, &stop);

        let mut seen_a = 0;
        let mut seen_b = 0;
        while let Some(event) = rx.recv().await {
            match event.source_id.as_str() {
                "a" => seen_a += 1,
                "b" => seen_b += 1,
                other => panic!("unexpected source {other}"),
            }
        }
        assert_eq!(seen_a, 3);
        assert_eq!(seen_b, 2);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_stop_terminates_producers() {
        struct Endless {
            id: String,
        }
        impl EventSource for Endless {
            fn source_id(&self) -> &str {
                &self.id
            }
            async fn run(
                self,
                tx: mpsc::Sender<Event>,
                stop: CancellationToken,
            ) -> Result<(), SourceError> {
                let mut tick = 0;
                loop {
                    tick += 1;
                    let event = Event::now(&self.id, EventPayload::Interval { tick });
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

        let stop = CancellationToken::new();
        let (mut rx, handles) =
            merge_sources(vec![Endless { id: "x".to_string() }], &stop);

        // Receive a couple of events, then stop.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        stop.cancel();

        // The channel drains and closes.
        while rx.recv().await.is_some() {}
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_merge_no_sources_closes_immediately() {
        let stop = CancellationToken::new();
        let (mut rx, handles) = merge_sources(Vec::<TickSource>::new(), &stop);
        assert!(rx.recv().await.is_none());
        assert!(handles.is_empty());
    }
}
