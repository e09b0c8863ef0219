//! Debounced filesystem watch source using `notify-debouncer-mini`.
//!
//! Change batches inside the debounce window are coalesced into one
//! `Fswatch` event; optional glob patterns filter by file name or full
//! path.

use std::path::PathBuf;
use std::time::Duration;

// notify types come re-exported through notify-debouncer-mini so the
// watcher and debouncer agree on the notify version.
use notify_debouncer_mini::notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};

use conveyor_core::event::{EventSource, SourceError};
use conveyor_core::util::duration::parse_duration_or;
use conveyor_core::util::glob::glob_match;
use conveyor_types::event::{Event, EventPayload, FsChangeKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Emits debounced `Fswatch` events for a set of watched paths.
pub struct FswatchSource {
    source_id: String,
    paths: Vec<PathBuf>,
    patterns: Option<Vec<String>>,
    debounce: Duration,
}

impl FswatchSource {
    pub fn new(
        source_id: &str,
        paths: Vec<PathBuf>,
        patterns: Option<Vec<String>>,
        debounce: Option<&str>,
    ) -> Result<Self, SourceError> {
        if paths.is_empty() {
            return Err(SourceError::InvalidConfig(format!(
                "fswatch '{source_id}': at least one path is required"
            )));
        }
        Ok(Self {
            source_id: source_id.to_string(),
            paths,
            patterns,
            debounce: parse_duration_or(debounce, Duration::from_secs(2)),
        })
    }

    /// Keep only paths matching the configured patterns (all pass when no
    /// patterns are set). Matching is by file name or full path.
    fn filter_paths(&self, paths: Vec<PathBuf>) -> Vec<PathBuf> {
        let Some(patterns) = &self.patterns else { return paths };
        if patterns.is_empty() {
            return paths;
        }
        paths
            .into_iter()
            .filter(|path| {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                let full = path.display().to_string();
                patterns.iter().any(|p| glob_match(p, name) || glob_match(p, &full))
            })
            .collect()
    }
}

impl EventSource for FswatchSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn run(
        self,
        tx: mpsc::Sender<Event>,
        stop: CancellationToken,
    ) -> Result<(), SourceError> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<PathBuf>>(64);

        // The debouncer callback runs on notify's thread; hand batches to
        // the async side over a channel.
        let mut debouncer = new_debouncer(self.debounce, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let paths: Vec<PathBuf> = events.into_iter().map(|e| e.path).collect();
                    // Non-blocking: a full channel drops the batch rather
                    // than stalling notify's callback thread.
                    let _ = raw_tx.try_send(paths);
                }
                Err(e) => tracing::warn!(error = %e, "fswatch debouncer error"),
            }
        })
        .map_err(|e| SourceError::StartFailed {
            source_id: self.source_id.clone(),
            reason: e.to_string(),
        })?;

        for path in &self.paths {
            debouncer
                .watcher()
                .watch(path, RecursiveMode::Recursive)
                .map_err(|e| SourceError::StartFailed {
                    source_id: self.source_id.clone(),
                    reason: format!("watch '{}': {e}", path.display()),
                })?;
        }

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                batch = raw_rx.recv() => {
                    let Some(paths) = batch else { return Ok(()) };
                    let paths = self.filter_paths(paths);
                    if paths.is_empty() {
                        continue;
                    }
                    let event = Event::now(
                        &self.source_id,
                        EventPayload::Fswatch { paths, kind: FsChangeKind::Any },
                    );
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_paths() {
        assert!(FswatchSource::new("w", vec![], None, None).is_err());
    }

    #[test]
    fn test_filter_paths_by_pattern() {
        let source = FswatchSource::new(
            "w",
            vec![PathBuf::from("/data")],
            Some(vec!["*.csv".to_string()]),
            None,
        )
        .unwrap();

        let kept = source.filter_paths(vec![
            PathBuf::from("/data/report.csv"),
            PathBuf::from("/data/notes.txt"),
        ]);
        assert_eq!(kept, vec![PathBuf::from("/data/report.csv")]);
    }

    #[test]
    fn test_no_patterns_pass_all() {
        let source =
            FswatchSource::new("w", vec![PathBuf::from("/data")], None, None).unwrap();
        let paths = vec![PathBuf::from("/data/a"), PathBuf::from("/data/b")];
        assert_eq!(source.filter_paths(paths.clone()), paths);
    }

    #[tokio::test]
    async fn test_emits_event_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let source = FswatchSource::new(
            "w",
            vec![dir.path().to_path_buf()],
            None,
            Some("50ms"),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let stop = CancellationToken::new();
        let handle = tokio::spawn(source.run(tx, stop.clone()));

        // Give the watcher a moment to arm, then touch a file.
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::fs::write(dir.path().join("touched.txt"), "x").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("change should be observed")
            .unwrap();
        match event.payload {
            EventPayload::Fswatch { paths, .. } => {
                assert!(paths.iter().any(|p| p.ends_with("touched.txt")));
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        stop.cancel();
        handle.await.unwrap().unwrap();
    }
}
