//! `cnvy daemon run`: the long-lived event loop.

use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use conveyor_core::daemon::{Daemon, DispatchOptions};
use conveyor_core::event::merge_sources;
use conveyor_core::state::StateStore;
use conveyor_core::trigger::TriggerEngine;
use conveyor_infra::ipc::EngineConnection;
use conveyor_infra::sources::{build_sources, cron};
use conveyor_infra::state::FsStateStore;
use conveyor_types::config::{DaemonConfig, EventDef};
use tokio_util::sync::CancellationToken;

use crate::commands::load_catalog;
use crate::invoker::DaemonInvoker;

/// Run the daemon until the event stream ends or a signal arrives.
/// Returns the process exit code (130 SIGINT, 143 SIGTERM).
pub async fn run(config_path: &Path, supervised: bool) -> anyhow::Result<i32> {
    let text = tokio::fs::read_to_string(config_path)
        .await
        .map_err(|e| anyhow::anyhow!("read {}: {e}", config_path.display()))?;
    let config = DaemonConfig::from_yaml(&text)?;

    let catalog = load_catalog(config.agents_file.as_deref()).await?;
    let store = Arc::new(FsStateStore::new(config.state_dir()));
    store.init().await?;

    log_missed_cron_runs(&config, &store).await;

    // One stop token for event sources, one shutdown token linked into
    // executors. Both cancel on exit.
    let source_stop = CancellationToken::new();
    let shutdown = CancellationToken::new();

    let sources = build_sources(&config.events)?;
    let (mut events, source_handles) = merge_sources(sources, &source_stop);

    let engine = if supervised {
        let exe = std::env::current_exe()?;
        let conn = EngineConnection::spawn_engine(
            exe.to_str().unwrap_or("cnvy"),
            &["engine", "serve"],
        )?;
        tracing::info!("supervised engine process started");
        Some(Arc::new(conn))
    } else {
        None
    };

    let invoker = DaemonInvoker::new(
        config.clone(),
        catalog,
        Arc::clone(&store),
        shutdown.clone(),
        engine,
    );
    let daemon = Daemon::new(
        invoker,
        DispatchOptions {
            max_concurrent: config.max_concurrent_workflows,
            ..Default::default()
        },
    );
    let trigger_engine = TriggerEngine::new(config.triggers.clone(), Arc::clone(&store));

    tracing::info!(
        name = config.name.as_str(),
        sources = config.events.len(),
        triggers = config.triggers.len(),
        max_concurrent = config.max_concurrent_workflows,
        "daemon started"
    );

    let mut sigint = signal_stream(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal_stream(tokio::signal::unix::SignalKind::terminate())?;

    let mut exit_code = 0;
    loop {
        tokio::select! {
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else {
                    tracing::warn!("event stream ended");
                    break;
                };
                if let Err(e) = trigger_engine.handle_event(&event, &daemon).await {
                    tracing::error!(error = %e, "trigger state persistence failed");
                }
            }
            _ = sigint.recv() => {
                tracing::info!("SIGINT received, shutting down");
                exit_code = 130;
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, shutting down");
                exit_code = 143;
                break;
            }
        }
    }

    // Orderly shutdown: stop sources, abort workflows, drain, persist.
    source_stop.cancel();
    shutdown.cancel();
    daemon.stop().await;
    for handle in source_handles {
        let _ = handle.await;
    }
    if let Err(e) = store
        .save_daemon(&serde_json::json!({
            "name": config.name,
            "stopped_at": Utc::now(),
        }))
        .await
    {
        tracing::warn!(error = %e, "daemon state persistence failed");
    }

    Ok(exit_code)
}

fn signal_stream(
    kind: tokio::signal::unix::SignalKind,
) -> anyhow::Result<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(kind).map_err(|e| anyhow::anyhow!("signal handler: {e}"))
}

/// On startup, report cron occurrences missed while the daemon was down.
/// They are logged, never replayed.
async fn log_missed_cron_runs(config: &DaemonConfig, store: &Arc<FsStateStore>) {
    for (source_id, def) in &config.events {
        let EventDef::Cron { schedule } = def else { continue };
        for (trigger_id, trigger) in &config.triggers {
            if &trigger.on != source_id {
                continue;
            }
            let last_fired = match store.load(trigger_id).await {
                Ok(Some(state)) => state
                    .last_fired_at
                    .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single()),
                _ => None,
            };
            let missed = cron::missed_runs(schedule, last_fired);
            if !missed.is_empty() {
                tracing::warn!(
                    trigger_id = trigger_id.as_str(),
                    source_id = source_id.as_str(),
                    count = missed.len(),
                    "cron occurrences missed while the daemon was down"
                );
            }
        }
    }
}

