//! Event-source implementations.
//!
//! Each source implements `conveyor_core::event::EventSource`: a run loop
//! that pushes `Event`s into the merged channel until the shared stop token
//! cancels. `build_sources` turns the daemon config's `events:` table into
//! a boxed source list.

pub mod command;
pub mod cron;
pub mod fswatch;
pub mod interval;
pub mod webhook;

use conveyor_core::event::{EventSource, SourceError};
use conveyor_types::config::EventDef;
use conveyor_types::event::Event;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A boxed event source (the daemon holds a heterogeneous list).
pub enum AnySource {
    Interval(interval::IntervalSource),
    Cron(cron::CronSource),
    Fswatch(fswatch::FswatchSource),
    Webhook(webhook::WebhookSource),
    Command(command::CommandSource),
}

impl EventSource for AnySource {
    fn source_id(&self) -> &str {
        match self {
            AnySource::Interval(s) => s.source_id(),
            AnySource::Cron(s) => s.source_id(),
            AnySource::Fswatch(s) => s.source_id(),
            AnySource::Webhook(s) => s.source_id(),
            AnySource::Command(s) => s.source_id(),
        }
    }

    async fn run(
        self,
        tx: mpsc::Sender<Event>,
        stop: CancellationToken,
    ) -> Result<(), SourceError> {
        match self {
            AnySource::Interval(s) => s.run(tx, stop).await,
            AnySource::Cron(s) => s.run(tx, stop).await,
            AnySource::Fswatch(s) => s.run(tx, stop).await,
            AnySource::Webhook(s) => s.run(tx, stop).await,
            AnySource::Command(s) => s.run(tx, stop).await,
        }
    }
}

/// Build sources from the config's `events:` table, in document order.
pub fn build_sources(events: &[(String, EventDef)]) -> Result<Vec<AnySource>, SourceError> {
    let mut sources = Vec::with_capacity(events.len());
    for (source_id, def) in events {
        let source = match def {
            EventDef::Interval { every } => {
                AnySource::Interval(interval::IntervalSource::new(source_id, every)?)
            }
            EventDef::Cron { schedule } => {
                AnySource::Cron(cron::CronSource::new(source_id, schedule)?)
            }
            EventDef::Fswatch { paths, patterns, debounce } => AnySource::Fswatch(
                fswatch::FswatchSource::new(source_id, paths.clone(), patterns.clone(), debounce.as_deref())?,
            ),
            EventDef::Webhook { path, bind, secret } => AnySource::Webhook(
                webhook::WebhookSource::new(source_id, path, bind.as_deref(), secret.clone()),
            ),
            EventDef::Command { run, every } => {
                AnySource::Command(command::CommandSource::new(source_id, run, every)?)
            }
        };
        sources.push(source);
    }
    Ok(sources)
}
