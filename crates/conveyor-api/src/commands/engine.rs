//! `cnvy engine serve`: host the permit gate and worker runner on stdio.

use std::path::PathBuf;
use std::sync::Arc;

use conveyor_core::permit::gate::{GateOptions, PermitGate};
use conveyor_infra::ipc::EngineServer;
use conveyor_infra::worker::LocalProcessRunner;

use crate::commands::load_catalog;

pub async fn serve(
    max_concurrency: usize,
    max_rps: Option<u32>,
    cost_budget: Option<f64>,
    agents_file: Option<PathBuf>,
) -> anyhow::Result<i32> {
    let catalog = load_catalog(agents_file.as_deref()).await?;

    let gate = Arc::new(PermitGate::new(GateOptions {
        max_concurrency,
        max_rps,
        max_cost_budget: cost_budget,
        ..Default::default()
    }));
    let runner = Arc::new(LocalProcessRunner::new(catalog));

    tracing::info!(max_concurrency, "engine serving on stdio");
    let server = EngineServer::new(gate, runner);
    server.run(tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(0)
}
