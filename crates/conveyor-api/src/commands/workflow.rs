//! `cnvy workflow run` and `cnvy workflow validate`.

use std::path::PathBuf;

use conveyor_core::workflow::definition::parse_workflow;

use crate::commands::load_catalog;
use crate::invoker::run_workflow_once;

/// Execute a workflow once; prints the final state as JSON.
/// Exit code 0 on SUCCEEDED, 1 otherwise.
pub async fn run(
    file: PathBuf,
    workspace: Option<PathBuf>,
    agents_file: Option<PathBuf>,
) -> anyhow::Result<i32> {
    let workspace = match workspace {
        Some(workspace) => workspace,
        None => std::env::current_dir()?,
    };
    let catalog = load_catalog(agents_file.as_deref()).await?;

    let state = run_workflow_once(&file, workspace, catalog).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(if state.succeeded() { 0 } else { 1 })
}

/// Parse and validate a workflow file. Exit 0 when valid.
pub async fn validate(file: PathBuf) -> anyhow::Result<i32> {
    let text = tokio::fs::read_to_string(&file)
        .await
        .map_err(|e| anyhow::anyhow!("read {}: {e}", file.display()))?;
    match parse_workflow(&text) {
        Ok(definition) => {
            println!(
                "{}: ok ({} steps, timeout {})",
                definition.name,
                definition.steps.len(),
                definition.timeout
            );
            Ok(0)
        }
        Err(e) => {
            eprintln!("invalid workflow: {e}");
            Ok(1)
        }
    }
}
