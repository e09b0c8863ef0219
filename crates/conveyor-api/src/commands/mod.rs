//! Command handlers for the `cnvy` CLI.

pub mod daemon;
pub mod engine;
pub mod workflow;

use conveyor_types::config::AgentCatalog;
use std::path::Path;

/// Load the agent catalog, falling back to built-in defaults.
pub async fn load_catalog(path: Option<&Path>) -> anyhow::Result<AgentCatalog> {
    match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| anyhow::anyhow!("read {}: {e}", path.display()))?;
            Ok(AgentCatalog::from_yaml(&text)?)
        }
        None => Ok(AgentCatalog::default()),
    }
}
