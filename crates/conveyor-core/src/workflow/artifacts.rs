//! Artifact staging between the context directory and step workspaces.
//!
//! Inputs copy `context/<from>/<artifact>` into `workspace/<as ?? artifact>`
//! before a step runs (missing sources are silently skipped). Outputs copy
//! `workspace/<path>` into `context/<step>/<name>` after a step succeeds
//! (file to file, directory recursively). Every path must resolve strictly
//! inside its base directory; that is validated before any I/O.

use std::path::{Path, PathBuf};

use conveyor_types::config::{is_contained_relative, is_safe_path_segment};
use conveyor_types::workflow::{ArtifactInput, ArtifactOutput};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from artifact staging.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("unsafe artifact path '{0}'")]
    UnsafePath(String),

    #[error("artifact copy failed ({path}): {reason}")]
    Copy { path: String, reason: String },

    #[error("context write failed ({path}): {reason}")]
    Write { path: String, reason: String },
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Copy declared inputs from the context directory into the workspace.
/// Missing sources are skipped with a debug log.
pub async fn stage_inputs(
    context_dir: &Path,
    workspace: &Path,
    inputs: &[ArtifactInput],
) -> Result<(), ArtifactError> {
    for input in inputs {
        let relative = PathBuf::from(&input.from).join(&input.artifact);
        check_segments(&relative)?;
        let source = context_dir.join(&relative);

        let dest_name = input.rename.as_deref().unwrap_or(&input.artifact);
        let dest_rel = PathBuf::from(dest_name);
        check_segments(&dest_rel)?;
        let dest = workspace.join(&dest_rel);

        if tokio::fs::metadata(&source).await.is_err() {
            tracing::debug!(
                artifact = input.artifact.as_str(),
                from = input.from.as_str(),
                "input artifact missing, skipping"
            );
            continue;
        }

        copy_recursive(&source, &dest).await?;
    }
    Ok(())
}

/// Copy declared outputs from the workspace into `context/<step_id>/`.
pub async fn collect_outputs(
    context_dir: &Path,
    step_id: &str,
    workspace: &Path,
    outputs: &[ArtifactOutput],
) -> Result<(), ArtifactError> {
    for output in outputs {
        if !is_safe_path_segment(&output.name) {
            return Err(ArtifactError::UnsafePath(output.name.clone()));
        }
        if !is_contained_relative(&output.path) {
            return Err(ArtifactError::UnsafePath(output.path.display().to_string()));
        }

        let source = workspace.join(&output.path);
        let dest = context_dir.join(step_id).join(&output.name);

        if tokio::fs::metadata(&source).await.is_err() {
            tracing::debug!(
                step_id,
                path = %output.path.display(),
                "declared output missing in workspace"
            );
            continue;
        }

        copy_recursive(&source, &dest).await?;
    }
    Ok(())
}

/// Write a JSON document into the context directory (creating parents).
pub async fn write_context_json(
    context_dir: &Path,
    relative: &Path,
    value: &serde_json::Value,
) -> Result<(), ArtifactError> {
    check_segments(relative)?;
    let path = context_dir.join(relative);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| ArtifactError::Write {
            path: parent.display().to_string(),
            reason: e.to_string(),
        })?;
    }
    let text = serde_json::to_string_pretty(value).map_err(|e| ArtifactError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    tokio::fs::write(&path, text).await.map_err(|e| ArtifactError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn check_segments(relative: &Path) -> Result<(), ArtifactError> {
    if !is_contained_relative(relative) {
        return Err(ArtifactError::UnsafePath(relative.display().to_string()));
    }
    for component in relative.components() {
        if let std::path::Component::Normal(part) = component {
            let part = part.to_string_lossy();
            if !is_safe_path_segment(&part) && !part.starts_with('_') {
                return Err(ArtifactError::UnsafePath(relative.display().to_string()));
            }
        }
    }
    Ok(())
}

/// Recursive file/directory copy. Box-pinned for async recursion.
fn copy_recursive<'a>(
    source: &'a Path,
    dest: &'a Path,
) -> futures_util::future::BoxFuture<'a, Result<(), ArtifactError>> {
    Box::pin(async move {
        let copy_err = |e: std::io::Error| ArtifactError::Copy {
            path: source.display().to_string(),
            reason: e.to_string(),
        };

        let metadata = tokio::fs::metadata(source).await.map_err(copy_err)?;
        if metadata.is_dir() {
            tokio::fs::create_dir_all(dest).await.map_err(copy_err)?;
            let mut entries = tokio::fs::read_dir(source).await.map_err(copy_err)?;
            while let Some(entry) = entries.next_entry().await.map_err(copy_err)? {
                let child_dest = dest.join(entry.file_name());
                copy_recursive(&entry.path(), &child_dest).await?;
            }
        } else {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(copy_err)?;
            }
            tokio::fs::copy(source, dest).await.map_err(copy_err)?;
        }
        Ok(())
    })
}
