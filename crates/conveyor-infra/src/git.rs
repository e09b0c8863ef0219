//! Git CLI probe for branch-lock enforcement.
//!
//! Shells out to `git` and adapts the results into the boxed callbacks the
//! executor's `BranchGuard` consumes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use conveyor_core::workflow::branch::{BranchError, BranchInfo, GitChangedFn, GitInspectFn};
use tokio::process::Command;

async fn git_output(workspace: &Path, args: &[&str]) -> Result<String, BranchError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| BranchError::Probe(format!("git spawn: {e}")))?;

    if !output.status.success() {
        return Err(BranchError::Probe(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Inspect toplevel, current branch, and HEAD.
pub async fn inspect(workspace: &Path) -> Result<BranchInfo, BranchError> {
    let toplevel = git_output(workspace, &["rev-parse", "--show-toplevel"]).await?;
    let branch = git_output(workspace, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    let head = git_output(workspace, &["rev-parse", "HEAD"]).await?;
    Ok(BranchInfo { toplevel: PathBuf::from(toplevel), branch, head })
}

/// Paths with tracked modifications in the working tree.
pub async fn changed_paths(workspace: &Path) -> Result<Vec<String>, BranchError> {
    let text = git_output(workspace, &["status", "--porcelain"]).await?;
    Ok(text
        .lines()
        .filter_map(|line| line.get(3..))
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .collect())
}

/// Boxed inspect callback for `BranchGuard`.
pub fn inspect_fn() -> GitInspectFn {
    Arc::new(|workspace: PathBuf| Box::pin(async move { inspect(&workspace).await }))
}

/// Boxed changed-paths callback for `BranchGuard`.
pub fn changed_fn() -> GitChangedFn {
    Arc::new(|workspace: PathBuf| Box::pin(async move { changed_paths(&workspace).await }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "work"],
            vec!["config", "user.email", "t@example.com"],
            vec!["config", "user.name", "t"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(dir)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .unwrap();
            assert!(status.success(), "git {args:?}");
        }
        tokio::fs::write(dir.join("a.txt"), "hello").await.unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "init"]] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(dir)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .unwrap();
            assert!(status.success(), "git {args:?}");
        }
    }

    #[tokio::test]
    async fn test_inspect_reports_branch_and_head() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;

        let info = inspect(dir.path()).await.unwrap();
        assert_eq!(info.branch, "work");
        assert_eq!(info.head.len(), 40);
    }

    #[tokio::test]
    async fn test_changed_paths_lists_modifications() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;

        assert!(changed_paths(dir.path()).await.unwrap().is_empty());

        tokio::fs::write(dir.path().join("a.txt"), "changed").await.unwrap();
        let changed = changed_paths(dir.path()).await.unwrap();
        assert_eq!(changed, vec!["a.txt"]);
    }

    #[tokio::test]
    async fn test_inspect_outside_repo_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect(dir.path()).await.is_err());
    }
}
