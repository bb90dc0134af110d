use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

/// Run a git command in `dir`, returning trimmed stdout or stderr as the error.
pub fn git_in_dir(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| Error::Git(format!("failed to run git {}: {e}", args.join(" "))))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(Error::Git(format!("git {} failed: {stderr}", args.join(" "))))
    }
}

pub fn checkout(dir: &Path, branch: &str) -> Result<()> {
    git_in_dir(dir, &["checkout", branch])?;
    debug!(branch, "checked out");
    Ok(())
}

pub fn pull_rebase(dir: &Path) -> Result<()> {
    git_in_dir(dir, &["pull", "--rebase"])?;
    Ok(())
}

/// `git status --porcelain`; empty output means a clean tree.
pub fn status_porcelain(dir: &Path) -> Result<String> {
    git_in_dir(dir, &["status", "--porcelain"])
}

/// Stage only the named paths, never `-A`.
pub fn add_paths(dir: &Path, paths: &[String]) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }
    let mut args = vec!["add", "--"];
    args.extend(paths.iter().map(String::as_str));
    git_in_dir(dir, &args)?;
    Ok(())
}

pub fn commit(dir: &Path, message: &str) -> Result<()> {
    git_in_dir(dir, &["commit", "-m", message])?;
    Ok(())
}

pub fn head_sha(dir: &Path) -> Result<String> {
    git_in_dir(dir, &["rev-parse", "HEAD"])
}

pub fn push(dir: &Path) -> Result<()> {
    git_in_dir(dir, &["push"])?;
    Ok(())
}

/// Discard working-tree changes to tracked files (`git checkout -- .`).
pub fn restore_tracked(dir: &Path) -> Result<()> {
    git_in_dir(dir, &["checkout", "--", "."])?;
    Ok(())
}
