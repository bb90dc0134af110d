#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

pub fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} in {} failed: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create a bare remote plus a working repo on a pushed PR branch.
///
/// The working repo has `file.py` committed on `feature/fix-1` with a known
/// buggy marker line, and the branch tracks the bare remote.
pub fn setup_pr_repo() -> (tempfile::TempDir, tempfile::TempDir) {
    let bare = tempfile::TempDir::new().unwrap();
    run_git(bare.path(), &["init", "--bare"]);

    let repo = tempfile::TempDir::new().unwrap();
    run_git(repo.path(), &["init"]);
    run_git(repo.path(), &["config", "user.email", "test@test.com"]);
    run_git(repo.path(), &["config", "user.name", "Test"]);
    run_git(repo.path(), &["commit", "--allow-empty", "-m", "init"]);
    run_git(repo.path(), &["branch", "-M", "main"]);
    run_git(
        repo.path(),
        &["remote", "add", "origin", bare.path().to_str().unwrap()],
    );
    run_git(repo.path(), &["push", "-u", "origin", "main"]);

    run_git(repo.path(), &["checkout", "-b", "feature/fix-1"]);
    std::fs::write(
        repo.path().join("file.py"),
        "def lookup(user_id):\n    return query(user_id)  # BUG\n",
    )
    .unwrap();
    run_git(repo.path(), &["add", "file.py"]);
    run_git(repo.path(), &["commit", "-m", "add lookup"]);
    run_git(repo.path(), &["push", "-u", "origin", "feature/fix-1"]);

    (bare, repo)
}

pub fn file_contains(repo: &Path, name: &str, needle: &str) -> bool {
    std::fs::read_to_string(repo.join(name))
        .map(|content| content.contains(needle))
        .unwrap_or(false)
}

/// Commit count on the current branch of a repo.
pub fn commit_count(repo: &Path) -> usize {
    let output = Command::new("git")
        .args(["rev-list", "--count", "HEAD"])
        .current_dir(repo)
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .unwrap()
}
