use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Config, MergeMethod};
use crate::provider::Provider;

const MERGEABLE_POLL_ATTEMPTS: u32 = 10;
const MERGEABLE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SETTLE_BETWEEN_MERGES: Duration = Duration::from_secs(2);

/// Result of one merge attempt.
#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub pr_number: u64,
    pub success: bool,
    pub method: String,
    pub commit_sha: Option<String>,
    pub error: Option<String>,
    pub merged_at: Option<DateTime<Utc>>,
}

impl MergeResult {
    fn failure(pr_number: u64, method: MergeMethod, error: String) -> Self {
        Self {
            pr_number,
            success: false,
            method: method.as_str().to_string(),
            commit_sha: None,
            error: Some(error),
            merged_at: None,
        }
    }
}

/// Merge readiness of one PR, as reported by a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct MergeReadiness {
    pub pr_number: u64,
    pub mergeable: bool,
    pub merge_reason: String,
    pub ci_passed: bool,
    pub ci_status: String,
    pub ready: bool,
}

/// Executes merges sequentially: mergeable polling, optional update-branch
/// when behind, CI gating, then the provider merge call.
pub struct MergeExecutor<P> {
    provider: Arc<P>,
    method: MergeMethod,
    delete_branch_after_merge: bool,
    auto_rebase_on_conflict: bool,
}

impl<P: Provider> MergeExecutor<P> {
    pub fn new(provider: Arc<P>, config: &Config) -> Self {
        Self {
            provider,
            method: config.merge_method,
            delete_branch_after_merge: config.delete_branch_after_merge,
            auto_rebase_on_conflict: config.auto_rebase_on_conflict,
        }
    }

    /// Poll until the provider has computed the mergeable flag, then judge it.
    pub async fn check_mergeable(&self, pr_number: u64) -> (bool, String) {
        let mut pr = match self.provider.get_pr(pr_number) {
            Ok(pr) => pr,
            Err(e) => return (false, format!("provider error: {e}")),
        };

        for _ in 0..MERGEABLE_POLL_ATTEMPTS {
            if pr.mergeable.is_some() {
                break;
            }
            tokio::time::sleep(MERGEABLE_POLL_INTERVAL).await;
            pr = match self.provider.get_pr(pr_number) {
                Ok(pr) => pr,
                Err(e) => return (false, format!("provider error: {e}")),
            };
        }

        let state = pr.mergeable_state.as_deref().unwrap_or("unknown");
        match pr.mergeable {
            None => (false, "Mergeable state unknown".to_string()),
            Some(false) => (false, format!("PR has conflicts (mergeable_state: {state})")),
            Some(true) if state == "blocked" => {
                (false, "PR is blocked by branch protection rules".to_string())
            }
            Some(true) if state == "behind" => (false, "PR is behind base branch".to_string()),
            Some(true) => (true, "OK".to_string()),
        }
    }

    /// Combined commit status plus check runs; anything that is neither
    /// successful, skipped, nor neutral blocks the merge.
    pub fn check_ci(&self, head_sha: &str) -> (bool, String) {
        let combined = match self.provider.combined_status(head_sha) {
            Ok(combined) => combined,
            Err(e) => return (false, format!("provider error: {e}")),
        };
        match combined.state.as_str() {
            "pending" => return (false, "CI checks still running".to_string()),
            "failure" => {
                let failed: Vec<&str> = combined
                    .statuses
                    .iter()
                    .filter(|s| s.state == "failure")
                    .map(|s| s.context.as_str())
                    .collect();
                return (false, format!("CI checks failed: {}", failed.join(", ")));
            }
            "error" => return (false, "CI checks errored".to_string()),
            _ => {}
        }

        let runs = match self.provider.check_runs(head_sha) {
            Ok(runs) => runs,
            Err(e) => return (false, format!("provider error: {e}")),
        };
        for run in &runs {
            let conclusion = run.conclusion.as_deref().unwrap_or("");
            if !matches!(conclusion, "success" | "skipped" | "neutral") {
                if run.status == "in_progress" || run.status == "queued" {
                    return (false, format!("Check '{}' still running", run.name));
                }
                return (false, format!("Check '{}' failed: {conclusion}", run.name));
            }
        }

        (true, "All checks passed".to_string())
    }

    /// Merge one PR. Never retried: a failed merge is a terminal result.
    pub async fn merge(&self, pr_number: u64) -> MergeResult {
        let pr = match self.provider.get_pr(pr_number) {
            Ok(pr) => pr,
            Err(e) => return MergeResult::failure(pr_number, self.method, e.to_string()),
        };

        if pr.merged {
            return MergeResult {
                pr_number,
                success: true,
                method: self.method.as_str().to_string(),
                commit_sha: pr.merge_commit_sha,
                error: None,
                merged_at: Some(pr.updated_at),
            };
        }

        let (mut mergeable, mut reason) = self.check_mergeable(pr_number).await;
        if !mergeable && self.auto_rebase_on_conflict && reason.to_lowercase().contains("behind") {
            info!(pr_number, "PR is behind base; requesting branch update");
            match self.provider.update_branch(pr_number) {
                Ok(()) => (mergeable, reason) = self.check_mergeable(pr_number).await,
                Err(e) => warn!(pr_number, error = %e, "branch update failed"),
            }
        }
        if !mergeable {
            return MergeResult::failure(pr_number, self.method, reason);
        }

        let (ci_passed, ci_status) = self.check_ci(&pr.head.sha);
        if !ci_passed {
            return MergeResult::failure(pr_number, self.method, ci_status);
        }

        let message = format!("Merge PR #{pr_number}: {}", pr.title);
        match self.provider.merge_pr(pr_number, self.method, &message) {
            Ok(outcome) if outcome.merged => {
                if self.delete_branch_after_merge {
                    // Best effort; the branch may be protected or already gone
                    if let Err(e) = self.provider.delete_ref(&pr.head.branch) {
                        warn!(branch = %pr.head.branch, error = %e, "failed to delete branch");
                    } else {
                        info!(branch = %pr.head.branch, "deleted merged branch");
                    }
                }
                MergeResult {
                    pr_number,
                    success: true,
                    method: self.method.as_str().to_string(),
                    commit_sha: outcome.sha,
                    error: None,
                    merged_at: Some(Utc::now()),
                }
            }
            Ok(_) => MergeResult::failure(
                pr_number,
                self.method,
                "provider declined the merge".to_string(),
            ),
            Err(e) => MergeResult::failure(pr_number, self.method, e.to_string()),
        }
    }

    /// Merge PRs strictly sequentially in the given order.
    pub async fn execute_merge_plan(
        &self,
        pr_order: &[u64],
        stop_on_failure: bool,
    ) -> Vec<MergeResult> {
        let mut results = Vec::with_capacity(pr_order.len());

        for (i, &pr_number) in pr_order.iter().enumerate() {
            info!(pr_number, "merging PR");
            let result = self.merge(pr_number).await;
            let failed = !result.success;
            if failed {
                warn!(pr_number, error = ?result.error, "merge failed");
            } else {
                info!(pr_number, sha = ?result.commit_sha, "merged");
            }
            results.push(result);

            if failed && stop_on_failure {
                warn!("stopping merge plan after failure");
                break;
            }
            if i + 1 < pr_order.len() {
                // Let the provider settle before the next merge
                tokio::time::sleep(SETTLE_BETWEEN_MERGES).await;
            }
        }

        results
    }

    /// Report mergeability and CI state without merging anything.
    pub async fn dry_run(&self, pr_order: &[u64]) -> Vec<MergeReadiness> {
        let mut statuses = Vec::with_capacity(pr_order.len());
        for &pr_number in pr_order {
            let (mergeable, merge_reason) = self.check_mergeable(pr_number).await;
            let (ci_passed, ci_status) = match self.provider.get_pr(pr_number) {
                Ok(pr) => self.check_ci(&pr.head.sha),
                Err(e) => (false, format!("provider error: {e}")),
            };
            statuses.push(MergeReadiness {
                pr_number,
                mergeable,
                merge_reason,
                ci_passed,
                ci_status,
                ready: mergeable && ci_passed,
            });
        }
        statuses
    }
}
