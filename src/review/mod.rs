pub mod identify;
pub mod validate;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::agent::AgentRunner;
use crate::config::Config;
use crate::diff::{format_hunks, parse_diff};
use crate::error::Result;
use crate::issue::{PotentialIssue, Severity, ValidatedIssue};
use crate::prompts::PromptEngine;
use crate::provider::{InlineComment, Provider};

/// Outcome of a single review pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    NoChanges,
    Clean,
    Completed,
}

/// Statistics from one review pass over a PR.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewStats {
    pub status: ReviewStatus,
    pub potential: usize,
    pub valid: usize,
    pub false_positives: usize,
    pub reported: usize,
    pub blocking: usize,
}

impl ReviewStats {
    fn empty(status: ReviewStatus) -> Self {
        Self {
            status,
            potential: 0,
            valid: 0,
            false_positives: 0,
            reported: 0,
            blocking: 0,
        }
    }

    /// A review passes when no validated critical or high issue remains.
    pub fn passed(&self) -> bool {
        self.blocking == 0
    }
}

/// Drop issues below the severity floor. Validation is expensive.
pub fn filter_by_severity(issues: Vec<PotentialIssue>, min: Severity) -> Vec<PotentialIssue> {
    issues.into_iter().filter(|i| i.severity >= min).collect()
}

/// Keep only issues worth reporting: valid, confident enough, and of an
/// enabled severity.
pub fn filter_reportable(
    issues: &[ValidatedIssue],
    min_confidence: f64,
    report_low: bool,
) -> Vec<ValidatedIssue> {
    issues
        .iter()
        .filter(|i| i.is_valid)
        .filter(|i| i.confidence >= min_confidence)
        .filter(|i| report_low || i.issue.severity > Severity::Low)
        .cloned()
        .collect()
}

fn count_blocking(issues: &[ValidatedIssue]) -> usize {
    issues
        .iter()
        .filter(|i| i.is_valid && i.issue.severity >= Severity::High)
        .count()
}

/// Render a validated issue as an inline review comment body.
pub fn format_issue_comment(issue: &ValidatedIssue) -> String {
    let mut parts = vec![
        format!(
            "**{}**: {}\n\n{}\n",
            issue.issue.severity.label().to_uppercase(),
            issue.issue.kind,
            issue.issue.description
        ),
    ];

    if !issue.evidence.is_empty() {
        parts.push("\n**Evidence:**\n".to_string());
        for ev in issue.evidence.iter().take(3) {
            parts.push(format!("- {ev}\n"));
        }
    }
    if let Some(ref mitigation) = issue.mitigation {
        parts.push(format!("\n**Suggested Fix:**\n{mitigation}\n"));
    }
    if let Some(ref reference) = issue.library_reference {
        parts.push(format!("\n**Reference:** {reference}\n"));
    }
    parts.push(format!("\n*Confidence: {}%*", (issue.confidence * 100.0) as u32));

    parts.concat()
}

/// Render the PR-level summary comment, grouping valid issues by severity.
pub fn render_summary(issues: &[ValidatedIssue], stats: &ReviewStats) -> String {
    let valid: Vec<&ValidatedIssue> = issues.iter().filter(|i| i.is_valid).collect();

    let mut body = vec!["## AI Code Review Summary\n".to_string()];

    if valid.is_empty() {
        body.push("No significant issues found. The code looks good.\n".to_string());
    } else {
        body.push(format!("Found **{}** issues:\n", valid.len()));
        for severity in [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ] {
            let group: Vec<&&ValidatedIssue> =
                valid.iter().filter(|i| i.issue.severity == severity).collect();
            if group.is_empty() {
                continue;
            }
            body.push(format!(
                "\n### {} ({})\n",
                severity.label().to_uppercase(),
                group.len()
            ));
            for issue in group {
                let mut description: String =
                    issue.issue.description.chars().take(100).collect();
                if description.len() < issue.issue.description.len() {
                    description.push_str("...");
                }
                body.push(format!(
                    "- **{}:{}** - {}",
                    issue.issue.file_path, issue.issue.line_start, description
                ));
            }
        }
    }

    body.push("\n---".to_string());
    body.push("### Stats".to_string());
    body.push(format!("- Potential issues found: {}", stats.potential));
    body.push(format!("- Validated as real: {}", stats.valid));
    body.push(format!(
        "- False positives filtered: {}",
        stats.false_positives
    ));
    body.push("\n*Reviewed by mender*".to_string());

    body.join("\n")
}

/// Run the complete single-pass review pipeline on one PR.
pub async fn run_review<P, R>(
    provider: &P,
    runner: &Arc<R>,
    prompts: &Arc<PromptEngine>,
    config: &Config,
    pr_number: u64,
) -> Result<ReviewStats>
where
    P: Provider,
    R: AgentRunner + Send + Sync + 'static,
{
    info!(pr_number, repo = %config.repo, "starting review");

    let diff_text = provider.get_diff(pr_number)?;
    if diff_text.trim().is_empty() {
        info!(pr_number, "no changes found in PR");
        return Ok(ReviewStats::empty(ReviewStatus::NoChanges));
    }

    let file_diffs = parse_diff(&diff_text);
    let hunks_text = format_hunks(&file_diffs);
    info!(files = file_diffs.len(), "analyzing changed files");

    let potential = identify::identify_issues(runner.as_ref(), prompts, config, &hunks_text).await?;
    info!(count = potential.len(), "stage 1 complete");

    let potential = filter_by_severity(potential, config.min_severity);
    if potential.is_empty() {
        info!(pr_number, "no potential issues found");
        let stats = ReviewStats::empty(ReviewStatus::Clean);
        if config.post_summary {
            post_summary(provider, pr_number, &[], &stats);
        }
        return Ok(stats);
    }

    let validated = validate::validate_issues(
        runner,
        prompts,
        &config.working_dir,
        potential.clone(),
        config.parallel_validation,
        config.max_parallel_validations,
    )
    .await;

    let reportable = filter_reportable(&validated, config.min_confidence, config.report_low);
    let valid_count = validated.iter().filter(|i| i.is_valid).count();

    let stats = ReviewStats {
        status: ReviewStatus::Completed,
        potential: potential.len(),
        valid: valid_count,
        false_positives: potential.len() - valid_count,
        reported: reportable.len(),
        blocking: count_blocking(&validated),
    };
    info!(
        valid = stats.valid,
        false_positives = stats.false_positives,
        reported = stats.reported,
        "stage 2 complete"
    );

    if config.post_comments && !reportable.is_empty() {
        let head_sha = provider.get_pr(pr_number)?.head.sha;
        for issue in &reportable {
            let comment = InlineComment {
                path: issue.issue.file_path.clone(),
                line: issue.issue.line_end,
                body: format_issue_comment(issue),
                commit_sha: head_sha.clone(),
            };
            if let Err(e) = provider.post_review_comment(pr_number, &comment) {
                warn!(
                    file = %issue.issue.file_path,
                    line = issue.issue.line_start,
                    error = %e,
                    "failed to post inline comment"
                );
            }
        }
    }

    if config.post_summary {
        post_summary(provider, pr_number, &validated, &stats);
    }

    Ok(stats)
}

fn post_summary<P: Provider>(
    provider: &P,
    pr_number: u64,
    validated: &[ValidatedIssue],
    stats: &ReviewStats,
) {
    let body = render_summary(validated, stats);
    if let Err(e) = provider.post_issue_comment(pr_number, &body) {
        warn!(pr_number, error = %e, "failed to post summary comment");
    }
}
