use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::agent::{AgentRunner, PermissionMode, SessionRequest};
use crate::config::Config;
use crate::diff::{format_hunks, parse_diff};
use crate::error::Result;
use crate::gate::{CoverageGate, MergeRules};
use crate::git;
use crate::issue::{PotentialIssue, ValidatedIssue};
use crate::process::{ProcessConfig, spawn_and_stream};
use crate::prompts::PromptEngine;
use crate::provider::{InlineComment, Provider};
use crate::review::{self, filter_by_severity};
use crate::testgen;

const FIX_SYSTEM_PROMPT: &str =
    "You are a senior developer. Fix code issues with minimal changes.";
const TEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Terminal state of a feedback-loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopResult {
    Merged,
    ReadyToMerge,
    MaxIterations,
    Unfixable,
    TestFailed,
    Error,
}

/// Record of one loop iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationStatus {
    pub iteration: u32,
    pub issues_found: usize,
    pub issues_fixed: usize,
    pub issues_skipped: usize,
    pub tests_passed: Option<bool>,
    pub commit_sha: Option<String>,
    pub duration_secs: f64,
    pub error: Option<String>,
}

impl IterationStatus {
    fn new(iteration: u32) -> Self {
        Self {
            iteration,
            issues_found: 0,
            issues_fixed: 0,
            issues_skipped: 0,
            tests_passed: None,
            commit_sha: None,
            duration_secs: 0.0,
            error: None,
        }
    }
}

/// Stable identity of an issue across iterations.
///
/// Line numbers are deliberately excluded: fixes shift them. The description
/// prefix is capped and lowercased so cosmetic rewording doesn't defeat
/// duplicate detection.
pub fn fingerprint(issue: &PotentialIssue) -> String {
    let prefix: String = issue
        .description
        .to_lowercase()
        .chars()
        .take(100)
        .collect();
    format!("{}|{}|{}", issue.file_path, issue.kind, prefix)
}

/// Split validated issues into fresh fix candidates and skipped ones.
///
/// Issues already known unfixable are skipped silently; issues that were
/// attempted before and reappeared are promoted to unfixable (the earlier
/// fix did not eliminate them).
fn partition_issues(
    issues: Vec<ValidatedIssue>,
    attempted: &HashSet<String>,
    unfixable: &mut HashSet<String>,
    skip_repeated: bool,
) -> (Vec<ValidatedIssue>, usize) {
    let mut fresh = Vec::new();
    let mut skipped = 0;
    for issue in issues {
        let fp = fingerprint(&issue.issue);
        if unfixable.contains(&fp) {
            skipped += 1;
        } else if skip_repeated && attempted.contains(&fp) {
            info!(fingerprint = %fp, "issue reappeared after a fix; marking unfixable");
            unfixable.insert(fp);
            skipped += 1;
        } else {
            fresh.push(issue);
        }
    }
    (fresh, skipped)
}

enum IterationOutcome {
    Continue,
    Exit(LoopResult),
}

/// The convergent review → fix → commit → re-review state machine.
pub struct FeedbackLoop<P, R> {
    provider: Arc<P>,
    runner: Arc<R>,
    prompts: Arc<PromptEngine>,
    config: Config,
    attempted: HashSet<String>,
    unfixable: HashSet<String>,
}

impl<P, R> FeedbackLoop<P, R>
where
    P: Provider + Send + Sync + 'static,
    R: AgentRunner + Send + Sync + 'static,
{
    pub fn new(provider: Arc<P>, runner: Arc<R>, prompts: Arc<PromptEngine>, config: Config) -> Self {
        Self {
            provider,
            runner,
            prompts,
            config,
            attempted: HashSet::new(),
            unfixable: HashSet::new(),
        }
    }

    /// Run the loop to a terminal state, returning per-iteration records.
    pub async fn run(&mut self, pr_number: u64) -> (LoopResult, Vec<IterationStatus>) {
        info!(
            pr_number,
            repo = %self.config.repo,
            max_iterations = self.config.max_iterations,
            "starting feedback loop"
        );

        let mut statuses: Vec<IterationStatus> = Vec::new();
        let mut result = LoopResult::MaxIterations;

        for iteration in 1..=self.config.max_iterations {
            info!(iteration, max = self.config.max_iterations, "iteration start");
            let started = Instant::now();
            let mut status = IterationStatus::new(iteration);

            let outcome = self.run_iteration(pr_number, iteration, &mut status).await;
            status.duration_secs = started.elapsed().as_secs_f64();

            match outcome {
                Ok(IterationOutcome::Continue) => statuses.push(status),
                Ok(IterationOutcome::Exit(exit)) => {
                    statuses.push(status);
                    result = exit;
                    break;
                }
                Err(e) => {
                    error!(iteration, error = %e, "iteration failed");
                    status.error = Some(e.to_string());
                    statuses.push(status);
                    result = LoopResult::Error;
                    break;
                }
            }
        }

        if result == LoopResult::ReadyToMerge && self.config.auto_merge {
            result = self.merge_pr(pr_number).await;
        }

        log_summary(&statuses, result);
        (result, statuses)
    }

    async fn run_iteration(
        &mut self,
        pr_number: u64,
        iteration: u32,
        status: &mut IterationStatus,
    ) -> Result<IterationOutcome> {
        let workdir = self.config.working_dir.clone();

        // 1. Pull latest on the PR head branch. Review-only runs never
        // mutate the tree, so they skip the sync and stay parallel-safe.
        let pr = self.provider.get_pr(pr_number)?;
        if self.config.auto_fix {
            git::checkout(&workdir, &pr.head.branch)?;
            git::pull_rebase(&workdir)?;
        }

        // 2. Fetch the diff and the changed-file set
        let diff_text = self.provider.get_diff(pr_number)?;
        if diff_text.trim().is_empty() {
            info!("no changes in PR");
            return Ok(IterationOutcome::Exit(LoopResult::ReadyToMerge));
        }
        let changed: HashSet<String> =
            self.provider.changed_files(pr_number)?.into_iter().collect();

        // 3. Stage 1 over the diff, scoped to changed files and the severity floor
        let hunks_text = format_hunks(&parse_diff(&diff_text));
        let potential = review::identify::identify_issues(
            self.runner.as_ref(),
            &self.prompts,
            &self.config,
            &hunks_text,
        )
        .await?;
        let potential: Vec<PotentialIssue> =
            filter_by_severity(potential, self.config.min_severity_to_fix)
                .into_iter()
                .filter(|i| changed.contains(&i.file_path))
                .collect();
        info!(count = potential.len(), "stage 1 candidates");

        // 4. Stage 2, keep confident valid issues
        let validated = review::validate::validate_issues(
            &self.runner,
            &self.prompts,
            &workdir,
            potential,
            self.config.parallel_validation,
            self.config.max_parallel_validations,
        )
        .await;
        let valid: Vec<ValidatedIssue> = validated
            .into_iter()
            .filter(|i| i.is_valid && i.confidence >= self.config.min_confidence)
            .collect();
        info!(count = valid.len(), "validated issues");

        // 6. Clean PR: nothing valid remains
        if valid.is_empty() {
            info!("no valid issues remain - PR is clean");
            return Ok(IterationOutcome::Exit(LoopResult::ReadyToMerge));
        }

        // 5. Partition against the attempted/unfixable sets
        let (fresh, skipped) = partition_issues(
            valid,
            &self.attempted,
            &mut self.unfixable,
            self.config.skip_repeated_issues,
        );
        status.issues_found = fresh.len() + skipped;
        status.issues_skipped = skipped;

        // 7. Report-only mode
        if !self.config.auto_fix {
            info!("auto-fix disabled; posting review comments");
            self.post_comments(pr_number, &pr.head.sha, &fresh);
            return Ok(IterationOutcome::Exit(LoopResult::Unfixable));
        }

        if fresh.is_empty() {
            info!("every remaining issue is known unfixable");
            return Ok(IterationOutcome::Exit(LoopResult::Unfixable));
        }

        // 8. Fix each fresh issue; success means the file actually changed
        let mut fixed_files: Vec<String> = Vec::new();
        let mut fixed_fingerprints: Vec<String> = Vec::new();
        for issue in &fresh {
            if self.fix_issue(issue).await {
                status.issues_fixed += 1;
                let fp = fingerprint(&issue.issue);
                self.attempted.insert(fp.clone());
                fixed_fingerprints.push(fp);
                if !fixed_files.contains(&issue.issue.file_path) {
                    fixed_files.push(issue.issue.file_path.clone());
                }
            } else {
                self.unfixable.insert(fingerprint(&issue.issue));
            }
        }

        // 9. No fix produced a file change
        if fixed_files.is_empty() {
            warn!("no issue produced a file change; marking survivors unfixable");
            for issue in &fresh {
                self.unfixable.insert(fingerprint(&issue.issue));
            }
            return Ok(IterationOutcome::Exit(LoopResult::Unfixable));
        }

        // 10. Optional test gate on the fixes
        if self.config.run_tests {
            let passed = self.run_tests().await;
            status.tests_passed = Some(passed);
            if !passed && self.config.require_tests_pass {
                warn!("tests failed; reverting fixes");
                git::restore_tracked(&workdir)?;
                self.unfixable.extend(fixed_fingerprints);
                return Ok(IterationOutcome::Exit(LoopResult::TestFailed));
            }
        }

        // 11. Stage only the fixed files, commit, push
        git::add_paths(&workdir, &fixed_files)?;
        if git::status_porcelain(&workdir)?.is_empty() {
            info!("nothing to commit; treating iteration as no-op");
            return Ok(IterationOutcome::Continue);
        }
        let message = format!(
            "{}Auto-fix issues (iteration {iteration})",
            self.config.commit_message_prefix
        );
        git::commit(&workdir, &message)?;
        let sha = git::head_sha(&workdir)?;
        git::push(&workdir)?;
        info!(commit = %sha, files = fixed_files.len(), "pushed fixes");
        status.commit_sha = Some(sha);

        Ok(IterationOutcome::Continue)
    }

    /// Run one fix session and decide success by comparing file bytes
    /// before and after. The agent's self-report is not trusted.
    async fn fix_issue(&self, issue: &ValidatedIssue) -> bool {
        let path = self.config.working_dir.join(&issue.issue.file_path);
        let before = std::fs::read_to_string(&path).ok();

        let request = match self.build_fix_request(issue) {
            Ok(request) => request,
            Err(e) => {
                warn!(file = %issue.issue.file_path, error = %e, "failed to build fix prompt");
                return false;
            }
        };

        if let Err(e) = self.runner.run(&request).await {
            warn!(file = %issue.issue.file_path, error = %e, "fix session failed");
            return false;
        }

        let after = std::fs::read_to_string(&path).ok();
        let changed = before != after;
        if changed {
            info!(file = %issue.issue.file_path, "fix applied");
        } else {
            info!(file = %issue.issue.file_path, "fix session left file unchanged");
        }
        changed
    }

    fn build_fix_request(&self, issue: &ValidatedIssue) -> Result<SessionRequest> {
        let mut vars = std::collections::HashMap::new();
        vars.insert("file_path".to_string(), issue.issue.file_path.clone());
        vars.insert("line_start".to_string(), issue.issue.line_start.to_string());
        vars.insert("line_end".to_string(), issue.issue.line_end.to_string());
        vars.insert("issue_type".to_string(), issue.issue.kind.to_string());
        vars.insert("severity".to_string(), issue.issue.severity.to_string());
        vars.insert("description".to_string(), issue.issue.description.clone());
        vars.insert("code_snippet".to_string(), issue.issue.code_snippet.clone());
        vars.insert(
            "mitigation".to_string(),
            issue
                .mitigation
                .clone()
                .unwrap_or_else(|| "Use best practices to fix this issue.".to_string()),
        );
        let prompt = self.prompts.render_phase("fix", &vars)?;

        let mut req = SessionRequest::new(FIX_SYSTEM_PROMPT, prompt, &self.config.working_dir);
        req.allowed_tools = vec!["Edit".to_string(), "Read".to_string()];
        req.permission_mode = PermissionMode::AcceptEdits;
        req.max_turns = 10;
        Ok(req)
    }

    async fn run_tests(&self) -> bool {
        let mut parts = self.config.test_command.split_whitespace();
        let Some(command) = parts.next() else {
            return true;
        };
        let output = spawn_and_stream(ProcessConfig {
            command: command.to_string(),
            args: parts.map(str::to_string).collect(),
            working_dir: self.config.working_dir.clone(),
            timeout: Some(TEST_TIMEOUT),
            log_prefix: "tests".to_string(),
            env: vec![],
        })
        .await;
        match output {
            Ok(output) => output.success(),
            Err(e) => {
                warn!(error = %e, "test command failed to run");
                false
            }
        }
    }

    fn post_comments(&self, pr_number: u64, head_sha: &str, issues: &[ValidatedIssue]) {
        for issue in issues {
            let comment = InlineComment {
                path: issue.issue.file_path.clone(),
                line: issue.issue.line_end,
                body: review::format_issue_comment(issue),
                commit_sha: head_sha.to_string(),
            };
            if let Err(e) = self.provider.post_review_comment(pr_number, &comment) {
                warn!(file = %issue.issue.file_path, error = %e, "failed to post comment");
            }
        }
    }

    /// Merge the clean PR, gated by generated tests + coverage when enabled.
    async fn merge_pr(&self, pr_number: u64) -> LoopResult {
        if self.config.test_gate && !self.run_test_gate(pr_number).await {
            return LoopResult::ReadyToMerge;
        }

        let title = match self.provider.get_pr(pr_number) {
            Ok(pr) => pr.title,
            Err(e) => {
                warn!(error = %e, "failed to refresh PR before merge");
                return LoopResult::ReadyToMerge;
            }
        };
        let message = format!("Merge PR #{pr_number}: {title}");
        match self
            .provider
            .merge_pr(pr_number, self.config.merge_method, &message)
        {
            Ok(outcome) if outcome.merged => {
                info!(pr_number, sha = ?outcome.sha, "PR merged");
                LoopResult::Merged
            }
            Ok(_) => {
                warn!(pr_number, "provider declined the merge");
                LoopResult::ReadyToMerge
            }
            Err(e) => {
                warn!(pr_number, error = %e, "merge failed");
                LoopResult::ReadyToMerge
            }
        }
    }

    async fn run_test_gate(&self, pr_number: u64) -> bool {
        let (file_diffs, changed) = match (
            self.provider.get_diff(pr_number),
            self.provider.changed_files(pr_number),
        ) {
            (Ok(diff), Ok(changed)) => (parse_diff(&diff), changed),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "test gate could not fetch PR state");
                return false;
            }
        };

        let tests = match testgen::generate_tests(
            self.runner.as_ref(),
            &self.prompts,
            &self.config,
            &file_diffs,
            &[],
        )
        .await
        {
            Ok(tests) => tests,
            Err(e) => {
                warn!(error = %e, "test generation failed");
                Vec::new()
            }
        };

        let gate = CoverageGate::new(
            MergeRules {
                min_total_coverage: self.config.min_total_coverage,
                min_new_code_coverage: self.config.min_new_code_coverage,
                all_tests_must_pass: self.config.all_tests_must_pass,
                block_on_critical: self.config.block_on_critical,
                block_on_high: self.config.block_on_high,
                max_medium_issues: self.config.max_medium_issues,
            },
            &self.config.test_command,
            &self.config.test_dir,
            &self.config.working_dir,
        );
        let decision = gate.execute(&tests, &[], &changed).await;

        if let Err(e) = self
            .provider
            .post_issue_comment(pr_number, &decision.summary())
        {
            warn!(error = %e, "failed to post gate decision");
        }
        if !decision.approved {
            warn!(reason = %decision.reason, "coverage gate blocked the merge");
        }
        decision.approved
    }
}

fn log_summary(statuses: &[IterationStatus], result: LoopResult) {
    info!(?result, iterations = statuses.len(), "feedback loop complete");
    info!("iter  found  fixed  skipped  tests  commit");
    for s in statuses {
        info!(
            "{:<5} {:<6} {:<6} {:<8} {:<6} {}",
            s.iteration,
            s.issues_found,
            s.issues_fixed,
            s.issues_skipped,
            s.tests_passed.map_or("-".to_string(), |p| p.to_string()),
            s.commit_sha.as_deref().unwrap_or("-"),
        );
    }
}
