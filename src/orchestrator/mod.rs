pub mod conflict;
pub mod dependency;
pub mod merge;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::agent::AgentRunner;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::feedback::{FeedbackLoop, LoopResult};
use crate::prompts::PromptEngine;
use crate::provider::Provider;

use conflict::ConflictPredictor;
use dependency::DependencyAnalyzer;
use merge::{MergeExecutor, MergeReadiness, MergeResult};

/// Status of a PR in the orchestration queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    Pending,
    Reviewing,
    ReviewPassed,
    ReviewFailed,
    Merging,
    Merged,
    Failed,
    Conflict,
    Blocked,
}

impl PrStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PrStatus::Merged | PrStatus::Failed)
    }
}

/// A PR in the orchestration graph.
#[derive(Debug, Clone)]
pub struct PRNode {
    pub number: u64,
    pub branch: String,
    pub base: String,
    pub status: PrStatus,
    pub changed_files: Vec<String>,
    pub depends_on: Vec<u64>,
    pub conflicts_with: Vec<u64>,
    pub review_result: Option<LoopResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PRNode {
    /// Transitions out of terminal states are rejected.
    pub fn set_status(&mut self, status: PrStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::Orchestrator(format!(
                "PR #{} is {:?}; cannot transition to {:?}",
                self.number, self.status, status
            )));
        }
        self.status = status;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_ready_for_merge(&self) -> bool {
        self.status == PrStatus::ReviewPassed
    }
}

/// Plan for reviewing and merging a set of PRs.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationPlan {
    pub pr_order: Vec<u64>,
    pub parallel_groups: Vec<Vec<u64>>,
    pub conflict_pairs: Vec<(u64, u64)>,
}

impl OrchestrationPlan {
    pub fn total_prs(&self) -> usize {
        self.pr_order.len()
    }
}

/// Outcome counters for one plan execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionSummary {
    pub reviews: BTreeMap<u64, LoopResult>,
    pub merges: Vec<MergeResult>,
    pub total_prs: usize,
    pub reviewed: usize,
    pub passed: usize,
    pub failed: usize,
    pub merged: usize,
}

/// Parse explicit PR dependencies out of a PR body.
///
/// Recognized (case-insensitive): `blocked by #N`, `depends on #N`,
/// `blockedBy: [N, M]`.
pub fn parse_depends_on(body: &str) -> Vec<u64> {
    let mut deps = Vec::new();

    let inline_re = Regex::new(r"(?i)(?:blocked\s+by|depends\s+on)\s+#(\d+)").unwrap();
    for cap in inline_re.captures_iter(body) {
        if let Ok(n) = cap[1].parse::<u64>() {
            deps.push(n);
        }
    }

    let list_re = Regex::new(r"(?i)blockedBy:\s*\[([^\]]+)\]").unwrap();
    for cap in list_re.captures_iter(body) {
        for num in cap[1].split(',') {
            if let Ok(n) = num.trim().parse::<u64>() {
                deps.push(n);
            }
        }
    }

    deps.sort_unstable();
    deps.dedup();
    deps
}

/// Multi-PR orchestrator: queue, plan, parallel review, sequential merge.
pub struct Orchestrator<P, R> {
    provider: Arc<P>,
    runner: Arc<R>,
    prompts: Arc<PromptEngine>,
    config: Config,
    queue: HashMap<u64, PRNode>,
    merged: HashSet<u64>,
    analyzer: DependencyAnalyzer,
}

impl<P, R> Orchestrator<P, R>
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
            queue: HashMap::new(),
            merged: HashSet::new(),
            analyzer: DependencyAnalyzer::new(),
        }
    }

    /// Load all open PRs targeting the configured base branch.
    pub fn load_open_prs(&mut self) -> Result<usize> {
        self.queue.clear();

        let prs = self.provider.list_open_prs(&self.config.base_branch)?;
        for pr in prs {
            let changed_files = self.provider.changed_files(pr.number)?;
            let depends_on = parse_depends_on(pr.body.as_deref().unwrap_or(""));
            self.queue.insert(
                pr.number,
                PRNode {
                    number: pr.number,
                    branch: pr.head.branch,
                    base: pr.base.branch,
                    status: PrStatus::Pending,
                    changed_files,
                    depends_on,
                    conflicts_with: Vec::new(),
                    review_result: None,
                    created_at: pr.created_at,
                    updated_at: pr.updated_at,
                },
            );
        }

        info!(
            count = self.queue.len(),
            base = %self.config.base_branch,
            "loaded open PRs"
        );
        Ok(self.queue.len())
    }

    pub fn get_pr(&self, number: u64) -> Option<&PRNode> {
        self.queue.get(&number)
    }

    /// Analyze the queue and produce the orchestration plan.
    pub fn analyze(&mut self) -> OrchestrationPlan {
        if self.queue.is_empty() {
            return OrchestrationPlan {
                pr_order: vec![],
                parallel_groups: vec![],
                conflict_pairs: vec![],
            };
        }

        let prs: Vec<PRNode> = self.queue.values().cloned().collect();

        let dep_order = match self.analyzer.topological_sort(&prs) {
            Ok(order) => order,
            Err(e) => {
                // Cycle: fall back to creation-time order
                error!(error = %e, "dependency analysis failed; using creation order");
                let mut order: Vec<&PRNode> = prs.iter().collect();
                order.sort_by_key(|pr| pr.created_at);
                order.iter().map(|pr| pr.number).collect()
            }
        };

        let mut predictor = ConflictPredictor::new();
        let pairs = predictor.conflict_pairs(&prs);
        for (a, b, _) in &pairs {
            if let Some(node) = self.queue.get_mut(a) {
                node.conflicts_with.push(*b);
            }
            if let Some(node) = self.queue.get_mut(b) {
                node.conflicts_with.push(*a);
            }
        }

        let final_order = predictor.conflict_aware_order(&prs, &dep_order);

        let parallel_groups = self.analyzer.parallel_groups(&prs).unwrap_or_else(|e| {
            warn!(error = %e, "parallel grouping failed; reviewing sequentially");
            final_order.iter().map(|&n| vec![n]).collect()
        });

        let plan = OrchestrationPlan {
            pr_order: final_order,
            parallel_groups,
            conflict_pairs: pairs.iter().map(|(a, b, _)| (*a, *b)).collect(),
        };
        info!(
            prs = plan.total_prs(),
            groups = plan.parallel_groups.len(),
            conflicts = plan.conflict_pairs.len(),
            "analysis complete"
        );
        plan
    }

    /// Review every PR in one parallel group, bounded by the concurrency cap.
    ///
    /// Fix sessions mutate the shared checkout, so reviews are serialized
    /// whenever auto-fix is enabled.
    pub async fn review_parallel_group(&mut self, group: &[u64]) -> Vec<(u64, LoopResult)> {
        let permits = if self.config.auto_fix && self.config.max_parallel_reviews > 1 {
            warn!("auto_fix shares one checkout; serializing reviews in this group");
            1
        } else {
            self.config.max_parallel_reviews
        };
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut handles = Vec::with_capacity(group.len());
        for &pr_number in group {
            if let Some(node) = self.queue.get_mut(&pr_number)
                && node.set_status(PrStatus::Reviewing).is_err()
            {
                continue;
            }

            let provider = Arc::clone(&self.provider);
            let runner = Arc::clone(&self.runner);
            let prompts = Arc::clone(&self.prompts);
            let semaphore = Arc::clone(&semaphore);
            let mut loop_config = self.config.clone();
            // The merge executor owns merging; loops must not race it.
            loop_config.auto_merge = false;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let mut feedback = FeedbackLoop::new(provider, runner, prompts, loop_config);
                let (result, _statuses) = feedback.run(pr_number).await;
                (pr_number, result)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((pr_number, result)) => {
                    let passed = matches!(result, LoopResult::ReadyToMerge | LoopResult::Merged);
                    if let Some(node) = self.queue.get_mut(&pr_number) {
                        node.review_result = Some(result);
                        let status = if passed {
                            PrStatus::ReviewPassed
                        } else {
                            PrStatus::ReviewFailed
                        };
                        if let Err(e) = node.set_status(status) {
                            warn!(pr_number, error = %e, "status update rejected");
                        }
                    }
                    results.push((pr_number, result));
                }
                Err(e) => error!(error = %e, "review task panicked"),
            }
        }
        results
    }

    /// Execute the plan: review groups in order, then (optionally) merge the
    /// passing PRs sequentially in plan order.
    pub async fn execute_plan(&mut self, plan: &OrchestrationPlan, merge: bool) -> ExecutionSummary {
        let mut summary = ExecutionSummary {
            total_prs: plan.total_prs(),
            ..Default::default()
        };

        for group in &plan.parallel_groups {
            info!(?group, "reviewing parallel group");
            for (pr_number, result) in self.review_parallel_group(group).await {
                summary.reviewed += 1;
                if matches!(result, LoopResult::ReadyToMerge | LoopResult::Merged) {
                    summary.passed += 1;
                } else {
                    summary.failed += 1;
                }
                summary.reviews.insert(pr_number, result);
            }
        }

        if merge {
            let ready: Vec<u64> = plan
                .pr_order
                .iter()
                .filter(|n| {
                    self.queue
                        .get(*n)
                        .is_some_and(|node| node.is_ready_for_merge())
                })
                .copied()
                .collect();
            info!(count = ready.len(), "merging review-passed PRs");

            for &pr_number in &ready {
                if let Some(node) = self.queue.get_mut(&pr_number) {
                    let _ = node.set_status(PrStatus::Merging);
                }
            }

            let executor = MergeExecutor::new(Arc::clone(&self.provider), &self.config);
            let results = executor.execute_merge_plan(&ready, true).await;
            for result in &results {
                if let Some(node) = self.queue.get_mut(&result.pr_number) {
                    let status = if result.success {
                        PrStatus::Merged
                    } else {
                        PrStatus::Failed
                    };
                    let _ = node.set_status(status);
                }
                if result.success {
                    self.merged.insert(result.pr_number);
                    summary.merged += 1;
                }
            }
            summary.merges = results;
            self.update_blocked_states();
        }

        summary
    }

    /// Report the plan and merge readiness without reviewing or merging.
    pub async fn dry_run(&mut self) -> Result<(OrchestrationPlan, Vec<MergeReadiness>)> {
        if self.queue.is_empty() {
            self.load_open_prs()?;
        }
        let plan = self.analyze();
        let executor = MergeExecutor::new(Arc::clone(&self.provider), &self.config);
        let readiness = executor.dry_run(&plan.pr_order).await;
        Ok((plan, readiness))
    }

    /// Mark pending PRs blocked by unmerged dependencies, or conflicted when
    /// a PR sharing their files has already merged.
    fn update_blocked_states(&mut self) {
        let blocked: Vec<u64> = self
            .queue
            .values()
            .filter(|node| node.status == PrStatus::Pending)
            .filter(|node| self.analyzer.is_blocked(node.number, &self.merged))
            .map(|node| node.number)
            .collect();
        let conflicted: Vec<u64> = self
            .queue
            .values()
            .filter(|node| node.status == PrStatus::Pending)
            .filter(|node| node.conflicts_with.iter().any(|c| self.merged.contains(c)))
            .map(|node| node.number)
            .collect();

        for number in blocked {
            if let Some(node) = self.queue.get_mut(&number) {
                let _ = node.set_status(PrStatus::Blocked);
            }
        }
        for number in conflicted {
            if let Some(node) = self.queue.get_mut(&number) {
                if node.status == PrStatus::Pending || node.status == PrStatus::Blocked {
                    let _ = node.set_status(PrStatus::Conflict);
                }
            }
        }
    }

    /// Current status of every queued PR, keyed by number.
    pub fn queue_status(&self) -> BTreeMap<u64, PrStatus> {
        self.queue.iter().map(|(&n, node)| (n, node.status)).collect()
    }
}
