use clap::{Args, Parser, Subcommand};

/// mender — automated PR review and repair
#[derive(Parser, Debug)]
#[command(name = "mender", version, about)]
pub struct Cli {
    /// Path to config file (default: .mender/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a single review pass over a PR and report validated issues
    Review(ReviewArgs),
    /// Run the review → fix → re-review feedback loop on a PR
    Loop(LoopArgs),
    /// Plan and execute reviews across all open PRs targeting a base branch
    Orchestrate(OrchestrateArgs),
    /// Internal MCP server that collects structured tool output
    #[command(hide = true)]
    Collector(CollectorArgs),
}

#[derive(Args, Debug)]
pub struct ReviewArgs {
    /// Repository in owner/repo form (or GITHUB_REPOSITORY env var)
    #[arg(long)]
    pub repo: Option<String>,

    /// Pull request number (or PR_NUMBER env var)
    #[arg(long)]
    pub pr: Option<u64>,

    /// Minimum confidence for an issue to be reported
    #[arg(long)]
    pub min_confidence: Option<f64>,

    /// Don't post inline comments
    #[arg(long)]
    pub no_comments: bool,

    /// Don't post the summary comment
    #[arg(long)]
    pub no_summary: bool,

    /// Include low severity issues in the report
    #[arg(long)]
    pub report_low: bool,

    /// Validate issues one at a time instead of in parallel
    #[arg(long)]
    pub sequential: bool,
}

#[derive(Args, Debug)]
pub struct LoopArgs {
    /// Repository in owner/repo form (or GITHUB_REPOSITORY env var)
    #[arg(long)]
    pub repo: Option<String>,

    /// Pull request number (or PR_NUMBER env var)
    #[arg(long)]
    pub pr: Option<u64>,

    /// Maximum review → fix iterations
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Report issues without attempting fixes
    #[arg(long)]
    pub no_fix: bool,

    /// Merge the PR once the loop exits clean
    #[arg(long)]
    pub auto_merge: bool,

    /// Run the test command after each fix round
    #[arg(long)]
    pub run_tests: bool,

    /// Test command to run (default: pytest)
    #[arg(long)]
    pub test_command: Option<String>,

    /// Revert fixes and stop when tests fail
    #[arg(long)]
    pub require_tests_pass: bool,

    /// Generate tests and apply the coverage gate before merging
    #[arg(long)]
    pub test_gate: bool,

    /// Working directory holding the PR checkout (default: current dir)
    #[arg(long)]
    pub working_dir: Option<String>,
}

#[derive(Args, Debug)]
pub struct OrchestrateArgs {
    /// Repository in owner/repo form (or GITHUB_REPOSITORY env var)
    #[arg(long)]
    pub repo: Option<String>,

    /// Base branch whose open PRs are orchestrated
    #[arg(long)]
    pub base: Option<String>,

    /// Merge PRs that pass review, in plan order
    #[arg(long)]
    pub merge: bool,

    /// Print the plan and merge readiness without reviewing or merging
    #[arg(long)]
    pub dry_run: bool,

    /// Maximum concurrent reviews within a parallel group
    #[arg(long)]
    pub max_parallel: Option<usize>,
}

#[derive(Args, Debug)]
pub struct CollectorArgs {
    /// Path to the serialized tool specs
    #[arg(long)]
    pub spec: String,

    /// Path to the JSONL sink receiving tool calls
    #[arg(long)]
    pub sink: String,
}
