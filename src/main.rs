use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use mender::agent::ClaudeRunner;
use mender::cli::{Cli, Command};
use mender::collector;
use mender::config::Config;
use mender::error::{Error, Result};
use mender::feedback::{FeedbackLoop, LoopResult};
use mender::orchestrator::Orchestrator;
use mender::prompts::PromptEngine;
use mender::provider::GitHubProvider;
use mender::review;

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn resolve_pr(arg: Option<u64>) -> Result<u64> {
    arg.or_else(|| {
        std::env::var("PR_NUMBER")
            .ok()
            .and_then(|s| s.parse().ok())
    })
    .ok_or_else(|| {
        Error::ConfigValidation("PR number required (use --pr or set PR_NUMBER)".to_string())
    })
}

struct Engine {
    provider: Arc<GitHubProvider>,
    runner: Arc<ClaudeRunner>,
    prompts: Arc<PromptEngine>,
}

fn build_engine(config: &Config) -> Result<Engine> {
    let repo = config.require_repo()?.to_string();
    let token = config.require_token()?.to_string();
    Ok(Engine {
        provider: Arc::new(GitHubProvider::new(&repo, &token)),
        runner: Arc::new(ClaudeRunner::new(
            config.agent_binary.clone(),
            config.agent_model.clone(),
            config.agent_timeout.map(Duration::from_secs),
        )),
        prompts: Arc::new(PromptEngine::new(config.prompt_dir.clone())),
    })
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    match &cli.command {
        Command::Review(args) => {
            let pr = resolve_pr(args.pr)?;
            let engine = build_engine(&config)?;
            let stats = review::run_review(
                engine.provider.as_ref(),
                &engine.runner,
                &engine.prompts,
                &config,
                pr,
            )
            .await?;
            info!(
                status = ?stats.status,
                potential = stats.potential,
                valid = stats.valid,
                false_positives = stats.false_positives,
                reported = stats.reported,
                "review complete"
            );
        }
        Command::Loop(args) => {
            let pr = resolve_pr(args.pr)?;
            let engine = build_engine(&config)?;
            let mut feedback = FeedbackLoop::new(
                engine.provider,
                engine.runner,
                engine.prompts,
                config.clone(),
            );
            let (result, statuses) = feedback.run(pr).await;
            info!(?result, iterations = statuses.len(), "feedback loop finished");
            if result == LoopResult::Error {
                return Err(Error::Orchestrator("feedback loop errored".to_string()));
            }
        }
        Command::Orchestrate(args) => {
            let engine = build_engine(&config)?;
            let mut orchestrator = Orchestrator::new(
                engine.provider,
                engine.runner,
                engine.prompts,
                config.clone(),
            );
            if args.dry_run {
                let (plan, readiness) = orchestrator.dry_run().await?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "plan": plan,
                        "merge_readiness": readiness,
                    }))
                    .map_err(|e| Error::Orchestrator(e.to_string()))?
                );
            } else {
                orchestrator.load_open_prs()?;
                let plan = orchestrator.analyze();
                let summary = orchestrator.execute_plan(&plan, args.merge).await;
                info!(
                    total = summary.total_prs,
                    reviewed = summary.reviewed,
                    passed = summary.passed,
                    failed = summary.failed,
                    merged = summary.merged,
                    "orchestration complete"
                );
            }
        }
        Command::Collector(_) => unreachable!("handled before logging init"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The collector speaks MCP on stdout; nothing else may write there.
    if let Command::Collector(args) = &cli.command {
        if let Err(e) = collector::serve(Path::new(&args.spec), Path::new(&args.sink)) {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
        return;
    }

    init_logging();
    info!("mender starting");

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli, config).await {
        error!("{e}");
        std::process::exit(1);
    }
}
