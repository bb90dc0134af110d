use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::agent::{AgentRunner, SessionRequest, ToolSpec};
use crate::error::Result;
use crate::issue::{PotentialIssue, ValidatedIssue};
use crate::prompts::PromptEngine;

const SYSTEM_PROMPT: &str = "You are a senior code reviewer validating potential issues. \
Your goal is to determine if an issue is real or a false positive by gathering \
evidence from the codebase and documentation. Be thorough but objective.";

pub const STORE_VERDICT: &str = "store_verdict";

pub fn store_verdict_spec() -> ToolSpec {
    ToolSpec {
        name: STORE_VERDICT.to_string(),
        description: "Store the validation verdict for an issue".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "is_valid": { "type": "boolean" },
                "evidence": { "type": "array", "items": { "type": "string" } },
                "library_reference": { "type": "string" },
                "mitigation": { "type": "string" },
                "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            },
            "required": ["is_valid", "evidence", "confidence"],
        }),
    }
}

fn build_request(
    prompts: &PromptEngine,
    issue: &PotentialIssue,
    working_dir: &Path,
) -> Result<SessionRequest> {
    let mut vars = HashMap::new();
    vars.insert("file_path".to_string(), issue.file_path.clone());
    vars.insert("line_start".to_string(), issue.line_start.to_string());
    vars.insert("line_end".to_string(), issue.line_end.to_string());
    vars.insert("issue_type".to_string(), issue.kind.to_string());
    vars.insert("severity".to_string(), issue.severity.to_string());
    vars.insert("description".to_string(), issue.description.clone());
    vars.insert("code_snippet".to_string(), issue.code_snippet.clone());
    let prompt = prompts.render_phase("validate", &vars)?;

    let mut req = SessionRequest::new(SYSTEM_PROMPT, prompt, working_dir);
    req.collectors = vec![store_verdict_spec()];
    req.max_turns = 20;
    // Codebase-search and library-docs servers. Either may be unavailable;
    // that only degrades precision.
    req.extra_servers.insert(
        "search".to_string(),
        json!({
            "type": "stdio",
            "command": "uvx",
            "args": ["--from", "git+https://github.com/oraios/serena",
                     "serena", "start-mcp-server", "--context", "ide-assistant"],
        }),
    );
    req.extra_servers.insert(
        "docs".to_string(),
        json!({ "type": "sse", "url": "https://mcp.context7.com/mcp" }),
    );
    req.allowed_tools = vec![
        "mcp__search__search_codebase".to_string(),
        "mcp__search__find_references".to_string(),
        "mcp__search__get_symbol_info".to_string(),
        "mcp__docs__resolve-library-id".to_string(),
        "mcp__docs__get-library-docs".to_string(),
    ];
    Ok(req)
}

/// Stage 2: validate one potential issue with a dedicated session.
///
/// A session that stores no verdict yields an inconclusive result rather
/// than an error.
pub async fn validate_issue<R: AgentRunner>(
    runner: &R,
    prompts: &PromptEngine,
    working_dir: &Path,
    issue: PotentialIssue,
) -> Result<ValidatedIssue> {
    info!(
        file = %issue.file_path,
        line = issue.line_start,
        severity = %issue.severity,
        "validating issue"
    );

    let req = build_request(prompts, &issue, working_dir)?;
    let output = runner.run(&req).await?;

    let verdict = match output.calls_to(STORE_VERDICT).first() {
        Some(payload) => ValidatedIssue::from_payload(issue, payload),
        None => ValidatedIssue::inconclusive(issue),
    };
    info!(
        valid = verdict.is_valid,
        confidence = verdict.confidence,
        "verdict stored"
    );
    Ok(verdict)
}

/// Stage 2 batch: validate all issues, preserving input order in the output.
///
/// In parallel mode at most `max_parallel` sessions run concurrently. A
/// failed session never fails the batch; it contributes a failed verdict.
pub async fn validate_issues<R>(
    runner: &Arc<R>,
    prompts: &Arc<PromptEngine>,
    working_dir: &Path,
    issues: Vec<PotentialIssue>,
    parallel: bool,
    max_parallel: usize,
) -> Vec<ValidatedIssue>
where
    R: AgentRunner + Send + Sync + 'static,
{
    if issues.is_empty() {
        return Vec::new();
    }

    info!(
        count = issues.len(),
        mode = if parallel { "parallel" } else { "sequential" },
        "stage 2: validating issues"
    );

    if !parallel {
        let mut validated = Vec::with_capacity(issues.len());
        for issue in issues {
            validated.push(run_one(runner.as_ref(), prompts, working_dir, issue).await);
        }
        return validated;
    }

    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let working_dir: PathBuf = working_dir.to_path_buf();

    let handles: Vec<_> = issues
        .iter()
        .cloned()
        .map(|issue| {
            let runner = Arc::clone(runner);
            let prompts = Arc::clone(prompts);
            let semaphore = Arc::clone(&semaphore);
            let working_dir = working_dir.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                run_one(runner.as_ref(), &prompts, &working_dir, issue).await
            })
        })
        .collect();

    // Awaiting handles in spawn order keeps the result list in input order.
    // A panicked task still contributes a verdict for its slot.
    let mut validated = Vec::with_capacity(handles.len());
    for (handle, issue) in handles.into_iter().zip(issues) {
        match handle.await {
            Ok(result) => validated.push(result),
            Err(e) => {
                warn!(file = %issue.file_path, error = %e, "validation task panicked");
                validated.push(ValidatedIssue::failed(issue, &e.to_string()));
            }
        }
    }
    validated
}

async fn run_one<R: AgentRunner>(
    runner: &R,
    prompts: &PromptEngine,
    working_dir: &Path,
    issue: PotentialIssue,
) -> ValidatedIssue {
    match validate_issue(runner, prompts, working_dir, issue.clone()).await {
        Ok(verdict) => verdict,
        Err(e) => {
            warn!(file = %issue.file_path, error = %e, "validation session failed");
            ValidatedIssue::failed(issue, &e.to_string())
        }
    }
}
