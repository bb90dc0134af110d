use std::collections::HashMap;

use serde_json::json;
use tracing::{debug, info};

use crate::agent::{AgentRunner, SessionRequest, ToolSpec};
use crate::config::Config;
use crate::error::Result;
use crate::issue::PotentialIssue;
use crate::prompts::PromptEngine;

const SYSTEM_PROMPT: &str = "You are an expert code reviewer specialized in finding bugs, \
security vulnerabilities, and code quality issues. Be thorough and identify all \
potential problems - false positives will be filtered in the next stage.";

pub const STORE_ISSUE: &str = "store_issue";

pub fn store_issue_spec() -> ToolSpec {
    ToolSpec {
        name: STORE_ISSUE.to_string(),
        description: "Store a potential issue found in the code review".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" },
                "line_start": { "type": "integer" },
                "line_end": { "type": "integer" },
                "issue_type": {
                    "type": "string",
                    "enum": ["bug", "security", "performance", "logic_error",
                             "type_error", "unused_code", "best_practice"],
                },
                "severity": {
                    "type": "string",
                    "enum": ["critical", "high", "medium", "low"],
                },
                "description": { "type": "string" },
                "code_snippet": { "type": "string" },
            },
            "required": ["file_path", "line_start", "line_end", "issue_type",
                         "severity", "description", "code_snippet"],
        }),
    }
}

/// Stage 1: identify all potential issues in the formatted hunks.
///
/// Recall-biased: the prompt tells the agent false positives are fine.
/// Only the diff text is in scope; the session gets a reasoning tool but no
/// codebase access.
pub async fn identify_issues<R: AgentRunner>(
    runner: &R,
    prompts: &PromptEngine,
    config: &Config,
    hunks_text: &str,
) -> Result<Vec<PotentialIssue>> {
    let mut vars = HashMap::new();
    vars.insert("hunks".to_string(), hunks_text.to_string());
    let prompt = prompts.render_phase("identify", &vars)?;

    let mut req = SessionRequest::new(SYSTEM_PROMPT, prompt, &config.working_dir);
    req.collectors = vec![store_issue_spec()];
    req.max_turns = 30;
    req.extra_servers.insert(
        "thinking".to_string(),
        json!({
            "type": "stdio",
            "command": "npx",
            "args": ["-y", "@modelcontextprotocol/server-sequential-thinking"],
        }),
    );
    req.allowed_tools = vec!["mcp__thinking__sequentialthinking".to_string()];

    let output = runner.run(&req).await?;
    info!(
        duration_ms = output.duration.as_millis() as u64,
        is_error = output.is_error,
        "stage 1 session finished"
    );

    let mut issues = Vec::new();
    for payload in output.calls_to(STORE_ISSUE) {
        if let Some(issue) = PotentialIssue::from_payload(payload) {
            issues.push(issue);
        }
    }
    debug!(stored = issues.len(), "coerced stage 1 tool calls");
    Ok(issues)
}
