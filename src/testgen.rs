use std::collections::HashMap;

use serde_json::json;
use tracing::info;

use crate::agent::{AgentRunner, SessionRequest, ToolSpec};
use crate::config::Config;
use crate::diff::{FileDiff, changed_functions, format_hunks};
use crate::error::Result;
use crate::issue::{GeneratedTest, ValidatedIssue};
use crate::prompts::PromptEngine;

const SYSTEM_PROMPT: &str = "You are a test engineer. Write focused, deterministic tests \
that follow the conventions already present in the repository.";

pub const STORE_TEST: &str = "store_test";

pub fn store_test_spec() -> ToolSpec {
    ToolSpec {
        name: STORE_TEST.to_string(),
        description: "Store a generated test file".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" },
                "content": { "type": "string" },
                "covers_functions": { "type": "array", "items": { "type": "string" } },
                "test_count": { "type": "integer" },
            },
            "required": ["file_path", "content"],
        }),
    }
}

fn issues_digest(issues: &[ValidatedIssue]) -> String {
    if issues.is_empty() {
        return "No validated issues.".to_string();
    }
    issues
        .iter()
        .filter(|i| i.is_valid)
        .map(|i| {
            format!(
                "- [{}] {}:{} - {}",
                i.issue.severity.label(),
                i.issue.file_path,
                i.issue.line_start,
                i.issue.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Best-effort list of touched functions for the prompt. Never trusted for
/// correctness; it only steers the agent toward the right names.
fn functions_digest(file_diffs: &[FileDiff]) -> String {
    let functions = changed_functions(file_diffs);
    if functions.is_empty() {
        return "(none detected)".to_string();
    }
    functions
        .iter()
        .map(|f| format!("- {} ({})", f.function, f.file))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Generate tests for the PR's changes, one session, read access only.
pub async fn generate_tests<R: AgentRunner>(
    runner: &R,
    prompts: &PromptEngine,
    config: &Config,
    file_diffs: &[FileDiff],
    issues: &[ValidatedIssue],
) -> Result<Vec<GeneratedTest>> {
    let mut vars = HashMap::new();
    vars.insert("hunks".to_string(), format_hunks(file_diffs));
    vars.insert("functions".to_string(), functions_digest(file_diffs));
    vars.insert("issues".to_string(), issues_digest(issues));
    vars.insert("test_dir".to_string(), config.test_dir.clone());
    let prompt = prompts.render_phase("testgen", &vars)?;

    let mut req = SessionRequest::new(SYSTEM_PROMPT, prompt, &config.working_dir);
    req.collectors = vec![store_test_spec()];
    req.allowed_tools = vec!["Read".to_string(), "Glob".to_string(), "Grep".to_string()];
    req.max_turns = 30;

    let output = runner.run(&req).await?;

    let mut tests = Vec::new();
    for payload in output.calls_to(STORE_TEST) {
        if let Some(test) = GeneratedTest::from_payload(payload) {
            tests.push(test);
        }
    }
    info!(count = tests.len(), "generated test files");
    Ok(tests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::agent::{SessionOutput, ToolCall};
    use crate::cli::Cli;
    use crate::config::{ConfigFile, merge};
    use crate::issue::{IssueKind, PotentialIssue, Severity};
    use clap::Parser;

    struct MockRunner(Vec<ToolCall>);

    impl AgentRunner for MockRunner {
        async fn run(&self, _req: &SessionRequest) -> Result<SessionOutput> {
            Ok(SessionOutput {
                tool_calls: self.0.clone(),
                duration: Duration::ZERO,
                is_error: false,
            })
        }
    }

    fn test_config() -> Config {
        let cli = Cli::parse_from(["mender", "loop", "--repo", "o/r", "--pr", "1"]);
        merge(ConfigFile::default(), &cli).unwrap()
    }

    fn sample_diffs() -> Vec<FileDiff> {
        crate::diff::parse_diff(
            "diff --git a/src/cache.py b/src/cache.py\n\
             --- a/src/cache.py\n\
             +++ b/src/cache.py\n\
             @@ -1,1 +1,3 @@\n\
             +def cache_get(key):\n\
             +    return store[key]\n",
        )
    }

    #[tokio::test]
    async fn test_generate_collects_valid_records() {
        let runner = MockRunner(vec![
            ToolCall {
                name: STORE_TEST.to_string(),
                arguments: json!({
                    "file_path": "tests/test_cache.py",
                    "content": "def test_cache_hit():\n    assert True\n",
                    "covers_functions": ["cache_get"],
                }),
            },
            ToolCall {
                name: STORE_TEST.to_string(),
                arguments: json!({"file_path": "tests/empty.py", "content": ""}),
            },
        ]);
        let prompts = PromptEngine::new(None);
        let tests = generate_tests(&runner, &prompts, &test_config(), &sample_diffs(), &[])
            .await
            .unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].file_path, "tests/test_cache.py");
        assert_eq!(tests[0].test_count, 1);
    }

    #[test]
    fn test_functions_digest_lists_touched_functions() {
        let digest = functions_digest(&sample_diffs());
        assert!(digest.contains("cache_get"));
        assert_eq!(functions_digest(&[]), "(none detected)");
    }

    #[test]
    fn test_issues_digest_lists_valid_only() {
        let issue = ValidatedIssue {
            issue: PotentialIssue {
                file_path: "src/a.py".to_string(),
                line_start: 3,
                line_end: 3,
                kind: IssueKind::Bug,
                severity: Severity::High,
                description: "broken branch".to_string(),
                code_snippet: String::new(),
            },
            is_valid: true,
            confidence: 0.9,
            evidence: vec![],
            library_reference: None,
            mitigation: None,
        };
        let mut invalid = issue.clone();
        invalid.is_valid = false;
        let digest = issues_digest(&[issue, invalid]);
        assert_eq!(digest.lines().count(), 1);
        assert!(digest.contains("src/a.py:3"));
    }

    #[test]
    fn test_issues_digest_empty() {
        assert_eq!(issues_digest(&[]), "No validated issues.");
    }
}
