use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process::{ProcessConfig, spawn_and_stream};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Schema for a structured-output tool registered with a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Permission mode passed to the agent runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
}

impl PermissionMode {
    pub fn flag(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
        }
    }
}

/// One agent session: one prompt, one result set.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub system_prompt: String,
    pub prompt: String,
    /// store_* tools hosted by the in-crate collector server.
    pub collectors: Vec<ToolSpec>,
    /// Additional MCP server declarations (reasoning, codebase search, docs).
    pub extra_servers: serde_json::Map<String, Value>,
    /// Allowed tool names beyond the collectors (already fully qualified,
    /// e.g. `mcp__thinking__sequentialthinking`, or built-ins like `Edit`).
    pub allowed_tools: Vec<String>,
    pub permission_mode: PermissionMode,
    pub max_turns: u32,
    pub working_dir: PathBuf,
}

impl SessionRequest {
    pub fn new(system_prompt: &str, prompt: String, working_dir: &Path) -> Self {
        Self {
            system_prompt: system_prompt.to_string(),
            prompt,
            collectors: Vec::new(),
            extra_servers: serde_json::Map::new(),
            allowed_tools: Vec::new(),
            permission_mode: PermissionMode::Default,
            max_turns: 30,
            working_dir: working_dir.to_path_buf(),
        }
    }
}

/// A tool invocation collected during a session, in call order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Outcome of a completed session.
#[derive(Debug)]
pub struct SessionOutput {
    pub tool_calls: Vec<ToolCall>,
    pub duration: Duration,
    pub is_error: bool,
}

impl SessionOutput {
    /// Arguments of every call to the named tool, in call order.
    pub fn calls_to(&self, tool: &str) -> Vec<&Value> {
        self.tool_calls
            .iter()
            .filter(|c| c.name == tool)
            .map(|c| &c.arguments)
            .collect()
    }
}

pub trait AgentRunner {
    /// Run one agent session to completion and collect its tool calls.
    fn run(
        &self,
        req: &SessionRequest,
    ) -> impl std::future::Future<Output = Result<SessionOutput>> + Send;
}

/// Production runner — drives the claude CLI in stream-json mode.
pub struct ClaudeRunner {
    binary: String,
    model: Option<String>,
    timeout: Option<Duration>,
}

impl ClaudeRunner {
    pub fn new(binary: String, model: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            binary,
            model,
            timeout,
        }
    }

    /// Build the MCP server map: the collector (when any store tool is
    /// registered) plus the caller's extra servers.
    fn mcp_servers(&self, req: &SessionRequest, scratch: &Path) -> Result<Option<Value>> {
        let mut servers = req.extra_servers.clone();

        if !req.collectors.is_empty() {
            let spec_path = scratch.join("tools.json");
            let spec = serde_json::to_string(&req.collectors)
                .map_err(|e| Error::Agent(format!("failed to serialize tool specs: {e}")))?;
            std::fs::write(&spec_path, spec)?;

            let exe = std::env::current_exe()
                .map_err(|e| Error::Agent(format!("cannot locate own binary: {e}")))?;
            servers.insert(
                "collector".to_string(),
                json!({
                    "type": "stdio",
                    "command": exe.to_string_lossy(),
                    "args": [
                        "collector",
                        "--spec", spec_path.to_string_lossy(),
                        "--sink", scratch.join("calls.jsonl").to_string_lossy(),
                    ],
                }),
            );
        }

        if servers.is_empty() {
            return Ok(None);
        }
        Ok(Some(json!({ "mcpServers": Value::Object(servers) })))
    }

    pub fn build_args(&self, req: &SessionRequest, mcp_config: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--verbose".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--max-turns".to_string(),
            req.max_turns.to_string(),
            "--permission-mode".to_string(),
            req.permission_mode.flag().to_string(),
        ];

        if let Some(path) = mcp_config {
            args.push("--mcp-config".to_string());
            args.push(path.to_string_lossy().to_string());
        }

        let mut allowed: Vec<String> = req
            .collectors
            .iter()
            .map(|t| format!("mcp__collector__{}", t.name))
            .collect();
        allowed.extend(req.allowed_tools.iter().cloned());
        if !allowed.is_empty() {
            args.push("--allowed-tools".to_string());
            args.push(allowed.join(","));
        }

        if !req.system_prompt.is_empty() {
            args.push("--append-system-prompt".to_string());
            args.push(req.system_prompt.clone());
        }

        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.push("-p".to_string());
        args.push(req.prompt.clone());

        args
    }
}

impl AgentRunner for ClaudeRunner {
    async fn run(&self, req: &SessionRequest) -> Result<SessionOutput> {
        let scratch = session_scratch_dir()?;
        let sink = scratch.join("calls.jsonl");

        let mcp_config_path = match self.mcp_servers(req, &scratch)? {
            Some(config) => {
                let path = scratch.join("mcp.json");
                std::fs::write(&path, config.to_string())?;
                Some(path)
            }
            None => None,
        };

        let args = self.build_args(req, mcp_config_path.as_deref());
        let output = spawn_and_stream(ProcessConfig {
            command: self.binary.clone(),
            args,
            working_dir: req.working_dir.clone(),
            timeout: self.timeout,
            log_prefix: "agent".to_string(),
            env: vec![],
        })
        .await;

        let result = match output {
            Ok(output) => {
                if let Some(sig) = output.signal {
                    Err(Error::Agent(format!("agent killed by signal {sig}")))
                } else if output.timed_out {
                    Err(Error::Agent("agent session timed out".to_string()))
                } else if output.exit_code != 0 {
                    Err(Error::Agent(format!(
                        "agent exited with code {}",
                        output.exit_code
                    )))
                } else {
                    let (duration_ms, is_error) = parse_stream_result(&output.stdout_lines);
                    read_sink(&sink).map(|tool_calls| {
                        debug!(
                            calls = tool_calls.len(),
                            duration_ms, is_error, "agent session complete"
                        );
                        SessionOutput {
                            tool_calls,
                            duration: duration_ms
                                .map(Duration::from_millis)
                                .unwrap_or(output.duration),
                            is_error,
                        }
                    })
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = std::fs::remove_dir_all(&scratch) {
            warn!(error = %e, "failed to clean up session scratch dir");
        }

        result
    }
}

fn session_scratch_dir() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!(
        "mender-session-{}-{}",
        std::process::id(),
        SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Pull `duration_ms` and the error flag out of the terminal `result`
/// message of a stream-json transcript. Unparseable lines are skipped.
fn parse_stream_result(lines: &[String]) -> (Option<u64>, bool) {
    for line in lines.iter().rev() {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("type").and_then(Value::as_str) == Some("result") {
            let duration = value.get("duration_ms").and_then(Value::as_u64);
            let is_error = value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            return (duration, is_error);
        }
    }
    (None, false)
}

/// Read the collector sink back as the ordered list of tool calls.
/// A missing sink means the agent never called a store tool.
fn read_sink(path: &Path) -> Result<Vec<ToolCall>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let mut calls = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<ToolCall>(line) {
            Ok(call) => calls.push(call),
            Err(e) => warn!(error = %e, "skipping malformed sink record"),
        }
    }
    Ok(calls)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SessionRequest {
        SessionRequest::new("be careful", "review this".to_string(), Path::new("/tmp"))
    }

    #[test]
    fn test_build_args_defaults() {
        let runner = ClaudeRunner::new("claude".to_string(), None, None);
        let args = runner.build_args(&request(), None);
        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--max-turns".to_string()));
        assert!(args.contains(&"30".to_string()));
        assert!(args.contains(&"--permission-mode".to_string()));
        assert!(args.contains(&"default".to_string()));
        assert!(args.contains(&"review this".to_string()));
        assert!(!args.contains(&"--model".to_string()));
        assert!(!args.contains(&"--mcp-config".to_string()));
    }

    #[test]
    fn test_build_args_with_model_and_mcp() {
        let runner = ClaudeRunner::new("claude".to_string(), Some("opus".to_string()), None);
        let args = runner.build_args(&request(), Some(Path::new("/tmp/mcp.json")));
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"opus".to_string()));
        assert!(args.contains(&"--mcp-config".to_string()));
        assert!(args.contains(&"/tmp/mcp.json".to_string()));
    }

    #[test]
    fn test_build_args_qualifies_collector_tools() {
        let runner = ClaudeRunner::new("claude".to_string(), None, None);
        let mut req = request();
        req.collectors.push(ToolSpec {
            name: "store_issue".to_string(),
            description: "store".to_string(),
            input_schema: json!({"type": "object"}),
        });
        req.allowed_tools.push("mcp__thinking__sequentialthinking".to_string());
        let args = runner.build_args(&req, None);
        let allowed = args
            .iter()
            .position(|a| a == "--allowed-tools")
            .map(|i| args[i + 1].clone())
            .unwrap();
        assert_eq!(
            allowed,
            "mcp__collector__store_issue,mcp__thinking__sequentialthinking"
        );
    }

    #[test]
    fn test_build_args_accept_edits_mode() {
        let runner = ClaudeRunner::new("claude".to_string(), None, None);
        let mut req = request();
        req.permission_mode = PermissionMode::AcceptEdits;
        req.allowed_tools = vec!["Edit".to_string(), "Read".to_string()];
        let args = runner.build_args(&req, None);
        assert!(args.contains(&"acceptEdits".to_string()));
        assert!(args.iter().any(|a| a.contains("Edit,Read")));
    }

    #[test]
    fn test_parse_stream_result_finds_terminal_message() {
        let lines = vec![
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"looking"}]}}"#
                .to_string(),
            "not json at all".to_string(),
            r#"{"type":"result","subtype":"success","duration_ms":4200,"is_error":false}"#
                .to_string(),
        ];
        assert_eq!(parse_stream_result(&lines), (Some(4200), false));
    }

    #[test]
    fn test_parse_stream_result_error_flag() {
        let lines = vec![r#"{"type":"result","duration_ms":10,"is_error":true}"#.to_string()];
        assert_eq!(parse_stream_result(&lines), (Some(10), true));
    }

    #[test]
    fn test_parse_stream_result_absent() {
        let lines = vec!["plain output".to_string()];
        assert_eq!(parse_stream_result(&lines), (None, false));
    }

    #[test]
    fn test_read_sink_orders_and_skips_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("calls.jsonl");
        std::fs::write(
            &sink,
            concat!(
                r#"{"name":"store_issue","arguments":{"n":1}}"#,
                "\n",
                "garbage\n",
                r#"{"name":"store_issue","arguments":{"n":2}}"#,
                "\n",
            ),
        )
        .unwrap();
        let calls = read_sink(&sink).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments["n"], 1);
        assert_eq!(calls[1].arguments["n"], 2);
    }

    #[test]
    fn test_read_sink_missing_file_is_empty() {
        assert!(read_sink(Path::new("/nonexistent/sink.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_calls_to_filters_by_name() {
        let output = SessionOutput {
            tool_calls: vec![
                ToolCall {
                    name: "store_issue".to_string(),
                    arguments: json!({"a": 1}),
                },
                ToolCall {
                    name: "other".to_string(),
                    arguments: json!({}),
                },
            ],
            duration: Duration::from_secs(1),
            is_error: false,
        };
        assert_eq!(output.calls_to("store_issue").len(), 1);
        assert!(output.calls_to("missing").is_empty());
    }
}
