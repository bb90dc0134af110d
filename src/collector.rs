use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use crate::agent::ToolSpec;
use crate::error::{Error, Result};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// State of one collector server process: the tools it hosts and the sink
/// file where tool calls accumulate. One sink per agent session.
pub struct Collector {
    tools: Vec<ToolSpec>,
    sink: PathBuf,
    stored: usize,
}

impl Collector {
    pub fn new(tools: Vec<ToolSpec>, sink: PathBuf) -> Self {
        Self {
            tools,
            sink,
            stored: 0,
        }
    }

    pub fn load(spec_path: &Path, sink: PathBuf) -> Result<Self> {
        let spec = std::fs::read_to_string(spec_path)?;
        let tools: Vec<ToolSpec> = serde_json::from_str(&spec)
            .map_err(|e| Error::Agent(format!("invalid tool spec file: {e}")))?;
        Ok(Self::new(tools, sink))
    }

    /// Handle one JSON-RPC message; returns the serialized response, or
    /// `None` for notifications and unparseable input.
    pub fn handle_message(&mut self, line: &str) -> Option<String> {
        let msg: Value = serde_json::from_str(line).ok()?;
        let id = msg.get("id")?.clone();
        let method = msg.get("method").and_then(Value::as_str).unwrap_or("");

        let result = match method {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "mender-collector", "version": env!("CARGO_PKG_VERSION") },
            }),
            "tools/list" => {
                let tools: Vec<Value> = self
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": t.input_schema,
                        })
                    })
                    .collect();
                json!({ "tools": tools })
            }
            "tools/call" => match self.store_call(&msg) {
                Ok(text) => json!({ "content": [{ "type": "text", "text": text }] }),
                Err(e) => {
                    return Some(error_response(&id, -32000, &e.to_string()));
                }
            },
            "ping" => json!({}),
            _ => return Some(error_response(&id, -32601, &format!("unknown method: {method}"))),
        };

        Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string())
    }

    fn store_call(&mut self, msg: &Value) -> Result<String> {
        let params = msg
            .get("params")
            .ok_or_else(|| Error::Agent("tools/call without params".to_string()))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Agent("tools/call without tool name".to_string()))?;

        if !self.tools.iter().any(|t| t.name == name) {
            return Err(Error::Agent(format!("unknown tool: {name}")));
        }

        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        let record = json!({ "name": name, "arguments": arguments });

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.sink)?;
        writeln!(file, "{record}")?;

        self.stored += 1;
        Ok(format!("Stored successfully. Total: {}", self.stored))
    }
}

/// Serve the collector over stdio until stdin closes.
pub fn serve(spec_path: &Path, sink: &Path) -> Result<()> {
    let mut collector = Collector::load(spec_path, sink.to_path_buf())?;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if let Some(response) = collector.handle_message(&line) {
            writeln!(stdout, "{response}")?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn error_response(id: &Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_issue_spec() -> ToolSpec {
        ToolSpec {
            name: "store_issue".to_string(),
            description: "Store a potential issue".to_string(),
            input_schema: json!({"type": "object"}),
        }
    }

    fn collector(dir: &Path) -> Collector {
        Collector::new(vec![store_issue_spec()], dir.join("calls.jsonl"))
    }

    #[test]
    fn test_initialize_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = collector(dir.path());
        let resp = c
            .handle_message(r#"{"jsonrpc":"2.0","id":0,"method":"initialize","params":{}}"#)
            .unwrap();
        let v: Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(v["result"]["serverInfo"]["name"], "mender-collector");
    }

    #[test]
    fn test_notification_gets_no_response() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = collector(dir.path());
        assert!(
            c.handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .is_none()
        );
    }

    #[test]
    fn test_tools_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = collector(dir.path());
        let resp = c
            .handle_message(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#)
            .unwrap();
        let v: Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["result"]["tools"][0]["name"], "store_issue");
        assert!(v["result"]["tools"][0]["inputSchema"].is_object());
    }

    #[test]
    fn test_tools_call_appends_to_sink_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = collector(dir.path());

        let call = r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"store_issue","arguments":{"file_path":"a.py"}}}"#;
        let resp = c.handle_message(call).unwrap();
        let v: Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["result"]["content"][0]["text"], "Stored successfully. Total: 1");

        let resp = c.handle_message(call).unwrap();
        let v: Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["result"]["content"][0]["text"], "Stored successfully. Total: 2");

        let sink = std::fs::read_to_string(dir.path().join("calls.jsonl")).unwrap();
        let records: Vec<Value> = sink
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], "store_issue");
        assert_eq!(records[0]["arguments"]["file_path"], "a.py");
    }

    #[test]
    fn test_tools_call_unknown_tool_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = collector(dir.path());
        let resp = c
            .handle_message(
                r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"drop_tables"}}"#,
            )
            .unwrap();
        let v: Value = serde_json::from_str(&resp).unwrap();
        assert!(v["error"]["message"].as_str().unwrap().contains("unknown tool"));
        assert!(!dir.path().join("calls.jsonl").exists());
    }

    #[test]
    fn test_unknown_method_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = collector(dir.path());
        let resp = c
            .handle_message(r#"{"jsonrpc":"2.0","id":4,"method":"resources/list"}"#)
            .unwrap();
        let v: Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["error"]["code"], -32601);
    }

    #[test]
    fn test_garbage_input_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = collector(dir.path());
        assert!(c.handle_message("not json").is_none());
    }

    #[test]
    fn test_load_from_spec_file() {
        let dir = tempfile::tempdir().unwrap();
        let spec_path = dir.path().join("tools.json");
        std::fs::write(
            &spec_path,
            serde_json::to_string(&vec![store_issue_spec()]).unwrap(),
        )
        .unwrap();
        let c = Collector::load(&spec_path, dir.path().join("calls.jsonl")).unwrap();
        assert_eq!(c.tools.len(), 1);
    }
}
