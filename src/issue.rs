use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Issue severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Discriminator tag for an issue. Informational; never drives control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Bug,
    Security,
    Performance,
    LogicError,
    TypeError,
    UnusedCode,
    BestPractice,
}

impl IssueKind {
    pub fn label(&self) -> &'static str {
        match self {
            IssueKind::Bug => "bug",
            IssueKind::Security => "security",
            IssueKind::Performance => "performance",
            IssueKind::LogicError => "logic_error",
            IssueKind::TypeError => "type_error",
            IssueKind::UnusedCode => "unused_code",
            IssueKind::BestPractice => "best_practice",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for IssueKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bug" => Ok(IssueKind::Bug),
            "security" => Ok(IssueKind::Security),
            "performance" => Ok(IssueKind::Performance),
            "logic_error" => Ok(IssueKind::LogicError),
            "type_error" => Ok(IssueKind::TypeError),
            "unused_code" => Ok(IssueKind::UnusedCode),
            "best_practice" => Ok(IssueKind::BestPractice),
            other => Err(format!("unknown issue kind: {other}")),
        }
    }
}

/// Stage-1 output: a potential issue found in the diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PotentialIssue {
    pub file_path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub kind: IssueKind,
    pub severity: Severity,
    pub description: String,
    pub code_snippet: String,
}

/// Stage-2 output: a potential issue plus the validator's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedIssue {
    pub issue: PotentialIssue,
    pub is_valid: bool,
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub library_reference: Option<String>,
    pub mitigation: Option<String>,
}

impl ValidatedIssue {
    /// Synthesized verdict for a session that stored nothing.
    pub fn inconclusive(issue: PotentialIssue) -> Self {
        Self {
            issue,
            is_valid: false,
            confidence: 0.0,
            evidence: vec!["Validation inconclusive".to_string()],
            library_reference: None,
            mitigation: None,
        }
    }

    /// Synthesized verdict for a session that failed outright.
    pub fn failed(issue: PotentialIssue, error: &str) -> Self {
        Self {
            issue,
            is_valid: false,
            confidence: 0.0,
            evidence: vec![format!("Validation failed: {error}")],
            library_reference: None,
            mitigation: None,
        }
    }
}

/// A generated test file destined for the coverage gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedTest {
    pub file_path: String,
    pub content: String,
    pub covers_functions: Vec<String>,
    pub test_count: usize,
}

// ---------------------------------------------------------------------------
// Lenient coercion from agent tool-call payloads
// ---------------------------------------------------------------------------

fn value_as_u32(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().map(|n| n as u32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn value_as_string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

impl PotentialIssue {
    /// Coerce an untyped `store_issue` payload into a `PotentialIssue`.
    ///
    /// Numeric strings are accepted for line numbers, an inverted line range
    /// is swapped, unknown kinds default to `bug` and unknown severities to
    /// `medium`. Returns `None` (after logging) when the record is unusable.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let file_path = match value_as_string(payload.get("file_path")) {
            Some(p) if !p.trim().is_empty() => p.replace('\\', "/"),
            _ => {
                warn!("dropping issue record without file_path: {payload}");
                return None;
            }
        };
        let description = value_as_string(payload.get("description")).unwrap_or_default();
        if description.trim().is_empty() {
            warn!(file_path, "dropping issue record without description");
            return None;
        }

        let mut line_start = value_as_u32(payload.get("line_start")).unwrap_or(0);
        let mut line_end = value_as_u32(payload.get("line_end")).unwrap_or(line_start);
        if line_end < line_start {
            std::mem::swap(&mut line_start, &mut line_end);
        }

        let kind = value_as_string(payload.get("issue_type"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(IssueKind::Bug);
        let severity = value_as_string(payload.get("severity"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(Severity::Medium);

        Some(Self {
            file_path,
            line_start,
            line_end,
            kind,
            severity,
            description,
            code_snippet: value_as_string(payload.get("code_snippet")).unwrap_or_default(),
        })
    }
}

impl ValidatedIssue {
    /// Coerce an untyped `store_verdict` payload into a `ValidatedIssue`.
    pub fn from_payload(issue: PotentialIssue, payload: &Value) -> Self {
        let confidence = payload
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        Self {
            issue,
            is_valid: payload.get("is_valid").and_then(Value::as_bool).unwrap_or(false),
            confidence,
            evidence: value_as_string_list(payload.get("evidence")),
            library_reference: value_as_string(payload.get("library_reference"))
                .filter(|s| !s.trim().is_empty()),
            mitigation: value_as_string(payload.get("mitigation"))
                .filter(|s| !s.trim().is_empty()),
        }
    }
}

impl GeneratedTest {
    /// Coerce an untyped `store_test` payload into a `GeneratedTest`.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let file_path = match value_as_string(payload.get("file_path")) {
            Some(p) if !p.trim().is_empty() => p,
            _ => {
                warn!("dropping test record without file_path");
                return None;
            }
        };
        let content = value_as_string(payload.get("content")).unwrap_or_default();
        if content.trim().is_empty() {
            warn!(file_path, "dropping test record without content");
            return None;
        }

        let mut test_count = value_as_u32(payload.get("test_count")).unwrap_or(0) as usize;
        if test_count == 0 {
            test_count = content.matches("def test_").count() + content.matches("#[test]").count();
        }

        Some(Self {
            file_path,
            content,
            covers_functions: value_as_string_list(payload.get("covers_functions")),
            test_count,
        })
    }
}
