use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::issue::{GeneratedTest, Severity, ValidatedIssue};
use crate::process::{ProcessConfig, spawn_and_stream};

const TEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Declarative policy converting test outcomes and issue severities into a
/// merge decision.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRules {
    pub min_total_coverage: f64,
    pub min_new_code_coverage: f64,
    pub all_tests_must_pass: bool,
    pub block_on_critical: bool,
    pub block_on_high: bool,
    pub max_medium_issues: usize,
}

impl Default for MergeRules {
    fn default() -> Self {
        Self {
            min_total_coverage: 80.0,
            min_new_code_coverage: 90.0,
            all_tests_must_pass: true,
            block_on_critical: true,
            block_on_high: true,
            max_medium_issues: 3,
        }
    }
}

/// Result of one test-runner invocation with coverage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageResult {
    pub total_coverage: f64,
    pub new_code_coverage: f64,
    pub uncovered_lines: BTreeMap<String, Vec<u32>>,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub tests_skipped: usize,
    pub duration: Duration,
}

impl CoverageResult {
    pub fn all_tests_passed(&self) -> bool {
        self.tests_failed == 0
    }

    fn failed_run() -> Self {
        Self {
            tests_failed: 1,
            ..Self::default()
        }
    }
}

/// Final verdict of the coverage gate.
#[derive(Debug, Clone)]
pub struct MergeDecision {
    pub approved: bool,
    pub reason: String,
    pub conditions: BTreeMap<String, bool>,
    pub blocking_issues: Vec<String>,
    pub recommendations: Vec<String>,
}

impl MergeDecision {
    /// Human-readable markdown summary, suitable for a PR comment.
    pub fn summary(&self) -> String {
        let status = if self.approved { "APPROVED" } else { "BLOCKED" };
        let mut lines = vec![
            format!("## Merge Decision: {status}"),
            String::new(),
            self.reason.clone(),
            String::new(),
            "### Conditions".to_string(),
        ];
        for (condition, met) in &self.conditions {
            let icon = if *met { "pass" } else { "FAIL" };
            lines.push(format!("- [{icon}] {condition}"));
        }
        if !self.blocking_issues.is_empty() {
            lines.push(String::new());
            lines.push("### Blocking Issues".to_string());
            for issue in &self.blocking_issues {
                lines.push(format!("- {issue}"));
            }
        }
        if !self.recommendations.is_empty() {
            lines.push(String::new());
            lines.push("### Recommendations".to_string());
            for rec in &self.recommendations {
                lines.push(format!("- {rec}"));
            }
        }
        lines.join("\n")
    }
}

/// Applies merge rules to a test run's output.
pub struct CoverageGate {
    rules: MergeRules,
    test_command: String,
    test_dir: String,
    work_dir: PathBuf,
}

impl CoverageGate {
    pub fn new(rules: MergeRules, test_command: &str, test_dir: &str, work_dir: &Path) -> Self {
        Self {
            rules,
            test_command: test_command.to_string(),
            test_dir: test_dir.to_string(),
            work_dir: work_dir.to_path_buf(),
        }
    }

    /// Run the full gate: write tests, run them with coverage, decide.
    pub async fn execute(
        &self,
        generated_tests: &[GeneratedTest],
        validated_issues: &[ValidatedIssue],
        changed_files: &[String],
    ) -> MergeDecision {
        let written = self.write_tests(generated_tests);
        info!(count = written, "wrote generated test files");

        let coverage = self.run_tests_with_coverage(changed_files).await;
        info!(
            passed = coverage.tests_passed,
            failed = coverage.tests_failed,
            total = coverage.total_coverage,
            new_code = coverage.new_code_coverage,
            "test run complete"
        );

        let conditions = self.check_conditions(&coverage, validated_issues);
        self.decide(conditions, &coverage)
    }

    fn write_tests(&self, tests: &[GeneratedTest]) -> usize {
        let mut written = 0;
        for test in tests {
            let path = self.work_dir.join(&test.file_path);
            if let Some(parent) = path.parent()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                warn!(file = %test.file_path, error = %e, "failed to create test dir");
                continue;
            }
            match std::fs::write(&path, &test.content) {
                Ok(()) => {
                    info!(file = %test.file_path, cases = test.test_count, "wrote test file");
                    written += 1;
                }
                Err(e) => warn!(file = %test.file_path, error = %e, "failed to write test file"),
            }
        }
        written
    }

    async fn run_tests_with_coverage(&self, changed_files: &[String]) -> CoverageResult {
        match self.try_run_tests(changed_files).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "test execution failed");
                CoverageResult::failed_run()
            }
        }
    }

    async fn try_run_tests(&self, changed_files: &[String]) -> Result<CoverageResult> {
        let mut parts = self.test_command.split_whitespace();
        let command = parts
            .next()
            .ok_or_else(|| Error::Coverage("empty test command".to_string()))?
            .to_string();
        let mut args: Vec<String> = parts.map(str::to_string).collect();
        args.push(format!("--cov={}", source_roots(changed_files)));
        args.push("--cov-report=json".to_string());
        args.push("--cov-report=term".to_string());
        args.push("-v".to_string());
        args.push(self.test_dir.clone());

        info!(command, ?args, "running test command");
        let output = spawn_and_stream(ProcessConfig {
            command,
            args,
            working_dir: self.work_dir.clone(),
            timeout: Some(TEST_TIMEOUT),
            log_prefix: "tests".to_string(),
            env: vec![],
        })
        .await?;

        if output.timed_out {
            warn!("test runner timed out");
            return Ok(CoverageResult::failed_run());
        }

        let combined = format!("{}\n{}", output.stdout(), output.stderr());
        let mut result = parse_runner_output(&combined);
        result.duration = output.duration;
        apply_coverage_json(
            &mut result,
            &self.work_dir.join("coverage.json"),
            changed_files,
        );
        Ok(result)
    }

    fn check_conditions(
        &self,
        coverage: &CoverageResult,
        issues: &[ValidatedIssue],
    ) -> BTreeMap<String, bool> {
        let count = |severity: Severity| {
            issues
                .iter()
                .filter(|i| i.is_valid && i.issue.severity == severity)
                .count()
        };

        let mut conditions = BTreeMap::new();
        conditions.insert(
            "all_tests_pass".to_string(),
            coverage.all_tests_passed() || !self.rules.all_tests_must_pass,
        );
        conditions.insert(
            "min_total_coverage".to_string(),
            coverage.total_coverage >= self.rules.min_total_coverage,
        );
        conditions.insert(
            "min_new_code_coverage".to_string(),
            coverage.new_code_coverage >= self.rules.min_new_code_coverage,
        );
        conditions.insert(
            "no_critical_issues".to_string(),
            count(Severity::Critical) == 0,
        );
        conditions.insert(
            "no_high_issues".to_string(),
            !self.rules.block_on_high || count(Severity::High) == 0,
        );
        conditions.insert(
            "medium_issues_limit".to_string(),
            count(Severity::Medium) <= self.rules.max_medium_issues,
        );
        conditions
    }

    fn decide(
        &self,
        conditions: BTreeMap<String, bool>,
        coverage: &CoverageResult,
    ) -> MergeDecision {
        let approved = conditions.values().all(|met| *met);

        let reason = if approved {
            "All conditions met. PR is ready for merge.".to_string()
        } else {
            let failed: Vec<&str> = conditions
                .iter()
                .filter(|(_, met)| !**met)
                .map(|(name, _)| name.as_str())
                .collect();
            format!("Blocked due to failed conditions: {}", failed.join(", "))
        };

        let met = |name: &str| conditions.get(name).copied().unwrap_or(true);
        let mut blocking = Vec::new();
        if !met("all_tests_pass") {
            blocking.push(format!("{} tests failed", coverage.tests_failed));
        }
        if !met("min_total_coverage") {
            blocking.push(format!(
                "Total coverage {:.1}% < {:.1}%",
                coverage.total_coverage, self.rules.min_total_coverage
            ));
        }
        if !met("min_new_code_coverage") {
            blocking.push(format!(
                "New code coverage {:.1}% < {:.1}%",
                coverage.new_code_coverage, self.rules.min_new_code_coverage
            ));
        }
        if !met("no_critical_issues") {
            blocking.push("Critical issues found".to_string());
        }
        if !met("no_high_issues") {
            blocking.push("High severity issues found".to_string());
        }
        if !met("medium_issues_limit") {
            blocking.push("Too many medium severity issues".to_string());
        }

        let mut recommendations = Vec::new();
        if !coverage.uncovered_lines.is_empty() {
            recommendations.push("Add tests for uncovered lines".to_string());
        }
        if coverage.tests_failed > 0 {
            recommendations.push("Fix failing tests before merge".to_string());
        }
        if !met("min_new_code_coverage") {
            recommendations.push("Increase test coverage for new code".to_string());
        }

        MergeDecision {
            approved,
            reason,
            conditions,
            blocking_issues: blocking,
            recommendations,
        }
    }
}

/// Top-level directories of the changed files, joined for `--cov=`.
fn source_roots(changed_files: &[String]) -> String {
    let mut roots: Vec<String> = changed_files
        .iter()
        .filter_map(|f| f.split('/').next())
        .map(str::to_string)
        .collect();
    roots.sort();
    roots.dedup();
    if roots.is_empty() {
        ".".to_string()
    } else {
        roots.join(",")
    }
}

/// Scan runner stdout for the summary line and the terminal TOTAL row.
fn parse_runner_output(output: &str) -> CoverageResult {
    let passed_re = Regex::new(r"(\d+) passed").unwrap();
    let failed_re = Regex::new(r"(\d+) failed").unwrap();
    let skipped_re = Regex::new(r"(\d+) skipped").unwrap();
    let total_re = Regex::new(r"^TOTAL\s.*?(\d+(?:\.\d+)?)%").unwrap();

    let mut result = CoverageResult::default();
    for line in output.lines() {
        if let Some(caps) = passed_re.captures(line) {
            result.tests_passed = caps[1].parse().unwrap_or(0);
        }
        if let Some(caps) = failed_re.captures(line) {
            result.tests_failed = caps[1].parse().unwrap_or(0);
        }
        if let Some(caps) = skipped_re.captures(line) {
            result.tests_skipped = caps[1].parse().unwrap_or(0);
        }
        if let Some(caps) = total_re.captures(line.trim_start()) {
            result.total_coverage = caps[1].parse().unwrap_or(0.0);
        }
    }
    result
}

#[derive(Debug, Deserialize)]
struct CoverageJson {
    #[serde(default)]
    files: BTreeMap<String, FileCoverage>,
    #[serde(default)]
    totals: CoverageTotals,
}

#[derive(Debug, Deserialize)]
struct FileCoverage {
    #[serde(default)]
    executed_lines: Vec<u32>,
    #[serde(default)]
    missing_lines: Vec<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CoverageTotals {
    percent_covered: Option<f64>,
}

/// Prefer the JSON report when present: exact totals plus per-file detail
/// for the new-code ratio over the changed files.
fn apply_coverage_json(result: &mut CoverageResult, path: &Path, changed_files: &[String]) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    let parsed: CoverageJson = match serde_json::from_str(&content) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "failed to parse coverage.json");
            return;
        }
    };

    let mut new_covered = 0usize;
    let mut new_total = 0usize;
    for (file_path, file) in &parsed.files {
        let is_changed = changed_files
            .iter()
            .any(|cf| file_path.ends_with(cf.as_str()) || cf.ends_with(file_path.as_str()));
        if !is_changed {
            continue;
        }
        new_total += file.executed_lines.len() + file.missing_lines.len();
        new_covered += file.executed_lines.len();
        if !file.missing_lines.is_empty() {
            result
                .uncovered_lines
                .insert(file_path.clone(), file.missing_lines.clone());
        }
    }
    if new_total > 0 {
        result.new_code_coverage = (new_covered as f64 / new_total as f64) * 100.0;
    }
    if let Some(total) = parsed.totals.percent_covered {
        result.total_coverage = total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{IssueKind, PotentialIssue};

    fn gate(rules: MergeRules) -> CoverageGate {
        CoverageGate::new(rules, "pytest", "tests", Path::new("."))
    }

    fn valid_issue(severity: Severity) -> ValidatedIssue {
        ValidatedIssue {
            issue: PotentialIssue {
                file_path: "src/app.py".to_string(),
                line_start: 1,
                line_end: 1,
                kind: IssueKind::Bug,
                severity,
                description: "d".to_string(),
                code_snippet: String::new(),
            },
            is_valid: true,
            confidence: 0.9,
            evidence: vec![],
            library_reference: None,
            mitigation: None,
        }
    }

    fn coverage(total: f64, new: f64, passed: usize, failed: usize) -> CoverageResult {
        CoverageResult {
            total_coverage: total,
            new_code_coverage: new,
            tests_passed: passed,
            tests_failed: failed,
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_run_is_approved() {
        // total=85, new=92, 10 passed, 0 failed, no critical/high issues
        let g = gate(MergeRules::default());
        let conditions = g.check_conditions(&coverage(85.0, 92.0, 10, 0), &[]);
        let decision = g.decide(conditions, &coverage(85.0, 92.0, 10, 0));
        assert!(decision.approved);
        assert!(decision.reason.contains("ready for merge"));
        assert!(decision.blocking_issues.is_empty());
    }

    #[test]
    fn test_critical_issue_blocks() {
        let g = gate(MergeRules::default());
        let issues = vec![valid_issue(Severity::Critical)];
        let cov = coverage(85.0, 92.0, 10, 0);
        let conditions = g.check_conditions(&cov, &issues);
        assert_eq!(conditions.get("no_critical_issues"), Some(&false));
        let decision = g.decide(conditions, &cov);
        assert!(!decision.approved);
        assert!(decision.blocking_issues.contains(&"Critical issues found".to_string()));
        assert!(decision.reason.contains("no_critical_issues"));
    }

    #[test]
    fn test_high_issues_respect_rule_flag() {
        let cov = coverage(85.0, 92.0, 10, 0);
        let issues = vec![valid_issue(Severity::High)];

        let strict = gate(MergeRules::default());
        assert_eq!(
            strict.check_conditions(&cov, &issues).get("no_high_issues"),
            Some(&false)
        );

        let lenient = gate(MergeRules {
            block_on_high: false,
            ..Default::default()
        });
        assert_eq!(
            lenient.check_conditions(&cov, &issues).get("no_high_issues"),
            Some(&true)
        );
    }

    #[test]
    fn test_critical_blocking_is_not_overridable() {
        let g = gate(MergeRules {
            block_on_critical: false,
            ..Default::default()
        });
        let cov = coverage(85.0, 92.0, 10, 0);
        let conditions = g.check_conditions(&cov, &[valid_issue(Severity::Critical)]);
        assert_eq!(conditions.get("no_critical_issues"), Some(&false));
    }

    #[test]
    fn test_medium_issue_cap() {
        let g = gate(MergeRules {
            max_medium_issues: 1,
            ..Default::default()
        });
        let cov = coverage(85.0, 92.0, 10, 0);
        let issues = vec![valid_issue(Severity::Medium), valid_issue(Severity::Medium)];
        let conditions = g.check_conditions(&cov, &issues);
        assert_eq!(conditions.get("medium_issues_limit"), Some(&false));
    }

    #[test]
    fn test_invalid_issues_do_not_count() {
        let g = gate(MergeRules::default());
        let mut issue = valid_issue(Severity::Critical);
        issue.is_valid = false;
        let conditions = g.check_conditions(&coverage(85.0, 92.0, 1, 0), &[issue]);
        assert_eq!(conditions.get("no_critical_issues"), Some(&true));
    }

    #[test]
    fn test_low_coverage_blocks_with_message() {
        let g = gate(MergeRules::default());
        let cov = coverage(85.0, 82.3, 10, 0);
        let conditions = g.check_conditions(&cov, &[]);
        let decision = g.decide(conditions, &cov);
        assert!(!decision.approved);
        assert!(decision
            .blocking_issues
            .contains(&"New code coverage 82.3% < 90.0%".to_string()));
        assert!(decision
            .recommendations
            .contains(&"Increase test coverage for new code".to_string()));
    }

    #[test]
    fn test_failed_tests_block_and_recommend() {
        let g = gate(MergeRules::default());
        let cov = coverage(85.0, 92.0, 8, 2);
        let conditions = g.check_conditions(&cov, &[]);
        let decision = g.decide(conditions, &cov);
        assert!(!decision.approved);
        assert!(decision.blocking_issues.contains(&"2 tests failed".to_string()));
        assert!(decision
            .recommendations
            .contains(&"Fix failing tests before merge".to_string()));
    }

    #[test]
    fn test_reason_lists_exactly_failing_conditions() {
        let g = gate(MergeRules::default());
        let cov = coverage(10.0, 92.0, 10, 0);
        let conditions = g.check_conditions(&cov, &[]);
        let decision = g.decide(conditions.clone(), &cov);
        for (name, met) in &conditions {
            if *met {
                assert!(!decision.reason.contains(name.as_str()));
            } else {
                assert!(decision.reason.contains(name.as_str()));
            }
        }
    }

    #[test]
    fn test_summary_renders_sections() {
        let g = gate(MergeRules::default());
        let cov = coverage(50.0, 92.0, 10, 0);
        let decision = g.decide(g.check_conditions(&cov, &[]), &cov);
        let summary = decision.summary();
        assert!(summary.contains("## Merge Decision: BLOCKED"));
        assert!(summary.contains("### Conditions"));
        assert!(summary.contains("### Blocking Issues"));
    }

    #[test]
    fn test_parse_runner_output_summary() {
        let output = "\
collected 12 items
tests/test_app.py::test_one PASSED
============ 10 passed, 1 failed, 1 skipped in 2.34s ============
Name             Stmts   Miss  Cover
src/app.py          50      5    90%
TOTAL              100     10    90%";
        let result = parse_runner_output(output);
        assert_eq!(result.tests_passed, 10);
        assert_eq!(result.tests_failed, 1);
        assert_eq!(result.tests_skipped, 1);
        assert_eq!(result.total_coverage, 90.0);
    }

    #[test]
    fn test_parse_runner_output_passed_only() {
        let result = parse_runner_output("5 passed in 1.23s");
        assert_eq!(result.tests_passed, 5);
        assert_eq!(result.tests_failed, 0);
    }

    #[test]
    fn test_coverage_json_overrides_and_computes_new_code() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("coverage.json");
        std::fs::write(
            &json_path,
            r#"{
                "files": {
                    "src/app.py": { "executed_lines": [1,2,3,4,5,6,7,8,9], "missing_lines": [10] },
                    "src/other.py": { "executed_lines": [1], "missing_lines": [2,3] }
                },
                "totals": { "percent_covered": 87.5 }
            }"#,
        )
        .unwrap();

        let mut result = CoverageResult {
            total_coverage: 90.0,
            ..Default::default()
        };
        apply_coverage_json(&mut result, &json_path, &["src/app.py".to_string()]);
        assert_eq!(result.total_coverage, 87.5);
        assert_eq!(result.new_code_coverage, 90.0);
        assert_eq!(result.uncovered_lines.get("src/app.py"), Some(&vec![10]));
        assert!(!result.uncovered_lines.contains_key("src/other.py"));
    }

    #[test]
    fn test_coverage_json_missing_file_is_noop() {
        let mut result = CoverageResult::default();
        apply_coverage_json(&mut result, Path::new("/nonexistent/coverage.json"), &[]);
        assert_eq!(result, CoverageResult::default());
    }

    #[test]
    fn test_source_roots() {
        assert_eq!(
            source_roots(&[
                "src/app.py".to_string(),
                "src/db.py".to_string(),
                "lib/util.py".to_string(),
            ]),
            "lib,src"
        );
        assert_eq!(source_roots(&[]), ".");
    }

    #[tokio::test]
    async fn test_execute_with_fake_runner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-pytest");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '6 passed in 0.5s'\necho 'TOTAL 100 10 90%'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let g = CoverageGate::new(
            MergeRules {
                min_new_code_coverage: 0.0,
                ..Default::default()
            },
            script.to_str().unwrap(),
            "tests",
            dir.path(),
        );
        let tests = vec![GeneratedTest {
            file_path: "tests/test_generated.py".to_string(),
            content: "def test_ok():\n    assert True\n".to_string(),
            covers_functions: vec![],
            test_count: 1,
        }];
        let decision = g.execute(&tests, &[], &["src/app.py".to_string()]).await;

        assert!(dir.path().join("tests/test_generated.py").exists());
        assert!(decision.approved, "reason: {}", decision.reason);
    }

    #[tokio::test]
    async fn test_execute_missing_runner_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let g = CoverageGate::new(
            MergeRules::default(),
            "definitely-not-a-test-runner",
            "tests",
            dir.path(),
        );
        let decision = g.execute(&[], &[], &[]).await;
        assert!(!decision.approved);
        assert_eq!(decision.conditions.get("all_tests_pass"), Some(&false));
    }
}
