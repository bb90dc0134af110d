use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cli::{Cli, Command};
use crate::error::{Error, Result};
use crate::issue::Severity;

/// Merge method used by the hosting provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMethod {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl MergeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeMethod::Squash => "squash",
            MergeMethod::Merge => "merge",
            MergeMethod::Rebase => "rebase",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "squash" => Ok(MergeMethod::Squash),
            "merge" => Ok(MergeMethod::Merge),
            "rebase" => Ok(MergeMethod::Rebase),
            other => Err(Error::ConfigValidation(format!(
                "unknown merge_method: {other} (expected: squash, merge, rebase)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub repo: Option<String>,
    pub base_branch: Option<String>,

    pub agent_binary: Option<String>,
    pub agent_model: Option<String>,
    pub agent_timeout: Option<u64>,
    pub prompt_dir: Option<String>,

    pub min_confidence: Option<f64>,
    pub min_severity: Option<String>,
    pub parallel_validation: Option<bool>,
    pub max_parallel_validations: Option<usize>,
    pub report_low: Option<bool>,
    pub post_comments: Option<bool>,
    pub post_summary: Option<bool>,

    pub max_iterations: Option<u32>,
    pub auto_fix: Option<bool>,
    pub auto_merge: Option<bool>,
    pub min_severity_to_fix: Option<String>,
    pub commit_message_prefix: Option<String>,
    pub skip_repeated_issues: Option<bool>,
    pub run_tests: Option<bool>,
    pub test_command: Option<String>,
    pub require_tests_pass: Option<bool>,
    pub test_gate: Option<bool>,
    pub test_dir: Option<String>,
    pub working_dir: Option<String>,

    pub merge_method: Option<String>,
    pub delete_branch_after_merge: Option<bool>,
    pub auto_rebase_on_conflict: Option<bool>,
    pub max_parallel_reviews: Option<usize>,

    pub min_total_coverage: Option<f64>,
    pub min_new_code_coverage: Option<f64>,
    pub block_on_critical: Option<bool>,
    pub block_on_high: Option<bool>,
    pub all_tests_must_pass: Option<bool>,
    pub max_medium_issues: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub repo: String,
    pub base_branch: String,
    pub github_token: Option<String>,

    pub agent_binary: String,
    pub agent_model: Option<String>,
    pub agent_timeout: Option<u64>,
    pub prompt_dir: Option<String>,

    pub min_confidence: f64,
    pub min_severity: Severity,
    pub parallel_validation: bool,
    pub max_parallel_validations: usize,
    pub report_low: bool,
    pub post_comments: bool,
    pub post_summary: bool,

    pub max_iterations: u32,
    pub auto_fix: bool,
    pub auto_merge: bool,
    pub min_severity_to_fix: Severity,
    pub commit_message_prefix: String,
    pub skip_repeated_issues: bool,
    pub run_tests: bool,
    pub test_command: String,
    pub require_tests_pass: bool,
    pub test_gate: bool,
    pub test_dir: String,
    pub working_dir: PathBuf,

    pub merge_method: MergeMethod,
    pub delete_branch_after_merge: bool,
    pub auto_rebase_on_conflict: bool,
    pub max_parallel_reviews: usize,

    pub min_total_coverage: f64,
    pub min_new_code_coverage: f64,
    pub block_on_critical: bool,
    pub block_on_high: bool,
    pub all_tests_must_pass: bool,
    pub max_medium_issues: usize,
}

const DEFAULT_CONFIG_FILE: &str = ".mender/config.toml";

impl Config {
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_from(cli, Path::new("."))
    }

    pub fn load_from(cli: &Cli, project_dir: &Path) -> Result<Self> {
        let file_config = match &cli.config {
            Some(explicit_path) => {
                let path = Path::new(explicit_path);
                if !path.exists() {
                    return Err(Error::ConfigNotFound(path.to_path_buf()));
                }
                parse_config(&std::fs::read_to_string(path)?)?
            }
            None => {
                let path = project_dir.join(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    parse_config(&std::fs::read_to_string(&path)?)?
                } else {
                    ConfigFile::default()
                }
            }
        };

        merge(file_config, cli)
    }

    /// Fail unless a provider token is configured.
    pub fn require_token(&self) -> Result<&str> {
        self.github_token.as_deref().ok_or_else(|| {
            Error::ConfigValidation("GitHub token required (set GITHUB_TOKEN)".to_string())
        })
    }

    /// Fail unless a repository is configured.
    pub fn require_repo(&self) -> Result<&str> {
        if self.repo.is_empty() {
            return Err(Error::ConfigValidation(
                "repository required (use --repo or set GITHUB_REPOSITORY)".to_string(),
            ));
        }
        Ok(&self.repo)
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    Ok(toml::from_str(content)?)
}

fn parse_severity(value: Option<String>, default: Severity) -> Result<Severity> {
    match value {
        None => Ok(default),
        Some(s) => s.parse().map_err(Error::ConfigValidation),
    }
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Result<Config> {
    // Subcommand-specific overrides
    let (repo_arg, min_confidence_arg) = match &cli.command {
        Command::Review(a) => (a.repo.clone(), a.min_confidence),
        Command::Loop(a) => (a.repo.clone(), None),
        Command::Orchestrate(a) => (a.repo.clone(), None),
        Command::Collector(_) => (None, None),
    };

    let (auto_fix, auto_merge, run_tests, require_tests_pass, test_gate) = match &cli.command {
        Command::Loop(a) => (
            if a.no_fix { Some(false) } else { None },
            if a.auto_merge { Some(true) } else { None },
            if a.run_tests { Some(true) } else { None },
            if a.require_tests_pass { Some(true) } else { None },
            if a.test_gate { Some(true) } else { None },
        ),
        _ => (None, None, None, None, None),
    };

    let config = Config {
        repo: repo_arg
            .or(file.repo)
            .or_else(|| std::env::var("GITHUB_REPOSITORY").ok())
            .unwrap_or_default(),
        base_branch: match &cli.command {
            Command::Orchestrate(a) => a.base.clone(),
            _ => None,
        }
        .or(file.base_branch)
        .unwrap_or_else(|| "main".to_string()),
        github_token: std::env::var("GITHUB_TOKEN").ok(),

        agent_binary: file.agent_binary.unwrap_or_else(|| "claude".to_string()),
        agent_model: file.agent_model,
        agent_timeout: file.agent_timeout.or(Some(600)),
        prompt_dir: file.prompt_dir,

        min_confidence: min_confidence_arg.or(file.min_confidence).unwrap_or(0.7),
        min_severity: parse_severity(file.min_severity, Severity::Medium)?,
        parallel_validation: match &cli.command {
            Command::Review(a) if a.sequential => false,
            _ => file.parallel_validation.unwrap_or(true),
        },
        max_parallel_validations: file.max_parallel_validations.unwrap_or(5),
        report_low: match &cli.command {
            Command::Review(a) if a.report_low => true,
            _ => file.report_low.unwrap_or(false),
        },
        post_comments: match &cli.command {
            Command::Review(a) if a.no_comments => false,
            _ => file.post_comments.unwrap_or(true),
        },
        post_summary: match &cli.command {
            Command::Review(a) if a.no_summary => false,
            _ => file.post_summary.unwrap_or(true),
        },

        max_iterations: match &cli.command {
            Command::Loop(a) => a.max_iterations,
            _ => None,
        }
        .or(file.max_iterations)
        .unwrap_or(5),
        auto_fix: auto_fix.or(file.auto_fix).unwrap_or(true),
        auto_merge: auto_merge.or(file.auto_merge).unwrap_or(false),
        min_severity_to_fix: parse_severity(file.min_severity_to_fix, Severity::Medium)?,
        commit_message_prefix: file
            .commit_message_prefix
            .unwrap_or_else(|| "fix: ".to_string()),
        skip_repeated_issues: file.skip_repeated_issues.unwrap_or(true),
        run_tests: run_tests.or(file.run_tests).unwrap_or(false),
        test_command: match &cli.command {
            Command::Loop(a) => a.test_command.clone(),
            _ => None,
        }
        .or(file.test_command)
        .unwrap_or_else(|| "pytest".to_string()),
        require_tests_pass: require_tests_pass.or(file.require_tests_pass).unwrap_or(false),
        test_gate: test_gate.or(file.test_gate).unwrap_or(false),
        test_dir: file.test_dir.unwrap_or_else(|| "tests".to_string()),
        working_dir: match &cli.command {
            Command::Loop(a) => a.working_dir.clone(),
            _ => None,
        }
        .or(file.working_dir)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".")),

        merge_method: MergeMethod::parse(file.merge_method.as_deref().unwrap_or("squash"))?,
        delete_branch_after_merge: file.delete_branch_after_merge.unwrap_or(true),
        auto_rebase_on_conflict: file.auto_rebase_on_conflict.unwrap_or(true),
        max_parallel_reviews: match &cli.command {
            Command::Orchestrate(a) => a.max_parallel,
            _ => None,
        }
        .or(file.max_parallel_reviews)
        .unwrap_or(5),

        min_total_coverage: file.min_total_coverage.unwrap_or(80.0),
        min_new_code_coverage: file.min_new_code_coverage.unwrap_or(90.0),
        block_on_critical: file.block_on_critical.unwrap_or(true),
        block_on_high: file.block_on_high.unwrap_or(true),
        all_tests_must_pass: file.all_tests_must_pass.unwrap_or(true),
        max_medium_issues: file.max_medium_issues.unwrap_or(3),
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if !(0.0..=1.0).contains(&config.min_confidence) {
        return Err(Error::ConfigValidation(format!(
            "min_confidence must be in [0.0, 1.0], got {}",
            config.min_confidence
        )));
    }
    for (name, value) in [
        ("min_total_coverage", config.min_total_coverage),
        ("min_new_code_coverage", config.min_new_code_coverage),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(Error::ConfigValidation(format!(
                "{name} must be in [0.0, 100.0], got {value}"
            )));
        }
    }
    if config.max_iterations == 0 {
        return Err(Error::ConfigValidation(
            "max_iterations must be > 0".to_string(),
        ));
    }
    if config.max_parallel_reviews == 0 {
        return Err(Error::ConfigValidation(
            "max_parallel_reviews must be > 0".to_string(),
        ));
    }
    if config.max_parallel_validations == 0 {
        return Err(Error::ConfigValidation(
            "max_parallel_validations must be > 0".to_string(),
        ));
    }
    Ok(())
}
