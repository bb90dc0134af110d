use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::MergeMethod;
use crate::error::{Error, Result};

const DEFAULT_API_URL: &str = "https://api.github.com";
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Branch reference on one side of a PR.
#[derive(Debug, Clone, Deserialize)]
pub struct GitRef {
    #[serde(rename = "ref")]
    pub branch: String,
    pub sha: String,
}

/// The subset of PR metadata the engine needs.
#[derive(Debug, Clone, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub head: GitRef,
    pub base: GitRef,
    #[serde(default)]
    pub mergeable: Option<bool>,
    #[serde(default)]
    pub mergeable_state: Option<String>,
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub merge_commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusEntry {
    pub state: String,
    pub context: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CombinedStatus {
    pub state: String,
    #[serde(default)]
    pub statuses: Vec<StatusEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CheckRunList {
    #[serde(default)]
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Clone, Deserialize)]
struct PrFile {
    filename: String,
}

/// Result of a provider merge call.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged: bool,
    pub sha: Option<String>,
}

/// An inline review comment to place on the diff.
#[derive(Debug, Clone)]
pub struct InlineComment {
    pub path: String,
    pub line: u32,
    pub body: String,
    pub commit_sha: String,
}

/// Hosting-provider operations the engine depends on.
pub trait Provider {
    fn list_open_prs(&self, base: &str) -> Result<Vec<PrInfo>>;
    fn get_pr(&self, number: u64) -> Result<PrInfo>;
    fn get_diff(&self, number: u64) -> Result<String>;
    fn changed_files(&self, number: u64) -> Result<Vec<String>>;
    fn combined_status(&self, sha: &str) -> Result<CombinedStatus>;
    fn check_runs(&self, sha: &str) -> Result<Vec<CheckRun>>;
    fn post_review_comment(&self, number: u64, comment: &InlineComment) -> Result<()>;
    fn post_issue_comment(&self, number: u64, body: &str) -> Result<()>;
    fn merge_pr(&self, number: u64, method: MergeMethod, message: &str) -> Result<MergeOutcome>;
    fn delete_ref(&self, branch: &str) -> Result<()>;
    fn update_branch(&self, number: u64) -> Result<()>;
}

/// GitHub REST v3 implementation.
pub struct GitHubProvider {
    repo: String,
    token: String,
    base_url: String,
}

impl GitHubProvider {
    pub fn new(repo: &str, token: &str) -> Self {
        Self::with_base_url(repo, token, DEFAULT_API_URL)
    }

    pub fn with_base_url(repo: &str, token: &str, base_url: &str) -> Self {
        Self {
            repo: repo.to_string(),
            token: token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}{}", self.base_url, self.repo, path)
    }

    fn request(&self, method: &str, url: &str, accept: &str) -> ureq::Request {
        ureq::request(method, url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Accept", accept)
            .set("User-Agent", "mender")
    }

    /// GET with bounded exponential backoff on 429/5xx/transport errors.
    fn get_with_retry(&self, url: &str, accept: &str) -> Result<ureq::Response> {
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        for attempt in 1..=MAX_RETRIES {
            match self.request("GET", url, accept).call() {
                Ok(response) => return Ok(response),
                Err(ref e) if attempt < MAX_RETRIES && is_retryable(e) => {
                    warn!(attempt, error = %e, backoff_ms, "retrying provider call");
                    thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms *= 2;
                }
                Err(e) => return Err(Error::Provider(format!("GET {url} failed: {e}"))),
            }
        }
        unreachable!()
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        self.get_with_retry(&url, "application/vnd.github+json")?
            .into_json()
            .map_err(|e| Error::Provider(format!("invalid response from {url}: {e}")))
    }

    /// One-shot write call; merges and ref mutations are never retried.
    fn send(&self, method: &str, path: &str, body: Option<Value>) -> Result<Value> {
        let url = self.url(path);
        let request = self.request(method, &url, "application/vnd.github+json");
        let result = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };
        match result {
            Ok(response) => response
                .into_json()
                .or_else(|_| Ok(Value::Null))
                .map_err(|e: std::io::Error| {
                    Error::Provider(format!("invalid response from {url}: {e}"))
                }),
            Err(e) => Err(Error::Provider(format!("{method} {url} failed: {e}"))),
        }
    }
}

/// Only 429, 5xx and transport errors are worth retrying.
fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
        ureq::Error::Transport(_) => true,
    }
}

impl Provider for GitHubProvider {
    fn list_open_prs(&self, base: &str) -> Result<Vec<PrInfo>> {
        let mut prs: Vec<PrInfo> = Vec::new();
        let mut page = 1;
        loop {
            let batch: Vec<PrInfo> = self.get_json(&format!(
                "/pulls?state=open&base={base}&per_page=100&page={page}"
            ))?;
            let done = batch.len() < 100;
            prs.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        debug!(count = prs.len(), base, "listed open PRs");
        Ok(prs)
    }

    fn get_pr(&self, number: u64) -> Result<PrInfo> {
        self.get_json(&format!("/pulls/{number}"))
    }

    fn get_diff(&self, number: u64) -> Result<String> {
        let url = self.url(&format!("/pulls/{number}"));
        self.get_with_retry(&url, "application/vnd.github.v3.diff")?
            .into_string()
            .map_err(|e| Error::Provider(format!("failed to read diff: {e}")))
    }

    fn changed_files(&self, number: u64) -> Result<Vec<String>> {
        let mut files: Vec<String> = Vec::new();
        let mut page = 1;
        loop {
            let batch: Vec<PrFile> =
                self.get_json(&format!("/pulls/{number}/files?per_page=100&page={page}"))?;
            let done = batch.len() < 100;
            files.extend(batch.into_iter().map(|f| f.filename));
            if done {
                break;
            }
            page += 1;
        }
        Ok(files)
    }

    fn combined_status(&self, sha: &str) -> Result<CombinedStatus> {
        self.get_json(&format!("/commits/{sha}/status"))
    }

    fn check_runs(&self, sha: &str) -> Result<Vec<CheckRun>> {
        let list: CheckRunList = self.get_json(&format!("/commits/{sha}/check-runs"))?;
        Ok(list.check_runs)
    }

    fn post_review_comment(&self, number: u64, comment: &InlineComment) -> Result<()> {
        self.send(
            "POST",
            &format!("/pulls/{number}/comments"),
            Some(json!({
                "body": comment.body,
                "commit_id": comment.commit_sha,
                "path": comment.path,
                "line": comment.line,
                "side": "RIGHT",
            })),
        )?;
        Ok(())
    }

    fn post_issue_comment(&self, number: u64, body: &str) -> Result<()> {
        self.send(
            "POST",
            &format!("/issues/{number}/comments"),
            Some(json!({ "body": body })),
        )?;
        Ok(())
    }

    fn merge_pr(&self, number: u64, method: MergeMethod, message: &str) -> Result<MergeOutcome> {
        let response = self.send(
            "PUT",
            &format!("/pulls/{number}/merge"),
            Some(json!({
                "merge_method": method.as_str(),
                "commit_message": message,
            })),
        )?;
        Ok(MergeOutcome {
            merged: response
                .get("merged")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            sha: response
                .get("sha")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn delete_ref(&self, branch: &str) -> Result<()> {
        self.send("DELETE", &format!("/git/refs/heads/{branch}"), None)?;
        Ok(())
    }

    fn update_branch(&self, number: u64) -> Result<()> {
        self.send(
            "PUT",
            &format!("/pulls/{number}/update-branch"),
            Some(json!({})),
        )?;
        Ok(())
    }
}
