//! GitHub host implementation

use crate::error::{Error, Result};
use crate::normalize::path_prefixes;
use crate::platform::HostService;
use crate::types::{
    CheckStatus, DiffStats, MergeMethod, MergeOutcome, PrId, PullRequestSnapshot,
};
use async_trait::async_trait;
use chrono::Utc;
use octocrab::Octocrab;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

// GraphQL response types for the review-thread resolution query

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
}

#[derive(Deserialize)]
struct ThreadQueryData {
    repository: ThreadRepository,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadRepository {
    pull_request: ThreadPullRequest,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadPullRequest {
    review_threads: ThreadNodes,
}

#[derive(Deserialize)]
struct ThreadNodes {
    nodes: Vec<ThreadNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadNode {
    is_resolved: bool,
}

/// Page size for the PR files listing
const FILES_PER_PAGE: usize = 100;

/// One entry from the PR files listing
#[derive(Deserialize)]
struct PrFile {
    filename: String,
    additions: u64,
    deletions: u64,
}

/// Aggregate the full (all pages) files listing into diff stats
fn diff_from_files(files: &[PrFile]) -> DiffStats {
    let names: Vec<String> = files.iter().map(|f| f.filename.clone()).collect();
    DiffStats {
        files_changed: files.len() as u64,
        lines_changed: files.iter().map(|f| f.additions + f.deletions).sum(),
        path_prefixes: path_prefixes(&names),
    }
}

/// GitHub host using octocrab, with raw HTTP for the endpoints octocrab
/// does not model (check runs, combined status, update-branch, approvals)
pub struct GitHubHost {
    client: Octocrab,
    owner: String,
    repo: String,
    /// Token for raw HTTP requests
    token: String,
    /// HTTP client for raw requests
    http_client: Client,
    /// API host for raw requests
    api_host: String,
}

impl GitHubHost {
    /// Create a new GitHub host service
    pub fn new(token: &str, owner: String, repo: String, host: Option<String>) -> Result<Self> {
        let mut builder = Octocrab::builder().personal_token(token.to_string());

        let api_host = if let Some(ref h) = host {
            let base_url = format!("https://{h}/api/v3");
            builder = builder
                .base_uri(&base_url)
                .map_err(|e| Error::HostApi(e.to_string()))?;
            format!("{h}/api/v3")
        } else {
            "api.github.com".to_string()
        };

        let client = builder
            .build()
            .map_err(|e| Error::HostApi(e.to_string()))?;

        let http_client = Client::builder()
            .user_agent("autoland")
            .build()
            .map_err(|e| Error::HostApi(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            owner,
            repo,
            token: token.to_string(),
            http_client,
            api_host,
        })
    }

    fn api_url(&self, tail: &str) -> String {
        format!(
            "https://{}/repos/{}/{}/{tail}",
            self.api_host, self.owner, self.repo
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .http_client
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .map_err(|e| Error::HostApi(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        // Rate limits and host hiccups are worth a retry; client errors are not
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(Error::CheckTransient(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(Error::HostApi(format!("{url} returned {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| Error::HostApi(format!("failed to parse response from {url}: {e}")))
    }

    /// Per-check statuses for a commit, merging the modern check-runs API
    /// with legacy commit statuses (external CI still uses the latter)
    async fn check_statuses(&self, ref_name: &str) -> Result<BTreeMap<String, CheckStatus>> {
        #[derive(Deserialize)]
        struct CheckRunsResponse {
            check_runs: Vec<CheckRun>,
        }

        #[derive(Deserialize)]
        struct CheckRun {
            name: String,
            status: String,
            conclusion: Option<String>,
        }

        #[derive(Deserialize)]
        struct CombinedStatus {
            statuses: Vec<CommitStatus>,
        }

        #[derive(Deserialize)]
        struct CommitStatus {
            context: String,
            state: String,
        }

        let mut checks = BTreeMap::new();

        let runs: CheckRunsResponse = self
            .get_json(&self.api_url(&format!("commits/{ref_name}/check-runs")))
            .await?;
        for run in runs.check_runs {
            let status = if run.status == "completed" {
                match run.conclusion.as_deref() {
                    Some("success" | "neutral") => CheckStatus::Pass,
                    Some("skipped") => CheckStatus::Skipped,
                    _ => CheckStatus::Fail,
                }
            } else {
                CheckStatus::Pending
            };
            checks.insert(run.name, status);
        }

        let combined: CombinedStatus = self
            .get_json(&self.api_url(&format!("commits/{ref_name}/status")))
            .await?;
        for status in combined.statuses {
            let mapped = match status.state.as_str() {
                "success" => CheckStatus::Pass,
                "pending" => CheckStatus::Pending,
                _ => CheckStatus::Fail,
            };
            checks.insert(status.context, mapped);
        }

        Ok(checks)
    }

    /// Diff stats from the PR files listing.
    ///
    /// The listing is paginated; every page must be read, since the line
    /// total feeds the tier diff ceilings.
    async fn diff_stats(&self, pr_id: PrId) -> Result<DiffStats> {
        let mut files: Vec<PrFile> = Vec::new();
        let mut page = 1u32;
        loop {
            let batch: Vec<PrFile> = self
                .get_json(&self.api_url(&format!(
                    "pulls/{pr_id}/files?per_page={FILES_PER_PAGE}&page={page}"
                )))
                .await?;
            let last_page = batch.len() < FILES_PER_PAGE;
            files.extend(batch);
            if last_page {
                break;
            }
            page += 1;
        }

        Ok(diff_from_files(&files))
    }

    /// Count distinct users whose latest review is an approval
    async fn approval_count(&self, pr_id: PrId) -> Result<u32> {
        let reviews = self
            .client
            .pulls(&self.owner, &self.repo)
            .list_reviews(pr_id)
            .send()
            .await?;

        // Later reviews supersede earlier ones from the same user
        let mut latest: BTreeMap<String, bool> = BTreeMap::new();
        for review in reviews.items {
            let Some(user) = review.user.as_ref() else {
                continue;
            };
            let approved = review
                .state
                .as_ref()
                .is_some_and(|s| *s == octocrab::models::pulls::ReviewState::Approved);
            latest.insert(user.login.clone(), approved);
        }
        Ok(u32::try_from(latest.values().filter(|a| **a).count()).unwrap_or(u32::MAX))
    }

    /// Whether every review thread on the PR is resolved
    async fn conversations_resolved(&self, pr_id: PrId) -> Result<bool> {
        let response: GraphQlResponse<ThreadQueryData> = self
            .client
            .graphql(&serde_json::json!({
                "query": r"
                    query ReviewThreads($owner: String!, $name: String!, $number: Int!) {
                        repository(owner: $owner, name: $name) {
                            pullRequest(number: $number) {
                                reviewThreads(first: 100) {
                                    nodes { isResolved }
                                }
                            }
                        }
                    }
                ",
                "variables": {
                    "owner": self.owner,
                    "name": self.repo,
                    "number": pr_id,
                }
            }))
            .await
            .map_err(|e| Error::HostApi(format!("review thread query failed: {e}")))?;

        let data = response
            .data
            .ok_or_else(|| Error::HostApi("No data in GraphQL response".to_string()))?;

        Ok(data
            .repository
            .pull_request
            .review_threads
            .nodes
            .iter()
            .all(|n| n.is_resolved))
    }
}

#[async_trait]
impl HostService for GitHubHost {
    async fn fetch_snapshot(&self, pr_id: PrId) -> Result<PullRequestSnapshot> {
        debug!(pr_id, "fetching live snapshot");

        let pr = self
            .client
            .pulls(&self.owner, &self.repo)
            .get(pr_id)
            .await?;

        let head_commit = pr.head.sha.clone();
        let labels = pr
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|l| l.name)
            .collect();
        let author = pr
            .user
            .as_ref()
            .map(|u| u.login.clone())
            .unwrap_or_default();

        let checks = self.check_statuses(&head_commit).await?;
        let diff = self.diff_stats(pr_id).await?;
        let approvals = self.approval_count(pr_id).await?;
        let conversations_resolved = self.conversations_resolved(pr_id).await?;

        let snapshot = PullRequestSnapshot {
            id: pr_id,
            head_commit,
            base_commit: pr.base.sha.clone(),
            labels,
            approvals,
            checks,
            diff,
            author,
            conversations_resolved,
            received_at: Utc::now(),
        };

        debug!(
            pr_id,
            head = %snapshot.head_commit,
            approvals = snapshot.approvals,
            "fetched live snapshot"
        );
        Ok(snapshot)
    }

    async fn approve_pr(&self, pr_id: PrId) -> Result<()> {
        debug!(pr_id, "approving PR");
        let url = self.api_url(&format!("pulls/{pr_id}/reviews"));
        let response = self
            .http_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .json(&serde_json::json!({ "event": "APPROVE" }))
            .send()
            .await
            .map_err(|e| Error::HostApi(format!("approve failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::HostApi(format!(
                "approve returned {}",
                response.status()
            )));
        }
        debug!(pr_id, "approved PR");
        Ok(())
    }

    async fn comment(&self, pr_id: PrId, body: &str) -> Result<()> {
        debug!(pr_id, "posting status comment");
        self.client
            .issues(&self.owner, &self.repo)
            .create_comment(pr_id, body)
            .await?;
        Ok(())
    }

    async fn update_branch(&self, pr_id: PrId) -> Result<String> {
        debug!(pr_id, "updating branch onto integration head");
        let url = self.api_url(&format!("pulls/{pr_id}/update-branch"));
        let response = self
            .http_client
            .put(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| Error::HostApi(format!("update-branch failed: {e}")))?;

        // 422 means the branch already contains the base head or has
        // conflicts; surface the latter as a merge conflict
        if response.status().as_u16() == 422 {
            return Err(Error::MergeConflict(
                "update-branch rejected; branch likely conflicts with base".to_string(),
            ));
        }
        if !response.status().is_success() {
            return Err(Error::HostApi(format!(
                "update-branch returned {}",
                response.status()
            )));
        }

        // The update is async host-side; re-read the PR for the new head
        let pr = self
            .client
            .pulls(&self.owner, &self.repo)
            .get(pr_id)
            .await?;
        debug!(pr_id, head = %pr.head.sha, "branch updated");
        Ok(pr.head.sha)
    }

    async fn is_mergeable(&self, pr_id: PrId) -> Result<Option<bool>> {
        let pr = self
            .client
            .pulls(&self.owner, &self.repo)
            .get(pr_id)
            .await?;
        Ok(pr.mergeable)
    }

    async fn merge_pr(&self, pr_id: PrId, method: MergeMethod) -> Result<MergeOutcome> {
        debug!(pr_id, %method, "merging PR");

        let octocrab_method = match method {
            MergeMethod::Squash => octocrab::params::pulls::MergeMethod::Squash,
            MergeMethod::Merge => octocrab::params::pulls::MergeMethod::Merge,
            MergeMethod::Rebase => octocrab::params::pulls::MergeMethod::Rebase,
        };

        let result = self
            .client
            .pulls(&self.owner, &self.repo)
            .merge(pr_id)
            .method(octocrab_method)
            .send()
            .await
            .map_err(|e| Error::HostApi(format!("Merge failed: {e}")))?;

        let outcome = MergeOutcome {
            merged: result.merged,
            sha: result.sha,
            message: result.message,
        };

        debug!(
            pr_id,
            merged = outcome.merged,
            sha = ?outcome.sha,
            "merge complete"
        );
        Ok(outcome)
    }

    async fn branch_head(&self, branch: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Commit {
            sha: String,
        }

        let commit: Commit = self
            .get_json(&self.api_url(&format!("commits/{branch}")))
            .await?;
        Ok(commit.sha)
    }
}
