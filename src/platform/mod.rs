//! Host platform services.
//!
//! Everything the engine asks of the hosting platform goes through one
//! trait, so tests can run against a scripted mock and the production
//! binary against GitHub.

mod github;

pub use github::GitHubHost;

use crate::error::Result;
use crate::types::{MergeMethod, MergeOutcome, PrId, PullRequestSnapshot};
use async_trait::async_trait;

/// Outbound interface to the hosting platform.
///
/// The engine only consumes signal (snapshots, mergeability, branch heads)
/// and issues the four outbound operations the merge path needs: approve,
/// comment, update-branch, and merge.
#[async_trait]
pub trait HostService: Send + Sync {
    /// Fetch the live state of a PR as a fresh snapshot.
    ///
    /// Used at soak fire and inside the queue's critical section, where
    /// decisions must not trust an inbound payload that may be stale.
    async fn fetch_snapshot(&self, pr_id: PrId) -> Result<PullRequestSnapshot>;

    /// Approve the PR on behalf of the engine (zero-approval tiers)
    async fn approve_pr(&self, pr_id: PrId) -> Result<()>;

    /// Post a status comment on the PR
    async fn comment(&self, pr_id: PrId, body: &str) -> Result<()>;

    /// Rebase/update the PR branch onto the current integration-branch head.
    ///
    /// Returns the new head commit SHA.
    async fn update_branch(&self, pr_id: PrId) -> Result<String>;

    /// Whether the PR can merge cleanly (`None` = host still computing)
    async fn is_mergeable(&self, pr_id: PrId) -> Result<Option<bool>>;

    /// Merge the PR with the given method
    async fn merge_pr(&self, pr_id: PrId, method: MergeMethod) -> Result<MergeOutcome>;

    /// Current head commit of a branch
    async fn branch_head(&self, branch: &str) -> Result<String>;
}
