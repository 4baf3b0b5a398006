//! Mock host service for testing
//!
//! These are test utilities - not all may be used in current tests but are
//! available for future test development.

#![allow(dead_code)]

use async_trait::async_trait;
use autoland::error::{Error, Result};
use autoland::platform::HostService;
use autoland::types::{MergeMethod, MergeOutcome, PrId, PullRequestSnapshot};
use std::collections::HashMap;
use std::sync::Mutex;

/// Call record for `comment`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentCall {
    pub pr_id: PrId,
    pub body: String,
}

/// Call record for `merge_pr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCall {
    pub pr_id: PrId,
    pub method: MergeMethod,
}

/// Simple mock host service for testing
///
/// This manually implements `HostService` rather than using a mocking crate,
/// so response maps and call records stay plain data.
///
/// Features:
/// - Per-PR snapshot responses that tests mutate as the "live" PR changes
/// - Call tracking for verification
/// - Error injection for failure path testing
pub struct MockHost {
    snapshots: Mutex<HashMap<PrId, PullRequestSnapshot>>,
    mergeable: Mutex<HashMap<PrId, Option<bool>>>,
    /// Head SHA `update_branch` rebases to, per PR (defaults to current head)
    rebase_heads: Mutex<HashMap<PrId, String>>,
    integration_head: Mutex<String>,
    // Call tracking
    fetch_calls: Mutex<Vec<PrId>>,
    approve_calls: Mutex<Vec<PrId>>,
    comment_calls: Mutex<Vec<CommentCall>>,
    update_branch_calls: Mutex<Vec<PrId>>,
    merge_calls: Mutex<Vec<MergeCall>>,
    // Error injection
    conflict_on_update: Mutex<HashMap<PrId, String>>,
    merge_failures_remaining: Mutex<HashMap<PrId, u32>>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    /// Create an empty mock
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
            mergeable: Mutex::new(HashMap::new()),
            rebase_heads: Mutex::new(HashMap::new()),
            integration_head: Mutex::new("main-head".to_string()),
            fetch_calls: Mutex::new(Vec::new()),
            approve_calls: Mutex::new(Vec::new()),
            comment_calls: Mutex::new(Vec::new()),
            update_branch_calls: Mutex::new(Vec::new()),
            merge_calls: Mutex::new(Vec::new()),
            conflict_on_update: Mutex::new(HashMap::new()),
            merge_failures_remaining: Mutex::new(HashMap::new()),
        }
    }

    // === Response configuration ===

    /// Set (or replace) the live snapshot a PR resolves to
    pub fn set_snapshot(&self, snapshot: PullRequestSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.id, snapshot);
    }

    /// Mutate the live snapshot for a PR in place
    pub fn update_snapshot(&self, pr_id: PrId, f: impl FnOnce(&mut PullRequestSnapshot)) {
        let mut snapshots = self.snapshots.lock().unwrap();
        if let Some(snapshot) = snapshots.get_mut(&pr_id) {
            f(snapshot);
        }
    }

    /// Forget the snapshot for a PR, making `fetch_snapshot` fail
    pub fn clear_snapshot(&self, pr_id: PrId) {
        self.snapshots.lock().unwrap().remove(&pr_id);
    }

    /// Set the mergeability the host reports for a PR
    pub fn set_mergeable(&self, pr_id: PrId, mergeable: Option<bool>) {
        self.mergeable.lock().unwrap().insert(pr_id, mergeable);
    }

    /// Make `update_branch` move the PR to this head SHA
    pub fn set_rebase_head(&self, pr_id: PrId, head: &str) {
        self.rebase_heads
            .lock()
            .unwrap()
            .insert(pr_id, head.to_string());
    }

    // === Error injection ===

    /// Make `update_branch` fail with a merge conflict for this PR
    pub fn conflict_on_update(&self, pr_id: PrId, msg: &str) {
        self.conflict_on_update
            .lock()
            .unwrap()
            .insert(pr_id, msg.to_string());
    }

    /// Make the next `count` `merge_pr` calls for this PR fail
    pub fn fail_merges(&self, pr_id: PrId, count: u32) {
        self.merge_failures_remaining
            .lock()
            .unwrap()
            .insert(pr_id, count);
    }

    // === Call verification ===

    /// PRs `fetch_snapshot` was called for, in order
    pub fn fetch_calls(&self) -> Vec<PrId> {
        self.fetch_calls.lock().unwrap().clone()
    }

    /// PRs `approve_pr` was called for, in order
    pub fn approve_calls(&self) -> Vec<PrId> {
        self.approve_calls.lock().unwrap().clone()
    }

    /// All status comments posted, in order
    pub fn comment_calls(&self) -> Vec<CommentCall> {
        self.comment_calls.lock().unwrap().clone()
    }

    /// PRs `update_branch` was called for, in order
    pub fn update_branch_calls(&self) -> Vec<PrId> {
        self.update_branch_calls.lock().unwrap().clone()
    }

    /// All merge calls, in order
    pub fn merge_calls(&self) -> Vec<MergeCall> {
        self.merge_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostService for MockHost {
    async fn fetch_snapshot(&self, pr_id: PrId) -> Result<PullRequestSnapshot> {
        self.fetch_calls.lock().unwrap().push(pr_id);
        self.snapshots
            .lock()
            .unwrap()
            .get(&pr_id)
            .cloned()
            .ok_or_else(|| Error::HostApi(format!("no snapshot configured for PR #{pr_id}")))
    }

    async fn approve_pr(&self, pr_id: PrId) -> Result<()> {
        self.approve_calls.lock().unwrap().push(pr_id);
        Ok(())
    }

    async fn comment(&self, pr_id: PrId, body: &str) -> Result<()> {
        self.comment_calls.lock().unwrap().push(CommentCall {
            pr_id,
            body: body.to_string(),
        });
        Ok(())
    }

    async fn update_branch(&self, pr_id: PrId) -> Result<String> {
        self.update_branch_calls.lock().unwrap().push(pr_id);

        if let Some(msg) = self.conflict_on_update.lock().unwrap().get(&pr_id) {
            return Err(Error::MergeConflict(msg.clone()));
        }

        let mut snapshots = self.snapshots.lock().unwrap();
        let snapshot = snapshots
            .get_mut(&pr_id)
            .ok_or_else(|| Error::HostApi(format!("no snapshot configured for PR #{pr_id}")))?;

        // Rebase moves the head only when the test configured a new SHA
        if let Some(head) = self.rebase_heads.lock().unwrap().get(&pr_id) {
            snapshot.head_commit.clone_from(head);
        }
        Ok(snapshot.head_commit.clone())
    }

    async fn is_mergeable(&self, pr_id: PrId) -> Result<Option<bool>> {
        Ok(self
            .mergeable
            .lock()
            .unwrap()
            .get(&pr_id)
            .copied()
            .unwrap_or(Some(true)))
    }

    async fn merge_pr(&self, pr_id: PrId, method: MergeMethod) -> Result<MergeOutcome> {
        self.merge_calls.lock().unwrap().push(MergeCall { pr_id, method });

        let mut failures = self.merge_failures_remaining.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&pr_id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::HostApi("simulated merge failure".to_string()));
        }
        drop(failures);

        let sha = format!("merged-{pr_id}");
        *self.integration_head.lock().unwrap() = sha.clone();
        Ok(MergeOutcome {
            merged: true,
            sha: Some(sha),
            message: None,
        })
    }

    async fn branch_head(&self, _branch: &str) -> Result<String> {
        Ok(self.integration_head.lock().unwrap().clone())
    }
}
