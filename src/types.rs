//! Core types for autoland

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Pull request identifier (the host's PR number)
pub type PrId = u64;

/// Status of a single required check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Check completed successfully
    Pass,
    /// Check completed with a failure
    Fail,
    /// Check has not completed yet
    Pending,
    /// Check was skipped (counts as passing only if the tier allows it)
    Skipped,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Pending => write!(f, "pending"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Shape of a PR's diff, used by tier match rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    /// Number of files touched
    pub files_changed: u64,
    /// Total added + removed lines
    pub lines_changed: u64,
    /// Distinct path prefixes touched (e.g. "docs/", "src/")
    pub path_prefixes: Vec<String>,
}

/// Immutable per-event view of a pull request.
///
/// Created by the event normalizer on every inbound event and never mutated;
/// a newer snapshot for the same `id` supersedes the prior one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestSnapshot {
    /// PR number
    pub id: PrId,
    /// Head commit SHA
    pub head_commit: String,
    /// Base commit SHA (integration branch head the PR was based on)
    pub base_commit: String,
    /// Labels currently on the PR
    pub labels: BTreeSet<String>,
    /// Number of approving reviews
    pub approvals: u32,
    /// Status per check name
    pub checks: BTreeMap<String, CheckStatus>,
    /// Diff shape
    pub diff: DiffStats,
    /// Author login
    pub author: String,
    /// Whether all review conversations are resolved
    pub conversations_resolved: bool,
    /// When the snapshot was taken
    pub received_at: DateTime<Utc>,
}

impl PullRequestSnapshot {
    /// Check whether every named check reports a passing status.
    ///
    /// A check missing from the map counts as `Pending`. `Skipped` passes
    /// only when `allow_skipped` is set.
    #[must_use]
    pub fn checks_passed(&self, required: &[String], allow_skipped: bool) -> bool {
        required.iter().all(|name| match self.checks.get(name) {
            Some(CheckStatus::Pass) => true,
            Some(CheckStatus::Skipped) => allow_skipped,
            _ => false,
        })
    }

    /// Whether any named check has definitively failed
    #[must_use]
    pub fn any_check_failed(&self, required: &[String]) -> bool {
        required
            .iter()
            .any(|name| matches!(self.checks.get(name), Some(CheckStatus::Fail)))
    }

    /// First label from `blocking` present on this PR, if any
    #[must_use]
    pub fn blocking_label<'a>(&self, blocking: &'a BTreeSet<String>) -> Option<&'a str> {
        blocking
            .iter()
            .find(|l| self.labels.contains(l.as_str()))
            .map(String::as_str)
    }
}

/// Merge strategy/method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    /// Squash all commits into one
    Squash,
    /// Create a merge commit
    Merge,
    /// Rebase commits onto base branch
    Rebase,
}

impl std::fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Squash => write!(f, "squash"),
            Self::Merge => write!(f, "merge"),
            Self::Rebase => write!(f, "rebase"),
        }
    }
}

/// Lifecycle phase of a PR in the decision engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrPhase {
    /// Waiting for checks/approvals/conversations
    PendingChecks,
    /// All gates satisfied, not yet soaking or queued
    Eligible,
    /// Held in a soak delay
    Soaking,
    /// Admitted to the merge queue (may still be waiting its turn)
    Queued,
    /// Past queue admission, inside the rebase/check/merge critical section
    Merging,
    /// Terminal: merged into the integration branch
    Merged,
    /// Halted by a blocking label or a failed required check
    Blocked,
    /// Terminal: withdrawn or permanently failed
    Failed,
}

impl PrPhase {
    /// Whether this phase is terminal (no further transitions)
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Failed)
    }
}

impl std::fmt::Display for PrPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PendingChecks => "pending_checks",
            Self::Eligible => "eligible",
            Self::Soaking => "soaking",
            Self::Queued => "queued",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// State of a merge queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePhase {
    /// Waiting for the admission slot
    Waiting,
    /// Branch is being rebased onto the integration branch head
    Rebasing,
    /// Checks re-running against the rebased commit
    Checking,
    /// Merge call in flight
    Merging,
    /// Terminal: merged
    Merged,
    /// Terminal: failed
    Failed,
}

impl QueuePhase {
    /// Whether this entry holds the global admission slot
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Rebasing | Self::Checking | Self::Merging)
    }
}

/// An entry in the merge queue.
///
/// Owned exclusively by the sequencer: created on admission, destroyed on a
/// terminal state or when a new push invalidates `head_commit_at_enqueue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeQueueEntry {
    /// PR number
    pub pr_id: PrId,
    /// Tier the PR was classified into at enqueue time
    pub tier_id: String,
    /// When the entry was admitted
    pub enqueued_at: DateTime<Utc>,
    /// Head commit at enqueue time; a different live head withdraws the entry
    pub head_commit_at_enqueue: String,
    /// Merge attempts so far
    pub attempts: u32,
    /// Current state
    pub state: QueuePhase,
}

/// A scheduled soak delay for a PR.
///
/// The `epoch` is the cancellation token: cancelling bumps the PR's epoch,
/// so a fire carrying a stale epoch loses deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoakTimer {
    /// PR number
    pub pr_id: PrId,
    /// Tier whose soak duration applies
    pub tier_id: String,
    /// When the soak began
    pub started_at: DateTime<Utc>,
    /// When the timer fires
    pub fire_at: DateTime<Utc>,
    /// Cancellation epoch at schedule time
    pub epoch: u64,
}

/// Who caused a state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "login")]
pub enum Actor {
    /// The engine itself
    System,
    /// A human, identified by login
    Human(String),
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Human(login) => write!(f, "human:{login}"),
        }
    }
}

/// One append-only audit record; never mutated or deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
    /// PR number
    pub pr_id: PrId,
    /// Phase before the transition
    pub from: PrPhase,
    /// Phase after the transition
    pub to: PrPhase,
    /// Human-readable reason
    pub reason: String,
    /// Who caused it
    pub actor: Actor,
}

/// Result of a merge call against the host
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Whether the merge landed
    pub merged: bool,
    /// SHA of the merge commit (if successful)
    pub sha: Option<String>,
    /// Message from the host (especially on failure)
    pub message: Option<String>,
}
