//! Event normalization: webhook-shaped JSON → [`PullRequestSnapshot`].
//!
//! The engine consumes relay-enriched webhook payloads: the delivery relay
//! folds the `X-GitHub-Event` header into an `event` field and embeds the
//! full PR view (labels, approvals, check runs, touched files) under
//! `pull_request`. Normalization is a pure transform with no side effects.
//!
//! Unsupported event types are dropped with a logged no-op rather than an
//! error, so new event types the host adds never break the engine.

use crate::error::{Error, Result};
use crate::types::{CheckStatus, DiffStats, PrId, PullRequestSnapshot};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Event types the normalizer understands
const SUPPORTED_EVENTS: [&str; 3] = ["pull_request", "pull_request_review", "check_run"];

/// A normalized inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A fresh view of a PR; supersedes any prior snapshot for the same id
    Snapshot(PullRequestSnapshot),
    /// The PR was closed or withdrawn; tracking must be torn down eagerly
    Withdrawn {
        /// PR number
        pr_id: PrId,
    },
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    pull_request: Option<WirePullRequest>,
}

#[derive(Deserialize)]
struct WirePullRequest {
    number: PrId,
    head: WireRef,
    base: WireRef,
    #[serde(default)]
    labels: Vec<WireLabel>,
    user: WireUser,
    #[serde(default)]
    approvals: u32,
    #[serde(default)]
    conversations_resolved: bool,
    #[serde(default)]
    check_runs: Vec<WireCheckRun>,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    #[serde(default)]
    changed_files: u64,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Deserialize)]
struct WireRef {
    sha: String,
}

#[derive(Deserialize)]
struct WireLabel {
    name: String,
}

#[derive(Deserialize)]
struct WireUser {
    login: String,
}

#[derive(Deserialize)]
struct WireCheckRun {
    name: String,
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
}

impl WireCheckRun {
    /// GitHub's status/conclusion pair folded into one status.
    ///
    /// Same mapping the host probe uses: in-progress runs are pending,
    /// success and neutral pass, skipped is its own state, anything else
    /// (failure, cancelled, timed out, missing conclusion) fails.
    fn check_status(&self) -> CheckStatus {
        if self.status != "completed" {
            return CheckStatus::Pending;
        }
        match self.conclusion.as_deref() {
            Some("success" | "neutral") => CheckStatus::Pass,
            Some("skipped") => CheckStatus::Skipped,
            _ => CheckStatus::Fail,
        }
    }
}

/// Distinct first path components of the touched files, as prefixes.
///
/// `docs/guide.md` contributes `docs/`; a root-level file contributes its
/// own name so tier prefix rules can still reason about it.
#[must_use]
pub fn path_prefixes(files: &[String]) -> Vec<String> {
    let mut prefixes: Vec<String> = Vec::new();
    for file in files {
        let prefix = file
            .split_once('/')
            .map_or_else(|| file.clone(), |(first, _)| format!("{first}/"));
        if !prefixes.contains(&prefix) {
            prefixes.push(prefix);
        }
    }
    prefixes
}

/// Normalize a raw webhook-shaped payload.
///
/// Returns `Ok(None)` for unsupported event types (dropped, logged),
/// `Err(MalformedEvent)` when a supported event cannot be parsed.
pub fn normalize(raw: &serde_json::Value) -> Result<Option<InboundEvent>> {
    let envelope: Envelope = serde_json::from_value(raw.clone())
        .map_err(|e| Error::MalformedEvent(format!("unparseable envelope: {e}")))?;

    if !SUPPORTED_EVENTS.contains(&envelope.event.as_str()) {
        debug!(event = %envelope.event, "dropping unsupported event type");
        return Ok(None);
    }

    let pr = envelope.pull_request.ok_or_else(|| {
        Error::MalformedEvent(format!(
            "'{}' event is missing the pull_request object",
            envelope.event
        ))
    })?;

    if envelope.event == "pull_request"
        && envelope.action.as_deref() == Some("closed")
    {
        debug!(pr_id = pr.number, "PR closed, withdrawing");
        return Ok(Some(InboundEvent::Withdrawn { pr_id: pr.number }));
    }

    let checks: BTreeMap<String, CheckStatus> = pr
        .check_runs
        .iter()
        .map(|run| (run.name.clone(), run.check_status()))
        .collect();

    let snapshot = PullRequestSnapshot {
        id: pr.number,
        head_commit: pr.head.sha,
        base_commit: pr.base.sha,
        labels: pr.labels.into_iter().map(|l| l.name).collect(),
        approvals: pr.approvals,
        checks,
        diff: DiffStats {
            files_changed: pr.changed_files,
            lines_changed: pr.additions + pr.deletions,
            path_prefixes: path_prefixes(&pr.files),
        },
        author: pr.user.login,
        conversations_resolved: pr.conversations_resolved,
        received_at: Utc::now(),
    };

    debug!(
        pr_id = snapshot.id,
        head = %snapshot.head_commit,
        action = ?envelope.action,
        "normalized event"
    );
    Ok(Some(InboundEvent::Snapshot(snapshot)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pr_payload() -> serde_json::Value {
        json!({
            "event": "pull_request",
            "action": "synchronize",
            "pull_request": {
                "number": 42,
                "head": { "sha": "a".repeat(40) },
                "base": { "sha": "b".repeat(40) },
                "labels": [{ "name": "claude-auto" }],
                "user": { "login": "claude[bot]" },
                "approvals": 1,
                "conversations_resolved": true,
                "check_runs": [
                    { "name": "ci", "status": "completed", "conclusion": "success" },
                    { "name": "lint", "status": "in_progress" }
                ],
                "additions": 300,
                "deletions": 180,
                "changed_files": 4,
                "files": ["src/lib.rs", "src/queue.rs", "docs/notes.md", "README.md"]
            }
        })
    }

    #[test]
    fn normalizes_pull_request_event() {
        let event = normalize(&pr_payload()).unwrap().unwrap();
        let InboundEvent::Snapshot(snap) = event else {
            panic!("expected snapshot");
        };
        assert_eq!(snap.id, 42);
        assert_eq!(snap.approvals, 1);
        assert!(snap.labels.contains("claude-auto"));
        assert_eq!(snap.checks["ci"], CheckStatus::Pass);
        assert_eq!(snap.checks["lint"], CheckStatus::Pending);
        assert_eq!(snap.diff.lines_changed, 480);
        assert_eq!(
            snap.diff.path_prefixes,
            vec!["src/".to_string(), "docs/".to_string(), "README.md".to_string()]
        );
    }

    #[test]
    fn unsupported_event_is_dropped_not_an_error() {
        let payload = json!({ "event": "deployment_status", "action": "created" });
        assert_eq!(normalize(&payload).unwrap(), None);
    }

    #[test]
    fn closed_action_becomes_withdrawal() {
        let mut payload = pr_payload();
        payload["action"] = json!("closed");
        let event = normalize(&payload).unwrap().unwrap();
        assert_eq!(event, InboundEvent::Withdrawn { pr_id: 42 });
    }

    #[test]
    fn supported_event_without_pr_is_malformed() {
        let payload = json!({ "event": "check_run", "action": "completed" });
        let err = normalize(&payload).unwrap_err();
        assert!(matches!(err, Error::MalformedEvent(_)));
    }

    #[test]
    fn garbage_envelope_is_malformed() {
        let payload = json!({ "event": ["not", "a", "string"] });
        let err = normalize(&payload).unwrap_err();
        assert!(matches!(err, Error::MalformedEvent(_)));
    }

    #[test]
    fn check_run_conclusions_map_to_statuses() {
        let run = |status: &str, conclusion: Option<&str>| WireCheckRun {
            name: "ci".into(),
            status: status.into(),
            conclusion: conclusion.map(ToString::to_string),
        };
        assert_eq!(run("queued", None).check_status(), CheckStatus::Pending);
        assert_eq!(
            run("completed", Some("success")).check_status(),
            CheckStatus::Pass
        );
        assert_eq!(
            run("completed", Some("neutral")).check_status(),
            CheckStatus::Pass
        );
        assert_eq!(
            run("completed", Some("skipped")).check_status(),
            CheckStatus::Skipped
        );
        assert_eq!(
            run("completed", Some("failure")).check_status(),
            CheckStatus::Fail
        );
        assert_eq!(run("completed", None).check_status(), CheckStatus::Fail);
    }

    #[test]
    fn path_prefixes_deduplicate_in_order() {
        let files = vec![
            "src/a.rs".to_string(),
            "src/b.rs".to_string(),
            "Cargo.toml".to_string(),
        ];
        assert_eq!(
            path_prefixes(&files),
            vec!["src/".to_string(), "Cargo.toml".to_string()]
        );
    }
}
