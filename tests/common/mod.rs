//! Shared test fixtures

#![allow(dead_code)]

pub mod mock_platform;

pub use mock_platform::MockHost;

use autoland::config::EngineConfig;
use autoland::policy::{MatchRule, Tier};
use autoland::types::{CheckStatus, DiffStats, PrId, PullRequestSnapshot};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// A fully eligible snapshot for the given labels and approvals, with a
/// passing `ci` check and a small diff
pub fn make_snapshot(pr_id: PrId, labels: &[&str], approvals: u32) -> PullRequestSnapshot {
    let mut checks = BTreeMap::new();
    checks.insert("ci".to_string(), CheckStatus::Pass);
    PullRequestSnapshot {
        id: pr_id,
        head_commit: format!("head-{pr_id}"),
        base_commit: "base".to_string(),
        labels: labels.iter().map(ToString::to_string).collect(),
        approvals,
        checks,
        diff: DiffStats {
            files_changed: 2,
            lines_changed: 120,
            path_prefixes: vec!["src/".to_string()],
        },
        author: "claude[bot]".to_string(),
        conversations_resolved: true,
        received_at: Utc::now(),
    }
}

/// A docs tier with no soak and no required checks
pub fn docs_tier() -> Tier {
    Tier {
        id: "docs".to_string(),
        priority: 0,
        match_rules: vec![MatchRule::HasLabel {
            label: "docs-only".to_string(),
        }],
        required_approvals: 0,
        soak_secs: 0,
        blocking_labels: BTreeSet::new(),
        max_diff_lines: Some(2000),
        merge_method: autoland::types::MergeMethod::Squash,
        required_checks: vec![],
        allow_skipped_checks: true,
        full_recheck: false,
    }
}

/// An AI tier with a soak delay, one required approval, and a required check
pub fn ai_tier(soak_secs: u64) -> Tier {
    Tier {
        id: "ai-generated".to_string(),
        priority: 1,
        match_rules: vec![MatchRule::HasLabel {
            label: "claude-auto".to_string(),
        }],
        required_approvals: 1,
        soak_secs,
        blocking_labels: BTreeSet::new(),
        max_diff_lines: Some(500),
        merge_method: autoland::types::MergeMethod::Squash,
        required_checks: vec!["ci".to_string()],
        allow_skipped_checks: false,
        full_recheck: true,
    }
}

/// Engine configuration rooted in `state_dir`, with the two standard tiers
/// (the AI tier's soak set to `ai_soak_secs`)
pub fn test_config(state_dir: &Path, ai_soak_secs: u64) -> EngineConfig {
    EngineConfig {
        tiers: vec![docs_tier(), ai_tier(ai_soak_secs)],
        global_blocking_labels: ["do-not-merge", "wip", "breaking-change", "security"]
            .iter()
            .map(ToString::to_string)
            .collect(),
        max_attempts: 2,
        merge_timeout_secs: 30,
        max_admissions_per_tier: 3,
        integration_branch: "main".to_string(),
        state_dir: state_dir.to_path_buf(),
    }
}

/// Wrap a snapshot in the wire envelope `normalize` consumes
pub fn envelope(snapshot: &PullRequestSnapshot, action: &str) -> serde_json::Value {
    let check_runs: Vec<serde_json::Value> = snapshot
        .checks
        .iter()
        .map(|(name, status)| {
            let (wire_status, conclusion) = match status {
                CheckStatus::Pass => ("completed", Some("success")),
                CheckStatus::Fail => ("completed", Some("failure")),
                CheckStatus::Skipped => ("completed", Some("skipped")),
                CheckStatus::Pending => ("in_progress", None),
            };
            serde_json::json!({ "name": name, "status": wire_status, "conclusion": conclusion })
        })
        .collect();

    serde_json::json!({
        "event": "pull_request",
        "action": action,
        "pull_request": {
            "number": snapshot.id,
            "head": { "sha": snapshot.head_commit },
            "base": { "sha": snapshot.base_commit },
            "labels": snapshot.labels.iter()
                .map(|l| serde_json::json!({ "name": l }))
                .collect::<Vec<_>>(),
            "user": { "login": snapshot.author },
            "approvals": snapshot.approvals,
            "conversations_resolved": snapshot.conversations_resolved,
            "check_runs": check_runs,
            "additions": snapshot.diff.lines_changed,
            "deletions": 0,
            "changed_files": snapshot.diff.files_changed,
            "files": snapshot.diff.path_prefixes.iter()
                .map(|p| format!("{p}file.rs"))
                .collect::<Vec<_>>(),
        }
    })
}
