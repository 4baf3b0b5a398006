//! Final pre-merge gate.
//!
//! Runs immediately before the merge call, over live state re-fetched from
//! the host rather than the snapshot captured at queue admission. This
//! closes the time-of-check/time-of-use gap: a label added or an approval
//! dismissed while the PR sat in the queue aborts the merge here.

use crate::policy::Tier;
use crate::types::PullRequestSnapshot;
use std::collections::BTreeSet;

/// Outcome of the pre-merge re-validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeguardReport {
    /// Violations found; empty means the merge may proceed
    pub violations: Vec<String>,
}

impl SafeguardReport {
    /// Whether the merge may proceed
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Violations joined for a status comment
    #[must_use]
    pub fn summary(&self) -> String {
        self.violations.join("; ")
    }
}

/// Re-verify every merge precondition against live state.
///
/// Checks, in order: no blocking label (tier-level or global), the tier's
/// uniform gate list (diff size, approval count), conversations resolved,
/// and host-reported mergeability (`None` = still computing, treated as a
/// violation rather than a pass).
#[must_use]
pub fn validate(
    live: &PullRequestSnapshot,
    tier: &Tier,
    global_blocking: &BTreeSet<String>,
    mergeable: Option<bool>,
) -> SafeguardReport {
    let mut violations = Vec::new();

    if let Some(label) = live.blocking_label(global_blocking) {
        violations.push(format!("blocking label '{label}' present"));
    }

    for gate in tier.gates() {
        if let Err(violation) = gate.evaluate(live) {
            violations.push(violation);
        }
    }

    if !live.conversations_resolved {
        violations.push("unresolved review conversations".to_string());
    }

    match mergeable {
        Some(true) => {}
        Some(false) => violations.push("branch has merge conflicts".to_string()),
        None => violations.push("mergeability unknown (host still computing)".to_string()),
    }

    SafeguardReport { violations }
}
