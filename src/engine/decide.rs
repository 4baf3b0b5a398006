//! Pure transition logic for the decision engine.
//!
//! No I/O happens here: given the PR's current phase, the prior head commit,
//! and a fresh classification, `decide` produces the action the effectful
//! layer should take. This keeps the whole state machine unit-testable
//! without a host, and makes re-evaluation idempotent by construction:
//! replaying an identical snapshot yields [`Decision::Hold`].

use crate::policy::Classification;
use crate::types::{PrPhase, PullRequestSnapshot};
use std::time::Duration;

/// Action produced by one re-evaluation of a PR
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Halt the auto-merge path; cancel any timer or queue entry
    Block {
        /// Human-readable cause
        reason: String,
    },
    /// Keep waiting in `PendingChecks`
    AwaitChecks {
        /// First unmet gate
        reason: String,
    },
    /// Enter the soak delay
    Soak {
        /// Tier soak duration
        duration: Duration,
    },
    /// Admit to the merge queue
    Queue,
    /// Drop the event: the PR is in a terminal phase
    Reject {
        /// Why the event is ignored
        reason: String,
    },
    /// New head commit while soaking or queued; force back to `PendingChecks`
    Invalidate {
        /// What changed
        reason: String,
    },
    /// No action; the PR is already where this snapshot puts it
    Hold,
}

/// Re-evaluate a PR against a fresh snapshot.
///
/// `prior_head` is the head commit of the snapshot the engine last acted on
/// (`None` for a PR seen for the first time). The same snapshot replayed
/// twice produces `Hold` the second time: no duplicate enqueue, no duplicate
/// timer.
#[must_use]
pub fn decide(
    phase: PrPhase,
    prior_head: Option<&str>,
    classification: &Classification,
    snapshot: &PullRequestSnapshot,
) -> Decision {
    if phase.is_terminal() {
        return Decision::Reject {
            reason: format!("PR is already {phase}"),
        };
    }

    // Blocking labels and failed checks halt from any non-terminal state.
    if classification.blocked {
        return match phase {
            PrPhase::Blocked => Decision::Hold,
            _ => Decision::Block {
                reason: classification
                    .block_reason
                    .clone()
                    .unwrap_or_else(|| "blocking label present".to_string()),
            },
        };
    }

    let tier = &classification.tier;
    if snapshot.any_check_failed(&tier.required_checks) {
        return match phase {
            PrPhase::Blocked => Decision::Hold,
            _ => Decision::Block {
                reason: "a required check failed".to_string(),
            },
        };
    }

    // A new commit while soaking or queued invalidates everything downstream
    // of classification. Re-review of the new code is mandatory.
    let head_changed = prior_head.is_some_and(|h| h != snapshot.head_commit);
    if head_changed && matches!(phase, PrPhase::Soaking | PrPhase::Queued | PrPhase::Merging) {
        return Decision::Invalidate {
            reason: format!("new head commit {}", snapshot.head_commit),
        };
    }

    // Leaving `Blocked` re-enters from the top; no shortcut back to the queue.
    if phase == PrPhase::Blocked {
        return Decision::AwaitChecks {
            reason: "block lifted; re-entering from pending checks".to_string(),
        };
    }

    // Eligibility gates, evaluated through the tier's uniform rule list.
    if let Some(violation) = first_unmet_gate(classification, snapshot) {
        return match phase {
            // Checks regressing to pending while soaking/queued is not a
            // *failure*, but eligibility is gone; fall back and re-enter.
            PrPhase::Soaking | PrPhase::Queued | PrPhase::Merging => Decision::Invalidate {
                reason: violation,
            },
            _ => Decision::AwaitChecks { reason: violation },
        };
    }

    // Eligible. Where it goes depends on the tier's soak and where it is.
    match phase {
        PrPhase::Soaking | PrPhase::Queued | PrPhase::Merging => Decision::Hold,
        PrPhase::PendingChecks | PrPhase::Eligible => {
            if tier.soak_secs > 0 {
                Decision::Soak {
                    duration: tier.soak(),
                }
            } else {
                Decision::Queue
            }
        }
        // Terminal and Blocked handled above
        PrPhase::Merged | PrPhase::Failed | PrPhase::Blocked => Decision::Hold,
    }
}

/// First eligibility gate the snapshot fails, if any
fn first_unmet_gate(
    classification: &Classification,
    snapshot: &PullRequestSnapshot,
) -> Option<String> {
    let tier = &classification.tier;

    if !snapshot.checks_passed(&tier.required_checks, tier.allow_skipped_checks) {
        return Some("required checks not passing".to_string());
    }
    for gate in tier.gates() {
        if let Err(violation) = gate.evaluate(snapshot) {
            return Some(violation);
        }
    }
    if !snapshot.conversations_resolved {
        return Some("unresolved review conversations".to_string());
    }
    None
}
