//! Policy tiers and classification.
//!
//! Classification is pure: it takes a snapshot and the ordered tier list and
//! produces a tier assignment (or a block). No I/O happens here, so the whole
//! policy surface is unit-testable without a host.

use crate::error::{Error, Result};
use crate::types::{MergeMethod, PullRequestSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Tier id used for the synthetic fallback tier
pub const MANUAL_REVIEW_TIER: &str = "manual-review";

/// Predicate deciding whether a tier claims a snapshot.
///
/// A closed set of variants rather than arbitrary code, so tier definitions
/// stay declarative and serializable in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum MatchRule {
    /// PR carries this label
    HasLabel {
        /// Label name
        label: String,
    },
    /// PR author login matches this regex (anchored match)
    AuthorMatches {
        /// Regex pattern over the author login
        pattern: String,
    },
    /// Every touched path falls under this prefix
    PathsUnder {
        /// Path prefix (e.g. "docs/")
        prefix: String,
    },
    /// Diff is at most this many changed lines
    MaxDiffLines {
        /// Upper bound on added + removed lines
        max: u64,
    },
    /// Always matches (for catch-all tiers)
    Always,
}

impl MatchRule {
    /// Evaluate this rule against a snapshot.
    ///
    /// Invalid regexes evaluate to false; config validation rejects them
    /// before the engine ever runs.
    #[must_use]
    pub fn matches(&self, snapshot: &PullRequestSnapshot) -> bool {
        match self {
            Self::HasLabel { label } => snapshot.labels.contains(label),
            Self::AuthorMatches { pattern } => regex::Regex::new(&format!("^(?:{pattern})$"))
                .map(|re| re.is_match(&snapshot.author))
                .unwrap_or(false),
            Self::PathsUnder { prefix } => {
                !snapshot.diff.path_prefixes.is_empty()
                    && snapshot
                        .diff
                        .path_prefixes
                        .iter()
                        .all(|p| p.starts_with(prefix.as_str()))
            }
            Self::MaxDiffLines { max } => snapshot.diff.lines_changed <= *max,
            Self::Always => true,
        }
    }
}

/// A pre-merge gate evaluated through one uniform interface.
///
/// New gate kinds can be added here without touching the decision engine's
/// core loop; both eligibility evaluation and the safeguard validator walk
/// the same list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRule {
    /// A label that unconditionally halts the merge path
    BlockingLabel {
        /// Label name
        label: String,
    },
    /// Diff size ceiling
    DiffSize {
        /// Upper bound on changed lines
        max_lines: u64,
    },
    /// Minimum approving reviews
    ApprovalCount {
        /// Required approvals
        min: u32,
    },
}

impl GateRule {
    /// Evaluate the gate. `Err` carries a human-readable violation.
    pub fn evaluate(&self, snapshot: &PullRequestSnapshot) -> std::result::Result<(), String> {
        match self {
            Self::BlockingLabel { label } => {
                if snapshot.labels.contains(label) {
                    Err(format!("blocking label '{label}' present"))
                } else {
                    Ok(())
                }
            }
            Self::DiffSize { max_lines } => {
                if snapshot.diff.lines_changed > *max_lines {
                    Err(format!(
                        "diff of {} lines exceeds tier limit of {max_lines}",
                        snapshot.diff.lines_changed
                    ))
                } else {
                    Ok(())
                }
            }
            Self::ApprovalCount { min } => {
                if snapshot.approvals < *min {
                    Err(format!(
                        "{} approval(s), {min} required",
                        snapshot.approvals
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// A named policy bucket with its own approval/soak/blocking rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    /// Tier id (unique)
    pub id: String,
    /// Position in the total evaluation order; lower evaluates (and drains) first
    pub priority: u32,
    /// Rules that must all match for this tier to claim a PR
    pub match_rules: Vec<MatchRule>,
    /// Approvals required before eligibility
    pub required_approvals: u32,
    /// Soak delay in seconds (0 = queue immediately)
    pub soak_secs: u64,
    /// Labels that block this tier (in addition to the global set)
    #[serde(default)]
    pub blocking_labels: BTreeSet<String>,
    /// Diff ceiling; a larger diff falls through to the next tier
    #[serde(default)]
    pub max_diff_lines: Option<u64>,
    /// How the host should merge PRs in this tier
    pub merge_method: MergeMethod,
    /// Check names that must pass
    #[serde(default)]
    pub required_checks: Vec<String>,
    /// Whether a skipped check counts as passing
    #[serde(default)]
    pub allow_skipped_checks: bool,
    /// Whether the queue waits for the full check set to pass again on the
    /// rebased head (false = trust the pre-rebase check results)
    #[serde(default)]
    pub full_recheck: bool,
}

impl Tier {
    /// The synthetic fallback tier for PRs no configured tier claims:
    /// zero soak, one approval, always routed to humans.
    #[must_use]
    pub fn manual_review() -> Self {
        Self {
            id: MANUAL_REVIEW_TIER.to_string(),
            priority: u32::MAX,
            match_rules: vec![MatchRule::Always],
            required_approvals: 1,
            soak_secs: 0,
            blocking_labels: BTreeSet::new(),
            max_diff_lines: None,
            merge_method: MergeMethod::Merge,
            required_checks: Vec::new(),
            allow_skipped_checks: false,
            full_recheck: true,
        }
    }

    /// Whether this is the synthetic fallback tier
    #[must_use]
    pub fn is_manual_review(&self) -> bool {
        self.id == MANUAL_REVIEW_TIER
    }

    /// Soak delay as a `Duration`
    #[must_use]
    pub const fn soak(&self) -> Duration {
        Duration::from_secs(self.soak_secs)
    }

    /// Whether every match rule claims this snapshot, including the diff ceiling
    #[must_use]
    pub fn matches(&self, snapshot: &PullRequestSnapshot) -> bool {
        let within_ceiling = self
            .max_diff_lines
            .is_none_or(|max| snapshot.diff.lines_changed <= max);
        within_ceiling && self.match_rules.iter().all(|r| r.matches(snapshot))
    }

    /// Gates a snapshot must clear before merging under this tier
    #[must_use]
    pub fn gates(&self) -> Vec<GateRule> {
        let mut gates: Vec<GateRule> = self
            .blocking_labels
            .iter()
            .map(|label| GateRule::BlockingLabel {
                label: label.clone(),
            })
            .collect();
        if let Some(max_lines) = self.max_diff_lines {
            gates.push(GateRule::DiffSize { max_lines });
        }
        gates.push(GateRule::ApprovalCount {
            min: self.required_approvals,
        });
        gates
    }
}

/// Result of classifying a snapshot
#[derive(Debug, Clone)]
pub struct Classification {
    /// The winning tier (synthetic manual-review tier if none matched)
    pub tier: Tier,
    /// Whether a blocking label short-circuited classification
    pub blocked: bool,
    /// Reason when blocked
    pub block_reason: Option<String>,
}

/// The ordered tier list plus the global blocking-label set
#[derive(Debug, Clone)]
pub struct PolicySet {
    tiers: Vec<Tier>,
    global_blocking: BTreeSet<String>,
}

impl PolicySet {
    /// Build a policy set, validating the total tier ordering.
    ///
    /// Duplicate priorities or tier ids, and invalid author regexes, are
    /// configuration bugs surfaced as [`Error::Classification`].
    pub fn new(mut tiers: Vec<Tier>, global_blocking: BTreeSet<String>) -> Result<Self> {
        let mut seen_ids = BTreeSet::new();
        let mut seen_priorities = BTreeSet::new();
        for tier in &tiers {
            if !seen_ids.insert(tier.id.clone()) {
                return Err(Error::Classification(format!(
                    "duplicate tier id '{}'",
                    tier.id
                )));
            }
            if !seen_priorities.insert(tier.priority) {
                return Err(Error::Classification(format!(
                    "tiers must have a total priority order; priority {} is duplicated",
                    tier.priority
                )));
            }
            for rule in &tier.match_rules {
                if let MatchRule::AuthorMatches { pattern } = rule {
                    regex::Regex::new(pattern).map_err(|e| {
                        Error::Classification(format!(
                            "tier '{}' has invalid author pattern: {e}",
                            tier.id
                        ))
                    })?;
                }
            }
        }
        tiers.sort_by_key(|t| t.priority);
        Ok(Self {
            tiers,
            global_blocking,
        })
    }

    /// Tiers in priority order
    #[must_use]
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Global blocking labels
    #[must_use]
    pub const fn global_blocking(&self) -> &BTreeSet<String> {
        &self.global_blocking
    }

    /// Look up a tier by id; falls back to the synthetic manual-review tier
    #[must_use]
    pub fn resolve(&self, tier_id: &str) -> Tier {
        self.tiers
            .iter()
            .find(|t| t.id == tier_id)
            .cloned()
            .unwrap_or_else(Tier::manual_review)
    }

    /// Classify a snapshot into exactly one tier.
    ///
    /// Blocking labels are checked before tier matching, never after: a PR
    /// carrying one resolves to `blocked` regardless of which tier would
    /// otherwise claim it. Otherwise the first matching tier in priority
    /// order wins; with no match, the synthetic manual-review tier applies.
    #[must_use]
    pub fn classify(&self, snapshot: &PullRequestSnapshot) -> Classification {
        let mut blocking = self.global_blocking.clone();
        for tier in &self.tiers {
            blocking.extend(tier.blocking_labels.iter().cloned());
        }
        if let Some(label) = snapshot.blocking_label(&blocking) {
            return Classification {
                tier: self.tier_for(snapshot),
                blocked: true,
                block_reason: Some(format!("blocking label '{label}' present")),
            };
        }

        Classification {
            tier: self.tier_for(snapshot),
            blocked: false,
            block_reason: None,
        }
    }

    /// First matching tier in priority order (first-match wins, deterministic)
    fn tier_for(&self, snapshot: &PullRequestSnapshot) -> Tier {
        self.tiers
            .iter()
            .find(|t| t.matches(snapshot))
            .cloned()
            .unwrap_or_else(Tier::manual_review)
    }
}
