//! Unit tests for autoland modules

mod common;

mod classification_test {
    use crate::common::{ai_tier, docs_tier, make_snapshot};
    use autoland::policy::{MatchRule, PolicySet, Tier};
    use autoland::types::MergeMethod;
    use std::collections::BTreeSet;

    fn policy() -> PolicySet {
        PolicySet::new(
            vec![docs_tier(), ai_tier(300)],
            ["do-not-merge", "security"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn unmatched_pr_falls_to_manual_review() {
        let snap = make_snapshot(1, &[], 0);
        let classification = policy().classify(&snap);
        assert!(classification.tier.is_manual_review());
        assert!(!classification.blocked);
    }

    #[test]
    fn oversized_diff_falls_through_the_tier() {
        // Carries the AI label but exceeds the tier's 500-line ceiling
        let mut snap = make_snapshot(2, &["claude-auto"], 1);
        snap.diff.lines_changed = 5_000;
        let classification = policy().classify(&snap);
        assert!(classification.tier.is_manual_review());
    }

    #[test]
    fn blocking_label_wins_over_any_tier_match() {
        let snap = make_snapshot(3, &["docs-only", "security"], 0);
        let classification = policy().classify(&snap);
        assert!(classification.blocked);
        assert!(classification.block_reason.unwrap().contains("security"));
    }

    #[test]
    fn author_pattern_tier_claims_bot_prs() {
        let bots = Tier {
            id: "bots".to_string(),
            priority: 2,
            match_rules: vec![MatchRule::AuthorMatches {
                pattern: r".*\[bot\]".to_string(),
            }],
            required_approvals: 0,
            soak_secs: 0,
            blocking_labels: BTreeSet::new(),
            max_diff_lines: None,
            merge_method: MergeMethod::Squash,
            required_checks: vec![],
            allow_skipped_checks: true,
            full_recheck: false,
        };
        let policy = PolicySet::new(vec![bots], BTreeSet::new()).unwrap();

        let snap = make_snapshot(4, &[], 0);
        assert_eq!(policy.classify(&snap).tier.id, "bots");

        let mut human = make_snapshot(5, &[], 0);
        human.author = "alice".to_string();
        assert!(policy.classify(&human).tier.is_manual_review());
    }

    #[test]
    fn lower_priority_tier_evaluates_first() {
        // A PR matching both tiers lands in docs (priority 0)
        let snap = make_snapshot(6, &["docs-only", "claude-auto"], 1);
        assert_eq!(policy().classify(&snap).tier.id, "docs");
    }
}

mod pipeline_test {
    use crate::common::{ai_tier, docs_tier, envelope, make_snapshot};
    use autoland::engine::{Decision, decide};
    use autoland::normalize::{InboundEvent, normalize};
    use autoland::policy::PolicySet;
    use autoland::types::PrPhase;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn policy() -> PolicySet {
        PolicySet::new(vec![docs_tier(), ai_tier(300)], BTreeSet::new()).unwrap()
    }

    #[test]
    fn wire_payload_flows_to_a_queue_decision() {
        let snap = make_snapshot(1, &["docs-only"], 0);
        let raw = envelope(&snap, "opened");

        let Some(InboundEvent::Snapshot(normalized)) = normalize(&raw).unwrap() else {
            panic!("expected snapshot");
        };
        assert_eq!(normalized.head_commit, snap.head_commit);

        let classification = policy().classify(&normalized);
        let decision = decide(PrPhase::PendingChecks, None, &classification, &normalized);
        assert_eq!(decision, Decision::Queue);
    }

    #[test]
    fn wire_payload_flows_to_a_soak_decision() {
        let snap = make_snapshot(2, &["claude-auto"], 1);
        let raw = envelope(&snap, "opened");

        let Some(InboundEvent::Snapshot(normalized)) = normalize(&raw).unwrap() else {
            panic!("expected snapshot");
        };
        let classification = policy().classify(&normalized);
        let decision = decide(PrPhase::PendingChecks, None, &classification, &normalized);
        assert_eq!(
            decision,
            Decision::Soak {
                duration: Duration::from_secs(300)
            }
        );
    }
}

mod safeguard_test {
    use crate::common::{ai_tier, make_snapshot};
    use autoland::safeguard::validate;
    use std::collections::BTreeSet;

    fn global_blocking() -> BTreeSet<String> {
        ["do-not-merge"].iter().map(ToString::to_string).collect()
    }

    #[test]
    fn eligible_snapshot_still_passes_live() {
        let snap = make_snapshot(1, &["claude-auto"], 1);
        let report = validate(&snap, &ai_tier(300), &global_blocking(), Some(true));
        assert!(report.passed());
    }

    #[test]
    fn queue_time_label_addition_is_caught() {
        let snap = make_snapshot(2, &["claude-auto", "do-not-merge"], 1);
        let report = validate(&snap, &ai_tier(300), &global_blocking(), Some(true));
        assert!(!report.passed());
    }

    #[test]
    fn diff_grown_past_tier_ceiling_is_caught() {
        let mut snap = make_snapshot(3, &["claude-auto"], 1);
        snap.diff.lines_changed = 800;
        let report = validate(&snap, &ai_tier(300), &global_blocking(), Some(true));
        assert!(report.summary().contains("800"));
    }
}

mod persistence_test {
    use crate::common::make_snapshot;
    use autoland::store::{PersistedTracker, StateStore};
    use autoland::types::{MergeQueueEntry, PrPhase, QueuePhase};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn tracker_table_survives_reopen() {
        let temp = TempDir::new().unwrap();

        {
            let store = StateStore::open(temp.path()).unwrap();
            let mut trackers = BTreeMap::new();
            trackers.insert(
                17,
                PersistedTracker {
                    phase: PrPhase::Queued,
                    tier_id: "docs".to_string(),
                    snapshot: make_snapshot(17, &["docs-only"], 0),
                },
            );
            store.save_trackers(&trackers).unwrap();
            store
                .save_queue(&[MergeQueueEntry {
                    pr_id: 17,
                    tier_id: "docs".to_string(),
                    enqueued_at: Utc::now(),
                    head_commit_at_enqueue: "head-17".to_string(),
                    attempts: 0,
                    state: QueuePhase::Waiting,
                }])
                .unwrap();
        }

        let store = StateStore::open(temp.path()).unwrap();
        let trackers = store.load_trackers().unwrap();
        assert_eq!(trackers[&17].phase, PrPhase::Queued);
        assert_eq!(trackers[&17].snapshot.head_commit, "head-17");
        assert_eq!(store.load_queue().unwrap()[0].pr_id, 17);
    }
}
