//! The decision engine: effectful orchestration around [`decide`].
//!
//! All I/O lives here. Inbound events, soak fires, and queue admissions all
//! funnel into the same evaluate-then-apply path, under one lock over the
//! tracker table so transitions for a PR are serialized.
//!
//! Every state transition appends to the audit log *before* the tracker
//! mutates. If the append fails the transition is abandoned and the PR stays
//! in its prior phase; automation halts rather than running unrecorded.

mod decide;

pub use decide::{decide, Decision};

use crate::audit::AuditLog;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::normalize::{normalize, InboundEvent};
use crate::platform::HostService;
use crate::policy::{Classification, PolicySet, Tier};
use crate::queue::MergeQueue;
use crate::safeguard;
use crate::soak::SoakScheduler;
use crate::store::{PersistedTracker, StateStore};
use crate::types::{
    Actor, AuditEvent, MergeOutcome, MergeQueueEntry, PrId, PrPhase, PullRequestSnapshot,
    QueuePhase, SoakTimer,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Seconds between check polls inside the queue's critical section
const CHECK_POLL_SECS: u64 = 30;

/// Retry delay when the live snapshot cannot be fetched at soak fire
const SOAK_RETRY_SECS: u64 = 30;

/// Outcome of one pass through the queue's critical section
enum MergeStep {
    /// The PR landed
    Merged(MergeOutcome),
    /// Live state diverged (new head, regressed checks); back to pending
    Invalidated(String),
    /// A safeguard or policy violation; the PR is blocked, not retried
    Halted(String),
}

/// The full engine: policy, scheduler, sequencer, persistence, host
pub struct Engine {
    config: EngineConfig,
    policy: PolicySet,
    store: StateStore,
    audit: AuditLog,
    soak: SoakScheduler,
    queue: MergeQueue,
    host: Arc<dyn HostService>,
    /// One lock over all trackers; transitions are serialized through it
    trackers: Mutex<BTreeMap<PrId, PersistedTracker>>,
}

impl Engine {
    /// Build an engine from configuration and a host service.
    ///
    /// Opens the state directory and the audit log; fails if either is
    /// unavailable rather than running without persistence.
    pub fn new(config: EngineConfig, host: Arc<dyn HostService>) -> Result<Self> {
        let policy = config.policy_set()?;
        let store = StateStore::open(&config.state_dir)?;
        let audit = AuditLog::open(&config.audit_path())?;

        let priorities = policy
            .tiers()
            .iter()
            .map(|t| (t.id.clone(), t.priority))
            .collect();
        let queue = MergeQueue::new(priorities, config.max_admissions_per_tier);

        Ok(Self {
            config,
            policy,
            store,
            audit,
            soak: SoakScheduler::new(),
            queue,
            host,
            trackers: Mutex::new(BTreeMap::new()),
        })
    }

    /// Rehydrate trackers, queue entries, and soak timers from the state
    /// directory. Call once before [`Self::spawn_workers`].
    pub async fn recover(&self) -> Result<()> {
        let trackers = self.store.load_trackers()?;
        let queue_rows = self.store.load_queue()?;
        let timer_rows = self.store.load_timers()?;

        let tracked = trackers.len();
        let queued = queue_rows.len();
        let soaking = timer_rows.len();

        *self.trackers.lock().await = trackers;
        self.queue.restore(queue_rows);
        self.soak.restore(timer_rows);

        if tracked > 0 || queued > 0 || soaking > 0 {
            info!(tracked, queued, soaking, "recovered engine state");
        }
        Ok(())
    }

    /// Spawn the soak poller and the queue pump.
    ///
    /// Exactly one of each: the soak loop pops due timers, the pump owns the
    /// queue's single admission slot.
    #[must_use]
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let soak_engine = Arc::clone(self);
        let soak_task = tokio::spawn(async move {
            loop {
                let timer = soak_engine.soak.next_fired().await;
                if let Err(e) = soak_engine.on_soak_fired(timer).await {
                    warn!(error = %e, "soak fire handling failed");
                }
            }
        });

        let pump_engine = Arc::clone(self);
        let pump_task = tokio::spawn(async move {
            loop {
                let entry = pump_engine.queue.next_admission().await;
                pump_engine.run_entry(entry).await;
            }
        });

        vec![soak_task, pump_task]
    }

    /// Process one raw inbound event (webhook-shaped JSON)
    pub async fn handle_event(&self, raw: &serde_json::Value) -> Result<()> {
        match normalize(raw)? {
            None => Ok(()),
            Some(InboundEvent::Withdrawn { pr_id }) => self.withdraw(pr_id).await,
            Some(InboundEvent::Snapshot(snapshot)) => self.handle_snapshot(snapshot).await,
        }
    }

    /// Re-evaluate a PR against a fresh snapshot and apply the decision
    pub async fn handle_snapshot(&self, snapshot: PullRequestSnapshot) -> Result<()> {
        let mut trackers = self.trackers.lock().await;
        let pr_id = snapshot.id;

        let (phase, prior_head) = trackers.get(&pr_id).map_or_else(
            || (PrPhase::PendingChecks, None),
            |t| (t.phase, Some(t.snapshot.head_commit.clone())),
        );

        let classification = self.policy.classify(&snapshot);
        let decision = decide(phase, prior_head.as_deref(), &classification, &snapshot);
        debug!(pr_id, %phase, tier = %classification.tier.id, decision = ?decision, "evaluated");

        self.apply(&mut trackers, phase, snapshot, &classification, decision)
            .await
    }

    /// Tear down all tracking for a closed PR
    async fn withdraw(&self, pr_id: PrId) -> Result<()> {
        let mut trackers = self.trackers.lock().await;
        let Some(tracker) = trackers.get(&pr_id).cloned() else {
            return Ok(());
        };
        if tracker.phase.is_terminal() {
            return Ok(());
        }

        self.append_audit(
            pr_id,
            tracker.phase,
            PrPhase::Failed,
            "PR closed; tracking withdrawn",
        )?;
        self.soak.cancel(pr_id);
        self.queue.withdraw(pr_id);
        trackers.remove(&pr_id);
        self.persist(&trackers)?;
        info!(pr_id, "withdrew PR from tracking");
        Ok(())
    }

    /// Apply a decision to the tracker table.
    ///
    /// Audit appends precede every mutation; a failed append leaves the
    /// tracker, the timer table, and the queue untouched.
    async fn apply(
        &self,
        trackers: &mut BTreeMap<PrId, PersistedTracker>,
        phase: PrPhase,
        snapshot: PullRequestSnapshot,
        classification: &Classification,
        decision: Decision,
    ) -> Result<()> {
        let pr_id = snapshot.id;
        let tier = &classification.tier;

        match decision {
            Decision::Reject { reason } => {
                debug!(pr_id, reason, "event rejected");
                Ok(())
            }
            Decision::Hold => {
                // No transition; keep the freshest view of the PR
                if let Some(tracker) = trackers.get_mut(&pr_id) {
                    tracker.snapshot = snapshot;
                    self.persist(trackers)?;
                }
                Ok(())
            }
            Decision::AwaitChecks { reason } => {
                if phase != PrPhase::PendingChecks {
                    self.append_audit(pr_id, phase, PrPhase::PendingChecks, &reason)?;
                }
                Self::put_tracker(trackers, PrPhase::PendingChecks, tier, snapshot);
                self.persist(trackers)?;
                Ok(())
            }
            Decision::Block { reason } => {
                self.append_audit(pr_id, phase, PrPhase::Blocked, &reason)?;
                self.soak.cancel(pr_id);
                self.queue.withdraw(pr_id);
                Self::put_tracker(trackers, PrPhase::Blocked, tier, snapshot);
                self.persist(trackers)?;
                self.comment(pr_id, &format!("autoland: merge halted: {reason}"))
                    .await;
                Ok(())
            }
            Decision::Invalidate { reason } => {
                self.append_audit(pr_id, phase, PrPhase::PendingChecks, &reason)?;
                self.soak.cancel(pr_id);
                self.queue.withdraw(pr_id);
                Self::put_tracker(trackers, PrPhase::PendingChecks, tier, snapshot);
                self.persist(trackers)?;
                Ok(())
            }
            Decision::Soak { duration } => {
                self.append_audit(pr_id, phase, PrPhase::Eligible, "all gates satisfied")?;
                self.append_audit(
                    pr_id,
                    PrPhase::Eligible,
                    PrPhase::Soaking,
                    &format!("soaking for {}s", duration.as_secs()),
                )?;
                self.soak.schedule(pr_id, &tier.id, duration);
                Self::put_tracker(trackers, PrPhase::Soaking, tier, snapshot);
                self.persist(trackers)?;
                Ok(())
            }
            Decision::Queue => {
                self.append_audit(pr_id, phase, PrPhase::Eligible, "all gates satisfied")?;
                self.append_audit(
                    pr_id,
                    PrPhase::Eligible,
                    PrPhase::Queued,
                    "admitted to merge queue",
                )?;
                self.queue.admit(pr_id, &tier.id, &snapshot.head_commit);
                Self::put_tracker(trackers, PrPhase::Queued, tier, snapshot);
                self.persist(trackers)?;
                Ok(())
            }
        }
    }

    /// A soak timer fired: re-fetch live state and either queue or fall back.
    ///
    /// The fire is discarded when its epoch is stale (a cancel or reschedule
    /// happened after the timer was popped but carries the authoritative
    /// ordering).
    pub async fn on_soak_fired(&self, timer: SoakTimer) -> Result<()> {
        let pr_id = timer.pr_id;
        if !self.soak.is_current(pr_id, timer.epoch) {
            debug!(pr_id, epoch = timer.epoch, "discarding stale soak fire");
            return Ok(());
        }

        // Re-fetch rather than trusting the snapshot from soak start: labels,
        // approvals, and the head may all have moved during the delay.
        let live = match self.host.fetch_snapshot(pr_id).await {
            Ok(live) => live,
            Err(e) => {
                // The due timer was already popped; without a reschedule the
                // PR would sit in Soaking with nothing left to fire.
                warn!(pr_id, error = %e, "snapshot fetch failed at soak fire; rescheduling");
                let trackers = self.trackers.lock().await;
                if trackers.get(&pr_id).is_some_and(|t| t.phase == PrPhase::Soaking) {
                    self.soak
                        .schedule(pr_id, &timer.tier_id, Duration::from_secs(SOAK_RETRY_SECS));
                    self.persist(&trackers)?;
                }
                return Ok(());
            }
        };

        let mut trackers = self.trackers.lock().await;
        let Some(tracker) = trackers.get(&pr_id).cloned() else {
            debug!(pr_id, "soak fired for untracked PR");
            return Ok(());
        };
        if tracker.phase != PrPhase::Soaking {
            debug!(pr_id, phase = %tracker.phase, "soak fired but PR moved on");
            return Ok(());
        }

        let classification = self.policy.classify(&live);
        let decision = decide(
            PrPhase::Soaking,
            Some(tracker.snapshot.head_commit.as_str()),
            &classification,
            &live,
        );

        // `Hold` from the soaking phase means every gate still passes; the
        // soak is what ends here, so the PR advances to the queue.
        if decision == Decision::Hold {
            let tier = &classification.tier;
            self.append_audit(pr_id, PrPhase::Soaking, PrPhase::Queued, "soak complete")?;
            // A PR is soaking or queued, never both
            self.soak.cancel(pr_id);
            self.queue.admit(pr_id, &tier.id, &live.head_commit);
            Self::put_tracker(&mut trackers, PrPhase::Queued, tier, live);
            self.persist(&trackers)?;
            info!(pr_id, "soak complete; admitted to merge queue");
            return Ok(());
        }

        self.apply(
            &mut trackers,
            PrPhase::Soaking,
            live,
            &classification,
            decision,
        )
        .await
    }

    /// Drive one admitted queue entry through rebase, re-check, safeguard,
    /// and merge, bounded by the configured merge timeout
    pub async fn run_entry(&self, entry: MergeQueueEntry) {
        let pr_id = entry.pr_id;
        if let Err(e) = self.enter_merging(pr_id).await {
            warn!(pr_id, error = %e, "could not enter merging phase");
            if let Some(attempts) = self.queue.requeue(pr_id) {
                // Likely an audit or store outage; hold the pump back so it
                // does not spin admit/fail/requeue against a dead disk
                tokio::time::sleep(Duration::from_secs(
                    CHECK_POLL_SECS * u64::from(attempts.min(10)),
                ))
                .await;
            }
            return;
        }

        let started = std::time::Instant::now();
        let step = match tokio::time::timeout(
            self.config.merge_timeout(),
            self.merge_sequence(&entry),
        )
        .await
        {
            Ok(step) => step,
            Err(_) => Err(Error::QueueTimeout {
                pr_id,
                elapsed_secs: started.elapsed().as_secs(),
            }),
        };

        if let Err(e) = self.settle_entry(&entry, step).await {
            warn!(pr_id, error = %e, "failed to settle queue entry");
        }
    }

    /// Audit and record the Queued → Merging transition
    async fn enter_merging(&self, pr_id: PrId) -> Result<()> {
        let mut trackers = self.trackers.lock().await;
        let Some(tracker) = trackers.get_mut(&pr_id) else {
            return Err(Error::Store(format!("no tracker for queued PR #{pr_id}")));
        };
        self.append_audit(
            pr_id,
            tracker.phase,
            PrPhase::Merging,
            "took the merge queue admission slot",
        )?;
        tracker.phase = PrPhase::Merging;
        self.persist(&trackers)?;
        Ok(())
    }

    /// The critical section: at most one PR is ever inside this function
    async fn merge_sequence(&self, entry: &MergeQueueEntry) -> Result<MergeStep> {
        let pr_id = entry.pr_id;
        let tier = self.policy.resolve(&entry.tier_id);

        // Stage 1: rebase onto the current integration branch head.
        self.queue.set_phase(pr_id, QueuePhase::Rebasing);
        let live = self.host.fetch_snapshot(pr_id).await?;
        if live.head_commit != entry.head_commit_at_enqueue {
            return Ok(MergeStep::Invalidated(format!(
                "head moved to {} since enqueue",
                live.head_commit
            )));
        }

        let target = self.host.branch_head(&self.config.integration_branch).await?;
        let new_head = if live.base_commit == target {
            debug!(pr_id, "already based on the integration branch head");
            live.head_commit.clone()
        } else {
            match self.host.update_branch(pr_id).await {
                Ok(head) => {
                    info!(pr_id, head = %head, "rebased onto integration branch");
                    head
                }
                Err(Error::MergeConflict(msg)) => {
                    return Ok(MergeStep::Invalidated(format!("merge conflict: {msg}")));
                }
                Err(e) => return Err(e),
            }
        };

        // Stage 2: wait for checks against the rebased head.
        self.queue.set_phase(pr_id, QueuePhase::Checking);
        if let Some(step) = self.await_checks(pr_id, &tier, &new_head).await? {
            return Ok(step);
        }

        // Stage 3: safeguard over live state, immediately before the merge.
        let live = self.host.fetch_snapshot(pr_id).await?;
        if live.head_commit != new_head {
            return Ok(MergeStep::Invalidated(format!(
                "head moved to {} during checks",
                live.head_commit
            )));
        }
        let mergeable = self.host.is_mergeable(pr_id).await?;
        let report = safeguard::validate(&live, &tier, self.policy.global_blocking(), mergeable);
        if !report.passed() {
            // Blocking labels halt the PR outright; anything else (dismissed
            // approval, grown diff, unresolved conversations) sends it back
            // to re-enter from pending checks.
            if self.policy.classify(&live).blocked {
                return Ok(MergeStep::Halted(report.summary()));
            }
            return Ok(MergeStep::Invalidated(report.summary()));
        }

        // Zero-approval tiers self-approve so branch protection is satisfied
        if tier.required_approvals == 0 {
            if let Err(e) = self.host.approve_pr(pr_id).await {
                warn!(pr_id, error = %e, "self-approval failed; merging anyway");
            }
        }

        // Stage 4: merge.
        self.queue.set_phase(pr_id, QueuePhase::Merging);
        let outcome = self.host.merge_pr(pr_id, tier.merge_method).await?;
        if !outcome.merged {
            return Err(Error::HostApi(format!(
                "merge rejected by host: {}",
                outcome.message.as_deref().unwrap_or("no message")
            )));
        }
        Ok(MergeStep::Merged(outcome))
    }

    /// Poll checks on the rebased head until they pass, fail, or regress.
    ///
    /// Tiers without `full_recheck` skip the wait entirely: their checks
    /// passed pre-rebase and the safeguard still runs. Transient fetch
    /// errors retry with linear backoff; the merge timeout wrapping the
    /// critical section bounds the whole wait.
    async fn await_checks(
        &self,
        pr_id: PrId,
        tier: &Tier,
        expected_head: &str,
    ) -> Result<Option<MergeStep>> {
        if tier.required_checks.is_empty() || !tier.full_recheck {
            return Ok(None);
        }

        let mut fetch_failures: u32 = 0;
        loop {
            let live = match self.host.fetch_snapshot(pr_id).await {
                Ok(live) => live,
                Err(e) if e.is_transient() => {
                    fetch_failures += 1;
                    if fetch_failures >= self.config.max_attempts {
                        return Err(e);
                    }
                    warn!(pr_id, error = %e, "transient check fetch failure; retrying");
                    tokio::time::sleep(Duration::from_secs(
                        CHECK_POLL_SECS * u64::from(fetch_failures),
                    ))
                    .await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if live.head_commit != expected_head {
                return Ok(Some(MergeStep::Invalidated(format!(
                    "head moved to {} during checks",
                    live.head_commit
                ))));
            }
            if live.any_check_failed(&tier.required_checks) {
                return Ok(Some(MergeStep::Halted(
                    "a required check failed on the rebased head".to_string(),
                )));
            }
            if live.checks_passed(&tier.required_checks, tier.allow_skipped_checks) {
                debug!(pr_id, "checks passed on rebased head");
                return Ok(None);
            }

            debug!(pr_id, "checks still running on rebased head");
            tokio::time::sleep(Duration::from_secs(CHECK_POLL_SECS)).await;
        }
    }

    /// Commit the outcome of a critical section to the queue and trackers
    async fn settle_entry(&self, entry: &MergeQueueEntry, step: Result<MergeStep>) -> Result<()> {
        let pr_id = entry.pr_id;
        let mut trackers = self.trackers.lock().await;

        match step {
            Ok(MergeStep::Merged(outcome)) => {
                self.append_audit(
                    pr_id,
                    PrPhase::Merging,
                    PrPhase::Merged,
                    &format!(
                        "merged as {}",
                        outcome.sha.as_deref().unwrap_or("unknown sha")
                    ),
                )?;
                self.queue.set_phase(pr_id, QueuePhase::Merged);
                self.queue.finish(pr_id);
                if let Some(tracker) = trackers.get_mut(&pr_id) {
                    tracker.phase = PrPhase::Merged;
                }
                self.persist(&trackers)?;
                info!(pr_id, sha = ?outcome.sha, "PR merged");
                Ok(())
            }
            Ok(MergeStep::Invalidated(reason)) => {
                self.append_audit(pr_id, PrPhase::Merging, PrPhase::PendingChecks, &reason)?;
                self.queue.withdraw(pr_id);
                if let Some(tracker) = trackers.get_mut(&pr_id) {
                    tracker.phase = PrPhase::PendingChecks;
                }
                self.persist(&trackers)?;
                self.comment(pr_id, &format!("autoland: merge attempt aborted: {reason}"))
                    .await;
                Ok(())
            }
            Ok(MergeStep::Halted(reason)) => {
                self.append_audit(pr_id, PrPhase::Merging, PrPhase::Blocked, &reason)?;
                self.queue.set_phase(pr_id, QueuePhase::Failed);
                self.queue.finish(pr_id);
                if let Some(tracker) = trackers.get_mut(&pr_id) {
                    tracker.phase = PrPhase::Blocked;
                }
                self.persist(&trackers)?;
                self.comment(pr_id, &format!("autoland: merge halted: {reason}"))
                    .await;
                Ok(())
            }
            Err(e) => {
                let attempts = entry.attempts + 1;
                if attempts >= self.config.max_attempts {
                    // Escalate, don't bury: a human can unblock and the PR
                    // re-enters from the top
                    self.append_audit(
                        pr_id,
                        PrPhase::Merging,
                        PrPhase::Blocked,
                        &format!("attempt {attempts} failed, retries exhausted: {e}"),
                    )?;
                    self.queue.set_phase(pr_id, QueuePhase::Failed);
                    self.queue.finish(pr_id);
                    if let Some(tracker) = trackers.get_mut(&pr_id) {
                        tracker.phase = PrPhase::Blocked;
                    }
                    self.persist(&trackers)?;
                    self.comment(
                        pr_id,
                        &format!(
                            "autoland: merge failed after {attempts} attempt(s): {e}. \
                             Human attention required."
                        ),
                    )
                    .await;
                    warn!(pr_id, attempts, error = %e, "merge failed permanently");
                } else {
                    self.append_audit(
                        pr_id,
                        PrPhase::Merging,
                        PrPhase::Queued,
                        &format!("attempt {attempts} failed, requeued: {e}"),
                    )?;
                    self.queue.requeue(pr_id);
                    if let Some(tracker) = trackers.get_mut(&pr_id) {
                        tracker.phase = PrPhase::Queued;
                    }
                    self.persist(&trackers)?;
                    warn!(pr_id, attempts, error = %e, "merge attempt failed; requeued");
                }
                Ok(())
            }
        }
    }

    fn put_tracker(
        trackers: &mut BTreeMap<PrId, PersistedTracker>,
        phase: PrPhase,
        tier: &Tier,
        snapshot: PullRequestSnapshot,
    ) {
        trackers.insert(
            snapshot.id,
            PersistedTracker {
                phase,
                tier_id: tier.id.clone(),
                snapshot,
            },
        );
    }

    fn append_audit(&self, pr_id: PrId, from: PrPhase, to: PrPhase, reason: &str) -> Result<()> {
        self.audit.append(&AuditEvent {
            timestamp: Utc::now(),
            pr_id,
            from,
            to,
            reason: reason.to_string(),
            actor: Actor::System,
        })
    }

    /// Rewrite every durable table; called after each committed mutation
    fn persist(&self, trackers: &BTreeMap<PrId, PersistedTracker>) -> Result<()> {
        self.store.save_trackers(trackers)?;
        self.store.save_queue(&self.queue.table())?;
        self.store.save_timers(&self.soak.table())?;
        Ok(())
    }

    /// Best-effort status comment; failure is logged, never fatal
    async fn comment(&self, pr_id: PrId, body: &str) {
        if let Err(e) = self.host.comment(pr_id, body).await {
            warn!(pr_id, error = %e, "failed to post status comment");
        }
    }

    /// Current phase of a PR, if tracked
    pub async fn phase_of(&self, pr_id: PrId) -> Option<PrPhase> {
        self.trackers.lock().await.get(&pr_id).map(|t| t.phase)
    }

    /// The soak scheduler (for inspection)
    #[must_use]
    pub const fn soak(&self) -> &SoakScheduler {
        &self.soak
    }

    /// The merge queue (for inspection)
    #[must_use]
    pub const fn queue(&self) -> &MergeQueue {
        &self.queue
    }

    /// The audit log
    #[must_use]
    pub const fn audit(&self) -> &AuditLog {
        &self.audit
    }
}
