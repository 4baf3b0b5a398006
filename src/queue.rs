//! The merge queue: serialized admission for the integration branch.
//!
//! At most one entry may be past `Waiting` (rebasing, checking, or merging)
//! globally at any instant. That single admission slot is what prevents two
//! PRs from merging against a stale base concurrently; everything else in
//! the engine may run in parallel.
//!
//! Admission order is FIFO within a tier. Tiers drain in priority order
//! (lower-risk tiers first), but consecutive admissions from one tier are
//! capped so a burst of low-priority work cannot starve the others
//! indefinitely.

use crate::types::{MergeQueueEntry, PrId, QueuePhase};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct QueueInner {
    /// Entries in enqueue order; at most one is past `Waiting`
    entries: Vec<MergeQueueEntry>,
    /// Holder of the admission slot
    in_flight: Option<PrId>,
    /// Tier of the most recent admission, for rotation
    last_tier: Option<String>,
    /// Consecutive admissions from `last_tier`
    consecutive: u32,
}

/// The serialized merge queue
#[derive(Clone)]
pub struct MergeQueue {
    inner: Arc<Mutex<QueueInner>>,
    notify: Arc<Notify>,
    /// Tier id → drain priority (lower drains first)
    priorities: HashMap<String, u32>,
    /// Cap on consecutive admissions from one tier while others wait
    max_consecutive_per_tier: u32,
}

impl MergeQueue {
    /// Create a queue for the given tier priorities
    #[must_use]
    pub fn new(priorities: HashMap<String, u32>, max_consecutive_per_tier: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::default())),
            notify: Arc::new(Notify::new()),
            priorities,
            max_consecutive_per_tier: max_consecutive_per_tier.max(1),
        }
    }

    /// Admit a PR into the queue in `Waiting` state.
    ///
    /// Idempotent: a PR already present is not enqueued twice; returns
    /// whether a new entry was created.
    pub fn admit(&self, pr_id: PrId, tier_id: &str, head_commit: &str) -> bool {
        let mut inner = self.inner.lock().expect("merge queue lock poisoned");
        if inner.entries.iter().any(|e| e.pr_id == pr_id) {
            return false;
        }
        inner.entries.push(MergeQueueEntry {
            pr_id,
            tier_id: tier_id.to_string(),
            enqueued_at: Utc::now(),
            head_commit_at_enqueue: head_commit.to_string(),
            attempts: 0,
            state: QueuePhase::Waiting,
        });
        drop(inner);
        debug!(pr_id, tier_id, "admitted to merge queue");
        self.notify.notify_one();
        true
    }

    /// Remove a PR's entry eagerly (withdrawn, superseded, or blocked).
    ///
    /// If the entry held the admission slot the slot is released; the pump
    /// observes the removal at its next stage boundary.
    pub fn withdraw(&self, pr_id: PrId) -> Option<MergeQueueEntry> {
        let mut inner = self.inner.lock().expect("merge queue lock poisoned");
        let pos = inner.entries.iter().position(|e| e.pr_id == pr_id)?;
        let entry = inner.entries.remove(pos);
        if inner.in_flight == Some(pr_id) {
            inner.in_flight = None;
        }
        drop(inner);
        debug!(pr_id, "withdrew queue entry");
        self.notify.notify_one();
        Some(entry)
    }

    /// Whether a PR currently has a queue entry
    #[must_use]
    pub fn contains(&self, pr_id: PrId) -> bool {
        self.inner
            .lock()
            .expect("merge queue lock poisoned")
            .entries
            .iter()
            .any(|e| e.pr_id == pr_id)
    }

    /// Take the admission slot for the next waiting entry, moving it to
    /// `Rebasing`. Returns `None` while the slot is held or nothing waits.
    #[must_use]
    pub fn admit_next(&self) -> Option<MergeQueueEntry> {
        let mut inner = self.inner.lock().expect("merge queue lock poisoned");
        if inner.in_flight.is_some() {
            return None;
        }

        let pr_id = self.select_waiting(&inner)?;
        let tier_id = {
            let entry = inner
                .entries
                .iter_mut()
                .find(|e| e.pr_id == pr_id)
                .expect("selected entry exists");
            entry.state = QueuePhase::Rebasing;
            entry.tier_id.clone()
        };

        inner.in_flight = Some(pr_id);
        if inner.last_tier.as_deref() == Some(tier_id.as_str()) {
            inner.consecutive += 1;
        } else {
            inner.last_tier = Some(tier_id.clone());
            inner.consecutive = 1;
        }

        let entry = inner
            .entries
            .iter()
            .find(|e| e.pr_id == pr_id)
            .cloned()
            .expect("selected entry exists");
        debug!(pr_id, tier_id = %entry.tier_id, "entry took the admission slot");
        Some(entry)
    }

    /// Wait until an admission is possible, then take the slot
    pub async fn next_admission(&self) -> MergeQueueEntry {
        loop {
            if let Some(entry) = self.admit_next() {
                return entry;
            }
            self.notify.notified().await;
        }
    }

    /// Advance the in-flight entry to a new phase
    pub fn set_phase(&self, pr_id: PrId, phase: QueuePhase) {
        let mut inner = self.inner.lock().expect("merge queue lock poisoned");
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.pr_id == pr_id) {
            entry.state = phase;
        }
    }

    /// Remove the entry and release the slot (terminal state reached)
    pub fn finish(&self, pr_id: PrId) -> Option<MergeQueueEntry> {
        let mut inner = self.inner.lock().expect("merge queue lock poisoned");
        let pos = inner.entries.iter().position(|e| e.pr_id == pr_id)?;
        let entry = inner.entries.remove(pos);
        if inner.in_flight == Some(pr_id) {
            inner.in_flight = None;
        }
        drop(inner);
        self.notify.notify_one();
        Some(entry)
    }

    /// Return a failed in-flight entry to `Waiting` for one more try,
    /// releasing the slot and bumping its attempt count
    pub fn requeue(&self, pr_id: PrId) -> Option<u32> {
        let mut inner = self.inner.lock().expect("merge queue lock poisoned");
        let attempts = {
            let entry = inner.entries.iter_mut().find(|e| e.pr_id == pr_id)?;
            entry.state = QueuePhase::Waiting;
            entry.attempts += 1;
            entry.attempts
        };
        if inner.in_flight == Some(pr_id) {
            inner.in_flight = None;
        }
        drop(inner);
        debug!(pr_id, attempts, "requeued entry");
        self.notify.notify_one();
        Some(attempts)
    }

    /// Entry for a PR, if present
    #[must_use]
    pub fn entry(&self, pr_id: PrId) -> Option<MergeQueueEntry> {
        self.inner
            .lock()
            .expect("merge queue lock poisoned")
            .entries
            .iter()
            .find(|e| e.pr_id == pr_id)
            .cloned()
    }

    /// All entries in enqueue order, for persistence
    #[must_use]
    pub fn table(&self) -> Vec<MergeQueueEntry> {
        self.inner
            .lock()
            .expect("merge queue lock poisoned")
            .entries
            .clone()
    }

    /// Rehydrate from persisted rows (process restart).
    ///
    /// An entry that crashed mid-flight returns to `Waiting`; the rebase or
    /// merge it was performing either completed host-side (the safeguard
    /// and head comparison will notice) or never happened.
    pub fn restore(&self, entries: Vec<MergeQueueEntry>) {
        let mut inner = self.inner.lock().expect("merge queue lock poisoned");
        inner.entries = entries
            .into_iter()
            .map(|mut e| {
                if e.state.is_in_flight() {
                    e.state = QueuePhase::Waiting;
                }
                e
            })
            .filter(|e| !matches!(e.state, QueuePhase::Merged | QueuePhase::Failed))
            .collect();
        inner.in_flight = None;
        drop(inner);
        self.notify.notify_one();
    }

    /// Number of entries currently past `Waiting` (0 or 1 by construction)
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.inner
            .lock()
            .expect("merge queue lock poisoned")
            .entries
            .iter()
            .filter(|e| e.state.is_in_flight())
            .count()
    }

    /// Number of waiting entries
    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.inner
            .lock()
            .expect("merge queue lock poisoned")
            .entries
            .iter()
            .filter(|e| e.state == QueuePhase::Waiting)
            .count()
    }

    fn priority_of(&self, tier_id: &str) -> u32 {
        self.priorities.get(tier_id).copied().unwrap_or(u32::MAX)
    }

    /// Pick the next waiting entry: FIFO within tier, tiers by priority,
    /// rotating away from a tier that has had its consecutive share while
    /// other tiers have waiters.
    fn select_waiting(&self, inner: &QueueInner) -> Option<PrId> {
        let waiting: Vec<&MergeQueueEntry> = inner
            .entries
            .iter()
            .filter(|e| e.state == QueuePhase::Waiting)
            .collect();
        if waiting.is_empty() {
            return None;
        }

        let rotate = inner
            .last_tier
            .as_deref()
            .is_some_and(|last| {
                inner.consecutive >= self.max_consecutive_per_tier
                    && waiting.iter().any(|e| e.tier_id != last)
            });

        waiting
            .into_iter()
            .filter(|e| {
                !rotate || inner.last_tier.as_deref() != Some(e.tier_id.as_str())
            })
            .min_by_key(|e| (self.priority_of(&e.tier_id), e.enqueued_at))
            .map(|e| e.pr_id)
    }
}
