//! Soak timer scheduling.
//!
//! Timers for every soaking PR live in one locked table keyed by `fire_at`,
//! drained by a single polling task. Cancellation is a lookup-and-remove
//! against that table under the same lock the poller takes to pop due
//! timers, so a cancel issued strictly before the fire callback begins
//! executing always wins: the pop simply finds nothing.
//!
//! Each schedule or cancel bumps the PR's epoch. A fire that raced a
//! reschedule carries a stale epoch and is discarded by the engine, which
//! makes the fire-vs-cancel resolution order testable rather than timing
//! dependent.

use crate::types::{PrId, SoakTimer};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct SoakInner {
    timers: HashMap<PrId, SoakTimer>,
    epochs: HashMap<PrId, u64>,
}

/// Shared scheduler holding every active soak delay
#[derive(Clone, Default)]
pub struct SoakScheduler {
    inner: Arc<Mutex<SoakInner>>,
    notify: Arc<Notify>,
}

impl SoakScheduler {
    /// Create an empty scheduler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule (or replace) the soak timer for a PR.
    ///
    /// Bumps the PR's epoch so any in-flight fire for an older timer is
    /// recognizably stale.
    pub fn schedule(&self, pr_id: PrId, tier_id: &str, duration: Duration) -> SoakTimer {
        let started_at = Utc::now();
        let fire_at = started_at
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());

        let timer = {
            let mut inner = self.inner.lock().expect("soak scheduler lock poisoned");
            let epoch = inner.epochs.entry(pr_id).or_insert(0);
            *epoch += 1;
            let timer = SoakTimer {
                pr_id,
                tier_id: tier_id.to_string(),
                started_at,
                fire_at,
                epoch: *epoch,
            };
            inner.timers.insert(pr_id, timer.clone());
            timer
        };

        debug!(pr_id, tier_id, fire_at = %timer.fire_at, "scheduled soak timer");
        self.notify.notify_one();
        timer
    }

    /// Cancel the active timer for a PR. Returns whether one was removed.
    pub fn cancel(&self, pr_id: PrId) -> bool {
        let removed = {
            let mut inner = self.inner.lock().expect("soak scheduler lock poisoned");
            let epoch = inner.epochs.entry(pr_id).or_insert(0);
            *epoch += 1;
            inner.timers.remove(&pr_id).is_some()
        };
        if removed {
            debug!(pr_id, "cancelled soak timer");
            self.notify.notify_one();
        }
        removed
    }

    /// The active timer for a PR, if any
    #[must_use]
    pub fn active(&self, pr_id: PrId) -> Option<SoakTimer> {
        self.inner
            .lock()
            .expect("soak scheduler lock poisoned")
            .timers
            .get(&pr_id)
            .cloned()
    }

    /// Whether `epoch` is still the PR's current epoch (no cancel or
    /// reschedule happened since the timer carrying it was created)
    #[must_use]
    pub fn is_current(&self, pr_id: PrId, epoch: u64) -> bool {
        self.inner
            .lock()
            .expect("soak scheduler lock poisoned")
            .epochs
            .get(&pr_id)
            .is_some_and(|e| *e == epoch)
    }

    /// All active timers, for persistence
    #[must_use]
    pub fn table(&self) -> Vec<SoakTimer> {
        let mut timers: Vec<SoakTimer> = self
            .inner
            .lock()
            .expect("soak scheduler lock poisoned")
            .timers
            .values()
            .cloned()
            .collect();
        timers.sort_by_key(|t| t.pr_id);
        timers
    }

    /// Rehydrate the table from persisted rows (process restart).
    ///
    /// Timers whose `fire_at` already passed will fire on the next poll.
    pub fn restore(&self, timers: Vec<SoakTimer>) {
        let mut inner = self.inner.lock().expect("soak scheduler lock poisoned");
        for timer in timers {
            inner.epochs.insert(timer.pr_id, timer.epoch);
            inner.timers.insert(timer.pr_id, timer);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Number of active timers
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("soak scheduler lock poisoned")
            .timers
            .len()
    }

    /// Whether no timers are active
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop one due timer, removing it from the table.
    ///
    /// Popping and cancelling contend on the same lock; whichever ran first
    /// determines the outcome.
    #[must_use]
    pub fn pop_due(&self, now: DateTime<Utc>) -> Option<SoakTimer> {
        let mut inner = self.inner.lock().expect("soak scheduler lock poisoned");
        let pr_id = inner
            .timers
            .values()
            .filter(|t| t.fire_at <= now)
            .min_by_key(|t| t.fire_at)
            .map(|t| t.pr_id)?;
        inner.timers.remove(&pr_id)
    }

    /// Wait until some timer is due and pop it.
    ///
    /// This is the single poll point: the engine runs exactly one task
    /// awaiting this in a loop.
    pub async fn next_fired(&self) -> SoakTimer {
        loop {
            let now = Utc::now();
            if let Some(timer) = self.pop_due(now) {
                return timer;
            }

            let earliest = {
                let inner = self.inner.lock().expect("soak scheduler lock poisoned");
                inner.timers.values().map(|t| t.fire_at).min()
            };

            match earliest {
                Some(fire_at) => {
                    let wait = (fire_at - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}
