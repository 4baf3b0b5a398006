//! Crash-recoverable persistence for in-flight engine state.
//!
//! The queue-entry and soak-timer tables are rewritten atomically
//! (temp file + rename) on every mutation, so a crash never silently drops
//! a PR from tracking: on startup the engine rehydrates the scheduler and
//! sequencer from these tables instead of assuming a cold start.

use crate::error::{Error, Result};
use crate::types::{MergeQueueEntry, PrId, PrPhase, PullRequestSnapshot, SoakTimer};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const QUEUE_FILE: &str = "queue.json";
const TIMERS_FILE: &str = "timers.json";
const TRACKERS_FILE: &str = "trackers.json";

/// Durable view of one PR's engine state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTracker {
    /// Lifecycle phase at last commit
    pub phase: PrPhase,
    /// Tier the PR was last classified into
    pub tier_id: String,
    /// Last snapshot the engine acted on
    pub snapshot: PullRequestSnapshot,
}

/// File-backed state tables under one directory
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open the store, creating the directory if needed
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .map_err(|e| Error::Store(format!("failed to create {}: {e}", dir.display())))?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Persist the queue table
    pub fn save_queue(&self, entries: &[MergeQueueEntry]) -> Result<()> {
        self.write_atomic(QUEUE_FILE, entries)
    }

    /// Load the queue table (empty if never written)
    pub fn load_queue(&self) -> Result<Vec<MergeQueueEntry>> {
        self.read_or_default(QUEUE_FILE)
    }

    /// Persist the soak-timer table
    pub fn save_timers(&self, timers: &[SoakTimer]) -> Result<()> {
        self.write_atomic(TIMERS_FILE, timers)
    }

    /// Load the soak-timer table (empty if never written)
    pub fn load_timers(&self) -> Result<Vec<SoakTimer>> {
        self.read_or_default(TIMERS_FILE)
    }

    /// Persist the per-PR tracker table
    pub fn save_trackers(&self, trackers: &BTreeMap<PrId, PersistedTracker>) -> Result<()> {
        self.write_atomic(TRACKERS_FILE, trackers)
    }

    /// Load the per-PR tracker table (empty if never written)
    pub fn load_trackers(&self) -> Result<BTreeMap<PrId, PersistedTracker>> {
        self.read_or_default(TRACKERS_FILE)
    }

    /// Serialize `value` to a temp file, then rename it into place.
    ///
    /// The rename is the commit point; a crash mid-write leaves the old
    /// table intact.
    fn write_atomic<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));

        let content = serde_json::to_string_pretty(value)
            .map_err(|e| Error::Store(format!("failed to serialize {name}: {e}")))?;
        fs::write(&tmp, content)
            .map_err(|e| Error::Store(format!("failed to write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::Store(format!("failed to commit {}: {e}", path.display())))?;
        Ok(())
    }

    fn read_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(T::default());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Store(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Store(format!("failed to parse {}: {e}", path.display())))
    }
}
