//! Error types for autoland

use thiserror::Error;

/// All errors that can occur in autoland
#[derive(Debug, Error)]
pub enum Error {
    /// An inbound event could not be parsed into a snapshot
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Tier configuration is inconsistent (should be impossible at runtime
    /// given the total priority ordering enforced at load time)
    #[error("classification error: {0}")]
    Classification(String),

    /// A check re-validation failed for a transient reason and may be retried
    #[error("transient check failure: {0}")]
    CheckTransient(String),

    /// The PR cannot be merged due to conflicts; requires author action
    #[error("merge conflict: {0}")]
    MergeConflict(String),

    /// The audit log could not be written; the transition must not commit
    #[error("audit write failed: {0}")]
    AuditWrite(String),

    /// A queue entry exceeded the merge timeout
    #[error("queue timeout for PR #{pr_id} after {elapsed_secs}s")]
    QueueTimeout {
        /// PR whose entry timed out
        pr_id: u64,
        /// Seconds the entry spent past admission
        elapsed_secs: u64,
    },

    /// Configuration file errors
    #[error("config error: {0}")]
    Config(String),

    /// State persistence errors (queue/timer tables)
    #[error("store error: {0}")]
    Store(String),

    /// Host platform API errors not covered by octocrab's own type
    #[error("host API error: {0}")]
    HostApi(String),

    /// Octocrab (GitHub API) errors
    #[error("GitHub API error: {0}")]
    Octocrab(#[from] Box<octocrab::Error>),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<octocrab::Error> for Error {
    fn from(e: octocrab::Error) -> Self {
        Self::Octocrab(Box::new(e))
    }
}

impl Error {
    /// Whether this error is worth retrying with backoff
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::CheckTransient(_))
    }
}

/// Result type alias for autoland operations
pub type Result<T> = std::result::Result<T, Error>;
