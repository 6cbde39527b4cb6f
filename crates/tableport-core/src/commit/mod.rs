//! Optimistic snapshot commits.
//!
//! Provides:
//! - Append of data files as one new snapshot on a branch
//! - Compare-and-swap publication with bounded exponential backoff
//! - Idempotency keys checked against the branch history
//! - Resolution of commits whose outcome is unknown
//!
//! ## Attempt
//!
//! 1. Refresh the table and resolve the target branch
//! 2. Write a manifest for the new files and a manifest list that adds the
//!    parent's manifests
//! 3. Swap the table metadata if it is still at the version read in step 1
//! 4. On conflict, delete the files of step 2, back off and start over

mod coordinator;
mod producer;

pub use coordinator::{CommitCoordinator, CommitCoordinatorBuilder};

use crate::spec::snapshot::summary;
use crate::spec::{DataFile, MAIN_BRANCH};
use crate::{CommitError, Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Table property overriding the retry bound.
pub const COMMIT_NUM_RETRIES: &str = "commit.retry.num-retries";
/// Table property overriding the first backoff delay.
pub const COMMIT_MIN_RETRY_WAIT_MS: &str = "commit.retry.min-wait-ms";
/// Table property overriding the backoff cap.
pub const COMMIT_MAX_RETRY_WAIT_MS: &str = "commit.retry.max-wait-ms";

/// Configuration for the commit coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitCoordinatorConfig {
    /// Maximum number of retries after a conflict
    pub max_retries: u32,
    /// Delay before the first retry (milliseconds)
    pub min_wait_ms: u64,
    /// Maximum delay between retries (milliseconds)
    pub max_wait_ms: u64,
    /// Bound on a single metadata swap; exceeding it makes the outcome unknown
    pub commit_timeout: Option<Duration>,
}

impl Default for CommitCoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 4,
            min_wait_ms: 100,
            max_wait_ms: 60_000,
            commit_timeout: None,
        }
    }
}

impl CommitCoordinatorConfig {
    /// Apply `commit.retry.*` overrides from table properties.
    pub fn with_table_properties(mut self, properties: &BTreeMap<String, String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(
            properties: &BTreeMap<String, String>,
            key: &str,
        ) -> Result<Option<T>> {
            properties
                .get(key)
                .map(|v| {
                    v.trim()
                        .parse::<T>()
                        .map_err(|_| Error::Config(format!("Invalid {} value: {}", key, v)))
                })
                .transpose()
        }

        if let Some(n) = parse(properties, COMMIT_NUM_RETRIES)? {
            self.max_retries = n;
        }
        if let Some(ms) = parse(properties, COMMIT_MIN_RETRY_WAIT_MS)? {
            self.min_wait_ms = ms;
        }
        if let Some(ms) = parse(properties, COMMIT_MAX_RETRY_WAIT_MS)? {
            self.max_wait_ms = ms;
        }
        Ok(self)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u64.saturating_pow(retry.saturating_sub(1));
        let delay_ms = self.min_wait_ms.saturating_mul(factor).min(self.max_wait_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Statistics for the commit coordinator.
#[derive(Debug, Default)]
pub struct CommitStats {
    /// Total appends attempted
    pub commits_attempted: AtomicU64,
    /// Total appends that produced a snapshot
    pub commits_succeeded: AtomicU64,
    /// Total appends that failed
    pub commits_failed: AtomicU64,
    /// Total CAS conflicts encountered
    pub cas_conflicts: AtomicU64,
    /// Total retries performed
    pub retries: AtomicU64,
    /// Total idempotent returns (duplicate request)
    pub idempotent_returns: AtomicU64,
}

impl CommitStats {
    /// Get the success rate.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.commits_attempted.load(Ordering::Relaxed);
        let succeeded = self.commits_succeeded.load(Ordering::Relaxed);
        if attempted == 0 {
            1.0
        } else {
            succeeded as f64 / attempted as f64
        }
    }
}

/// Files to append and how to record them.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub files: Vec<DataFile>,
    pub branch: String,
    /// Extra snapshot summary properties
    pub summary: BTreeMap<String, String>,
    pub idempotency_key: Option<String>,
}

impl AppendRequest {
    pub fn new(files: Vec<DataFile>) -> Self {
        Self {
            files,
            branch: MAIN_BRANCH.to_string(),
            summary: BTreeMap::new(),
            idempotency_key: None,
        }
    }

    pub fn to_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_summary(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.summary.insert(key.into(), value.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Check the request before any attempt writes files.
    pub fn validate(&self) -> Result<()> {
        if self.files.is_empty() {
            return Err(CommitError::EmptyCommit.into());
        }
        if self.branch.is_empty() {
            return Err(CommitError::Validation("branch name must not be empty".into()).into());
        }
        if let Some(key) = self.summary.keys().find(|k| summary::is_reserved(k)) {
            return Err(CommitError::Validation(format!(
                "summary property '{}' is reserved",
                key
            ))
            .into());
        }
        if matches!(&self.idempotency_key, Some(key) if key.is_empty()) {
            return Err(CommitError::Validation("idempotency key must not be empty".into()).into());
        }
        Ok(())
    }
}

/// Result of an append.
#[derive(Debug, Clone)]
pub struct CommitResult {
    /// The new (or, for idempotent returns, existing) snapshot ID
    pub snapshot_id: i64,
    pub parent_snapshot_id: Option<i64>,
    pub sequence_number: i64,
    pub branch: String,
    /// Unique id recorded in the snapshot summary
    pub commit_id: String,
    /// When the commit was made
    pub committed_at: DateTime<Utc>,
    /// Number of files added
    pub files_added: usize,
    pub records_added: u64,
    /// Number of retries before success
    pub retries: u32,
    /// Whether this was an idempotent return (duplicate request)
    pub was_idempotent: bool,
    /// Metadata file holding the snapshot, `None` for idempotent returns
    pub metadata_location: Option<String>,
}
