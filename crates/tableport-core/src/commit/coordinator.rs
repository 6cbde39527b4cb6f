use super::producer::{delete_files, SnapshotProducer};
use super::{AppendRequest, CommitCoordinatorConfig, CommitResult, CommitStats};
use crate::catalog::{CommitOutcome, Table, TableOperations, TableState};
use crate::spec::snapshot::summary::{ADDED_DATA_FILES, IDEMPOTENCY_KEY};
use crate::spec::{DataFile, Snapshot, TableMetadata};
use crate::{CommitError, Error, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Appends data files to a table under optimistic concurrency.
///
/// Commits made through one coordinator are serialized. Coordinators in
/// other tasks or processes race through the table's compare-and-swap; the
/// loser of a race rebuilds its snapshot on top of the winner's.
pub struct CommitCoordinator {
    table: Arc<Table>,
    config: CommitCoordinatorConfig,
    stats: CommitStats,
    commit_lock: Mutex<()>,
}

impl CommitCoordinator {
    pub fn new(table: Arc<Table>, config: CommitCoordinatorConfig) -> Self {
        Self {
            table,
            config,
            stats: CommitStats::default(),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn builder() -> CommitCoordinatorBuilder {
        CommitCoordinatorBuilder::new()
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn config(&self) -> &CommitCoordinatorConfig {
        &self.config
    }

    /// Get statistics.
    pub fn stats(&self) -> &CommitStats {
        &self.stats
    }

    /// Append `files` to `branch` as a single new snapshot.
    pub async fn append(&self, files: Vec<DataFile>, branch: &str) -> Result<CommitResult> {
        self.append_with(AppendRequest::new(files).to_branch(branch))
            .await
    }

    /// Append with summary properties and an optional idempotency key.
    ///
    /// Either every file becomes visible in one snapshot or none does.
    /// Conflicts are retried up to `max_retries` times and then reported as
    /// [`CommitError::Conflict`]. A swap whose outcome is unknown is reported
    /// as [`CommitError::Indeterminate`] and never retried; use
    /// [`CommitCoordinator::resolve_commit`] to find out whether it landed.
    pub async fn append_with(&self, request: AppendRequest) -> Result<CommitResult> {
        self.stats.commits_attempted.fetch_add(1, Ordering::Relaxed);

        let result = self.commit_with_retry(&request).await;

        match &result {
            Ok(r) if r.was_idempotent => {}
            Ok(_) => {
                self.stats.commits_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.commits_failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        result
    }

    async fn commit_with_retry(&self, request: &AppendRequest) -> Result<CommitResult> {
        request.validate()?;

        let _guard = self.commit_lock.lock().await;
        let start = Instant::now();
        let commit_id = Uuid::new_v4().to_string();
        let mut retries = 0;

        loop {
            let base = self.table.refresh().await?;
            let metadata = base.metadata.clone();

            if let Some(existing) = metadata.snapshot_ref(&request.branch) {
                if !existing.is_branch() {
                    return Err(CommitError::RefIsNotBranch(request.branch.clone()).into());
                }
            }
            for file in &request.files {
                metadata.validate_data_file(file)?;
            }

            if let Some(key) = &request.idempotency_key {
                if let Some(existing) = find_idempotent(&metadata, &request.branch, key) {
                    self.stats
                        .idempotent_returns
                        .fetch_add(1, Ordering::Relaxed);
                    info!(
                        snapshot_id = existing.snapshot_id,
                        branch = %request.branch,
                        idempotency_key = %key,
                        "Idempotent return: key already committed"
                    );
                    return Ok(idempotent_result(existing, &request.branch));
                }
            }

            let parent = metadata
                .snapshot_for_ref(&request.branch)
                .or_else(|| metadata.current_snapshot());

            let pending = SnapshotProducer {
                io: self.table.io(),
                location: self.table.location(),
                base: &base,
                request,
                parent,
                commit_id: &commit_id,
                attempt: retries,
            }
            .produce()
            .await?;

            let outcome = match self.propose(&base, pending.metadata).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    delete_files(self.table.io(), &pending.written).await;
                    return Err(e);
                }
            };

            match outcome {
                CommitOutcome::Committed(state) => {
                    let metadata_location = state.metadata_location.clone();
                    self.table.update_state(state);

                    info!(
                        snapshot_id = pending.snapshot.snapshot_id,
                        branch = %request.branch,
                        files = request.files.len(),
                        records = pending.records_added,
                        retries = retries,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Snapshot committed"
                    );

                    return Ok(CommitResult {
                        snapshot_id: pending.snapshot.snapshot_id,
                        parent_snapshot_id: pending.snapshot.parent_snapshot_id,
                        sequence_number: pending.snapshot.sequence_number,
                        branch: request.branch.clone(),
                        commit_id,
                        committed_at: committed_at(&pending.snapshot),
                        files_added: request.files.len(),
                        records_added: pending.records_added,
                        retries,
                        was_idempotent: false,
                        metadata_location: Some(metadata_location),
                    });
                }
                CommitOutcome::Conflict(message) => {
                    self.stats.cas_conflicts.fetch_add(1, Ordering::Relaxed);
                    delete_files(self.table.io(), &pending.written).await;

                    retries += 1;
                    if retries > self.config.max_retries {
                        warn!(
                            branch = %request.branch,
                            attempts = retries,
                            reason = %message,
                            "CAS conflict: max retries exceeded"
                        );
                        return Err(CommitError::Conflict {
                            attempts: retries,
                            message,
                        }
                        .into());
                    }

                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.config.backoff(retries);
                    debug!(
                        branch = %request.branch,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        reason = %message,
                        "CAS conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                CommitOutcome::Indeterminate(reason) => {
                    warn!(
                        commit_id = %commit_id,
                        snapshot_id = pending.snapshot.snapshot_id,
                        reason = %reason,
                        "Commit outcome unknown"
                    );
                    return Err(CommitError::Indeterminate { commit_id, reason }.into());
                }
            }
        }
    }

    async fn propose(&self, base: &TableState, metadata: TableMetadata) -> Result<CommitOutcome> {
        let exchange = self.table.operations().commit(base, metadata);
        match self.config.commit_timeout {
            None => exchange.await,
            Some(timeout) => match tokio::time::timeout(timeout, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(CommitOutcome::Indeterminate(format!(
                    "metadata swap timed out after {} ms",
                    timeout.as_millis()
                ))),
            },
        }
    }

    /// Snapshot id of the commit, if it is part of the table.
    ///
    /// Refreshes the table first, so this settles an indeterminate outcome.
    pub async fn resolve_commit(&self, commit_id: &str) -> Result<Option<i64>> {
        let state = self.table.refresh().await?;
        let found = state
            .metadata
            .snapshots
            .iter()
            .find(|s| s.commit_id() == Some(commit_id))
            .map(|s| s.snapshot_id);

        debug!(commit_id = %commit_id, snapshot_id = ?found, "Resolved commit");
        Ok(found)
    }

    /// The earlier append to `branch` recorded under `key`, if any.
    ///
    /// Lets callers skip writing data files for a batch that already landed.
    pub async fn committed_with_key(
        &self,
        branch: &str,
        key: &str,
    ) -> Result<Option<CommitResult>> {
        let state = self.table.refresh().await?;
        Ok(find_idempotent(&state.metadata, branch, key)
            .map(|snapshot| idempotent_result(snapshot, branch)))
    }
}

fn find_idempotent<'a>(
    metadata: &'a TableMetadata,
    branch: &str,
    key: &str,
) -> Option<&'a Snapshot> {
    metadata
        .history(branch)
        .into_iter()
        .find(|s| s.summary.get(IDEMPOTENCY_KEY) == Some(key))
}

fn committed_at(snapshot: &Snapshot) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(snapshot.timestamp_ms).unwrap_or_else(Utc::now)
}

fn idempotent_result(snapshot: &Snapshot, branch: &str) -> CommitResult {
    CommitResult {
        snapshot_id: snapshot.snapshot_id,
        parent_snapshot_id: snapshot.parent_snapshot_id,
        sequence_number: snapshot.sequence_number,
        branch: branch.to_string(),
        commit_id: snapshot.commit_id().unwrap_or_default().to_string(),
        committed_at: committed_at(snapshot),
        files_added: snapshot.summary.get_u64(ADDED_DATA_FILES) as usize,
        records_added: snapshot.added_records(),
        retries: 0,
        was_idempotent: true,
        metadata_location: None,
    }
}

/// Builder for CommitCoordinator.
///
/// Without an explicit config, the defaults are combined with the table's
/// `commit.retry.*` properties.
pub struct CommitCoordinatorBuilder {
    table: Option<Arc<Table>>,
    config: Option<CommitCoordinatorConfig>,
    max_retries: Option<u32>,
    commit_timeout: Option<Duration>,
}

impl CommitCoordinatorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            table: None,
            config: None,
            max_retries: None,
            commit_timeout: None,
        }
    }

    /// Set the table.
    pub fn table(mut self, table: Arc<Table>) -> Self {
        self.table = Some(table);
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: CommitCoordinatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set max retries.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Bound each metadata swap.
    pub fn commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = Some(timeout);
        self
    }

    /// Build the CommitCoordinator.
    pub fn build(self) -> Result<CommitCoordinator> {
        let table = self
            .table
            .ok_or_else(|| Error::Config("CommitCoordinator requires a table".to_string()))?;

        let mut config = match self.config {
            Some(config) => config,
            None => CommitCoordinatorConfig::default()
                .with_table_properties(&table.metadata().properties)?,
        };
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(timeout) = self.commit_timeout {
            config.commit_timeout = Some(timeout);
        }

        Ok(CommitCoordinator::new(table, config))
    }
}

impl Default for CommitCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FilesystemTableOperations, FilesystemTables, TableCreation};
    use crate::commit::COMMIT_NUM_RETRIES;
    use crate::io::FileIo;
    use crate::spec::{
        FileFormat, NestedField, PrimitiveType, Schema, SnapshotRef, TableIdent, MAIN_BRANCH,
    };
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    /// Table operations that report a conflict for the first `conflicts`
    /// commits and can stall after a real commit.
    struct MockOpsWithCas {
        inner: FilesystemTableOperations,
        conflicts: AtomicU32,
        stall_after_commit: Option<Duration>,
    }

    #[async_trait]
    impl TableOperations for MockOpsWithCas {
        async fn refresh(&self) -> Result<TableState> {
            self.inner.refresh().await
        }

        async fn commit(
            &self,
            base: &TableState,
            metadata: TableMetadata,
        ) -> Result<CommitOutcome> {
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                return Ok(CommitOutcome::Conflict("simulated".into()));
            }
            let outcome = self.inner.commit(base, metadata).await?;
            if let Some(stall) = self.stall_after_commit {
                tokio::time::sleep(stall).await;
            }
            Ok(outcome)
        }

        fn io(&self) -> &FileIo {
            self.inner.io()
        }

        fn location(&self) -> &str {
            self.inner.location()
        }
    }

    async fn table_with(
        temp_dir: &TempDir,
        conflicts: u32,
        stall_after_commit: Option<Duration>,
        properties: BTreeMap<String, String>,
    ) -> Arc<Table> {
        let location = format!("{}/t", temp_dir.path().to_str().unwrap());
        let schema =
            Schema::new(0, vec![NestedField::required(1, "id", PrimitiveType::Long)]).unwrap();
        let mut creation = TableCreation::new(schema);
        creation.properties = properties;
        FilesystemTables::new(BTreeMap::new())
            .create(&location, creation)
            .await
            .unwrap();

        let io = FileIo::from_location(&location, BTreeMap::new()).unwrap();
        let ops = Arc::new(MockOpsWithCas {
            inner: FilesystemTableOperations::new(&location, io),
            conflicts: AtomicU32::new(conflicts),
            stall_after_commit,
        });
        let state = ops.refresh().await.unwrap();
        Arc::new(Table::new(TableIdent::from_location(&location), ops, state))
    }

    fn data_file(table: &Table, name: &str, records: u64) -> DataFile {
        DataFile::builder(FileFormat::Parquet)
            .with_path(format!("{}/data/{}.parquet", table.location(), name))
            .with_record_count(records)
            .with_file_size_in_bytes(1024)
            .build()
            .unwrap()
    }

    fn fast_config(max_retries: u32) -> CommitCoordinatorConfig {
        CommitCoordinatorConfig {
            max_retries,
            min_wait_ms: 1,
            max_wait_ms: 5,
            commit_timeout: None,
        }
    }

    fn metadata_files(table: &Table) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(format!("{}/metadata", table.location()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_commit_success() {
        let temp_dir = TempDir::new().unwrap();
        let table = table_with(&temp_dir, 0, None, BTreeMap::new()).await;
        let coordinator = CommitCoordinator::new(table.clone(), fast_config(4));

        let first = coordinator
            .append(vec![data_file(&table, "a", 5), data_file(&table, "b", 5)], MAIN_BRANCH)
            .await
            .unwrap();
        assert_eq!(first.parent_snapshot_id, None);
        assert_eq!(first.files_added, 2);
        assert_eq!(first.records_added, 10);
        assert_eq!(first.retries, 0);

        let second = coordinator
            .append(vec![data_file(&table, "c", 3)], MAIN_BRANCH)
            .await
            .unwrap();
        assert_eq!(second.parent_snapshot_id, Some(first.snapshot_id));
        assert_eq!(second.sequence_number, first.sequence_number + 1);

        let current = table.current_snapshot().unwrap();
        assert_eq!(current.snapshot_id, second.snapshot_id);
        assert_eq!(current.record_count(), 13);
        assert_eq!(table.data_files(&current).await.unwrap().len(), 3);
        assert_eq!(coordinator.stats().commits_succeeded.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_commit_with_retry() {
        let temp_dir = TempDir::new().unwrap();
        let table = table_with(&temp_dir, 2, None, BTreeMap::new()).await;
        let coordinator = CommitCoordinator::new(table.clone(), fast_config(4));

        let result = coordinator
            .append(vec![data_file(&table, "a", 5)], MAIN_BRANCH)
            .await
            .unwrap();
        assert_eq!(result.retries, 2);

        let stats = coordinator.stats();
        assert_eq!(stats.cas_conflicts.load(Ordering::Relaxed), 2);
        assert_eq!(stats.retries.load(Ordering::Relaxed), 2);

        // Only the winning attempt's manifest and manifest list remain.
        let files = metadata_files(&table);
        assert_eq!(files.iter().filter(|f| f.starts_with("snap-")).count(), 1);
        assert_eq!(files.iter().filter(|f| f.ends_with("-m0.json")).count(), 1);
    }

    #[tokio::test]
    async fn test_commit_max_retries_exceeded() {
        let temp_dir = TempDir::new().unwrap();
        let table = table_with(&temp_dir, 10, None, BTreeMap::new()).await;
        let coordinator = CommitCoordinator::new(table.clone(), fast_config(2));

        let err = coordinator
            .append(vec![data_file(&table, "a", 5)], MAIN_BRANCH)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Commit(CommitError::Conflict { attempts: 3, .. })
        ));
        assert!(err.is_conflict());

        assert!(table.current_snapshot().is_none());
        assert_eq!(
            metadata_files(&table),
            vec!["v1.metadata.json".to_string(), "version-hint.text".to_string()]
        );
        assert_eq!(coordinator.stats().commits_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_empty_commit_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let table = table_with(&temp_dir, 0, None, BTreeMap::new()).await;
        let coordinator = CommitCoordinator::new(table, fast_config(4));

        let err = coordinator.append(Vec::new(), MAIN_BRANCH).await.unwrap_err();
        assert!(matches!(err, Error::Commit(CommitError::EmptyCommit)));
    }

    #[tokio::test]
    async fn test_idempotency() {
        let temp_dir = TempDir::new().unwrap();
        let table = table_with(&temp_dir, 0, None, BTreeMap::new()).await;
        let coordinator = CommitCoordinator::new(table.clone(), fast_config(4));

        let request = AppendRequest::new(vec![data_file(&table, "a", 5)])
            .with_idempotency_key("batch-42");
        let first = coordinator.append_with(request.clone()).await.unwrap();
        let second = coordinator.append_with(request).await.unwrap();

        assert!(!first.was_idempotent);
        assert!(second.was_idempotent);
        assert_eq!(second.snapshot_id, first.snapshot_id);
        assert_eq!(second.commit_id, first.commit_id);
        assert_eq!(second.records_added, 5);
        assert_eq!(table.history(MAIN_BRANCH).len(), 1);
        assert_eq!(
            coordinator.stats().idempotent_returns.load(Ordering::Relaxed),
            1
        );

        let found = coordinator
            .committed_with_key(MAIN_BRANCH, "batch-42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.snapshot_id, first.snapshot_id);
        assert!(coordinator
            .committed_with_key(MAIN_BRANCH, "batch-43")
            .await
            .unwrap()
            .is_none());
        assert!(coordinator
            .committed_with_key("other", "batch-42")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_tags_are_not_branches() {
        let temp_dir = TempDir::new().unwrap();
        let table = table_with(&temp_dir, 0, None, BTreeMap::new()).await;
        let coordinator = CommitCoordinator::new(table.clone(), fast_config(4));
        let first = coordinator
            .append(vec![data_file(&table, "a", 1)], MAIN_BRANCH)
            .await
            .unwrap();

        let base = table.refresh().await.unwrap();
        let mut tagged = (*base.metadata).clone();
        tagged
            .refs
            .insert("release".to_string(), SnapshotRef::tag(first.snapshot_id));
        table.operations().commit(&base, tagged).await.unwrap();

        let err = coordinator
            .append(vec![data_file(&table, "b", 1)], "release")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Commit(CommitError::RefIsNotBranch(_))));
    }

    #[tokio::test]
    async fn test_timeout_is_indeterminate_and_resolvable() {
        let temp_dir = TempDir::new().unwrap();
        let table = table_with(
            &temp_dir,
            0,
            Some(Duration::from_secs(2)),
            BTreeMap::new(),
        )
        .await;
        let coordinator = CommitCoordinator::builder()
            .table(table.clone())
            .config(fast_config(4))
            .commit_timeout(Duration::from_millis(300))
            .build()
            .unwrap();

        let err = coordinator
            .append(vec![data_file(&table, "a", 5)], MAIN_BRANCH)
            .await
            .unwrap_err();
        assert!(err.is_indeterminate());
        let Error::Commit(CommitError::Indeterminate { commit_id, .. }) = err else {
            panic!("expected indeterminate commit");
        };

        let resolved = coordinator.resolve_commit(&commit_id).await.unwrap();
        assert_eq!(resolved, table.current_snapshot().map(|s| s.snapshot_id));
        assert!(resolved.is_some());
        assert_eq!(coordinator.resolve_commit("unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_builder_pattern() {
        let temp_dir = TempDir::new().unwrap();
        let props = BTreeMap::from([(COMMIT_NUM_RETRIES.to_string(), "9".to_string())]);
        let table = table_with(&temp_dir, 0, None, props).await;

        let coordinator = CommitCoordinator::builder()
            .table(table.clone())
            .build()
            .unwrap();
        assert_eq!(coordinator.config().max_retries, 9);

        let coordinator = CommitCoordinator::builder()
            .table(table)
            .max_retries(1)
            .build()
            .unwrap();
        assert_eq!(coordinator.config().max_retries, 1);

        assert!(CommitCoordinator::builder().build().is_err());
    }
}
