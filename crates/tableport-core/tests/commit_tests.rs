//! Integration tests for writing data files and committing snapshots.

use async_trait::async_trait;
use bytes::Bytes;
use parquet::file::reader::{FileReader, SerializedFileReader};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tableport_core::catalog::{
    CommitOutcome, FilesystemTableOperations, FilesystemTables, Table, TableCreation,
    TableOperations, TableState,
};
use tableport_core::commit::CommitCoordinatorConfig;
use tableport_core::io::FileIo;
use tableport_core::spec::snapshot::summary::TOTAL_RECORDS;
use tableport_core::spec::{
    NestedField, PrimitiveType, Record, Schema, TableIdent, TableMetadata, Value, MAIN_BRANCH,
};
use tableport_core::writer::parquet::ROW_GROUP_ROW_LIMIT;
use tableport_core::{AppendRequest, CommitCoordinator, FileMetadataBuilder, Result, TableLoader};
use tempfile::TempDir;
use tokio::sync::Barrier;

fn schema() -> Schema {
    Schema::new(
        0,
        vec![
            NestedField::required(1, "id", PrimitiveType::Long),
            NestedField::optional(2, "region", PrimitiveType::String),
            NestedField::optional(3, "amount", PrimitiveType::Double),
        ],
    )
    .unwrap()
}

fn records(start: i64, count: i64) -> Vec<Record> {
    (start..start + count)
        .map(|id| {
            let region = match id % 3 {
                0 => Value::Null,
                1 => Value::String(format!("region-{}", id % 7)),
                _ => Value::String("eu".into()),
            };
            let amount = match id % 5 {
                0 => Value::Null,
                4 => Value::Double(f64::NAN),
                _ => Value::Double(id as f64 * 1.5 - 20.0),
            };
            Record::new(vec![Value::Long(id), region, amount])
        })
        .collect()
}

async fn create_table(temp_dir: &TempDir, creation: TableCreation) -> String {
    let location = format!("{}/events", temp_dir.path().to_str().unwrap());
    FilesystemTables::new(BTreeMap::new())
        .create(&location, creation)
        .await
        .unwrap();
    location
}

fn fast_config(max_retries: u32) -> CommitCoordinatorConfig {
    CommitCoordinatorConfig {
        max_retries,
        min_wait_ms: 1,
        max_wait_ms: 20,
        commit_timeout: None,
    }
}

/// Holds the first commit until every writer has prepared its snapshot.
struct BarrierOps {
    inner: FilesystemTableOperations,
    barrier: Arc<Barrier>,
    waited: AtomicBool,
}

#[async_trait]
impl TableOperations for BarrierOps {
    async fn refresh(&self) -> Result<TableState> {
        self.inner.refresh().await
    }

    async fn commit(&self, base: &TableState, metadata: TableMetadata) -> Result<CommitOutcome> {
        if !self.waited.swap(true, Ordering::SeqCst) {
            self.barrier.wait().await;
        }
        self.inner.commit(base, metadata).await
    }

    fn io(&self) -> &FileIo {
        self.inner.io()
    }

    fn location(&self) -> &str {
        self.inner.location()
    }
}

async fn worker_table(location: &str, barrier: Arc<Barrier>) -> Arc<Table> {
    let io = FileIo::from_location(location, BTreeMap::new()).unwrap();
    let ops = Arc::new(BarrierOps {
        inner: FilesystemTableOperations::new(location, io),
        barrier,
        waited: AtomicBool::new(false),
    });
    let state = ops.refresh().await.unwrap();
    Arc::new(Table::new(TableIdent::from_location(location), ops, state))
}

#[tokio::test]
async fn test_direct_path_append_creates_one_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let location = create_table(&temp_dir, TableCreation::new(schema())).await;

    let mut loader = TableLoader::from_path(&location, BTreeMap::new());
    loader.open().await.unwrap();
    let table = loader.load_table().unwrap();

    let file = FileMetadataBuilder::new(table.clone())
        .write_file(None, &records(0, 10))
        .await
        .unwrap();
    let coordinator = CommitCoordinator::new(table, fast_config(4));
    let result = coordinator.append(vec![file], MAIN_BRANCH).await.unwrap();
    loader.close().await.unwrap();

    let mut reader = TableLoader::from_path(&location, BTreeMap::new());
    reader.open().await.unwrap();
    let table = reader.load_table().unwrap();

    assert_eq!(table.metadata().snapshots.len(), 1);
    let snapshot = table.current_snapshot().unwrap();
    assert_eq!(snapshot.snapshot_id, result.snapshot_id);
    assert_eq!(snapshot.record_count(), 10);
    assert_eq!(table.data_files(&snapshot).await.unwrap().len(), 1);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_two_workers_from_the_same_base() {
    let temp_dir = TempDir::new().unwrap();
    let location = create_table(&temp_dir, TableCreation::new(schema())).await;

    let barrier = Arc::new(Barrier::new(2));
    let first = worker_table(&location, barrier.clone()).await;
    let second = worker_table(&location, barrier).await;

    let file_a = FileMetadataBuilder::new(first.clone())
        .write_file(None, &records(0, 5))
        .await
        .unwrap();
    let file_b = FileMetadataBuilder::new(second.clone())
        .write_file(None, &records(5, 5))
        .await
        .unwrap();

    let worker_a = CommitCoordinator::new(first, fast_config(4));
    let worker_b = CommitCoordinator::new(second.clone(), fast_config(4));
    let (a, b) = tokio::join!(
        worker_a.append(vec![file_a], MAIN_BRANCH),
        worker_b.append(vec![file_b], MAIN_BRANCH)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // Exactly one worker lost the race and rebased on the winner.
    assert_eq!(a.retries + b.retries, 1);
    let conflicts = worker_a.stats().cas_conflicts.load(Ordering::Relaxed)
        + worker_b.stats().cas_conflicts.load(Ordering::Relaxed);
    assert_eq!(conflicts, 1);
    let (winner, loser) = if a.retries == 0 { (&a, &b) } else { (&b, &a) };
    assert_eq!(loser.parent_snapshot_id, Some(winner.snapshot_id));

    let state = second.refresh().await.unwrap();
    let current = state.metadata.current_snapshot().unwrap();
    assert_eq!(current.snapshot_id, loser.snapshot_id);
    assert_eq!(current.summary.get(TOTAL_RECORDS), Some("10"));
    assert_eq!(second.data_files(current).await.unwrap().len(), 2);
    assert_eq!(state.metadata.history(MAIN_BRANCH).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commits_form_a_linear_history() {
    const WRITERS: i64 = 8;

    let temp_dir = TempDir::new().unwrap();
    let location = create_table(&temp_dir, TableCreation::new(schema())).await;

    let mut handles = Vec::new();
    for writer in 0..WRITERS {
        let location = location.clone();
        handles.push(tokio::spawn(async move {
            let mut loader = TableLoader::from_path(&location, BTreeMap::new());
            loader.open().await?;
            let table = loader.load_table()?;
            let file = FileMetadataBuilder::new(table.clone())
                .write_file(None, &records(writer * 100, writer + 1))
                .await?;
            let result = CommitCoordinator::new(table, fast_config(20))
                .append(vec![file], MAIN_BRANCH)
                .await;
            loader.close().await?;
            result
        }));
    }

    let mut committed = HashSet::new();
    for handle in handles {
        committed.insert(handle.await.unwrap().unwrap().snapshot_id);
    }
    assert_eq!(committed.len(), WRITERS as usize);

    let mut loader = TableLoader::from_path(&location, BTreeMap::new());
    loader.open().await.unwrap();
    let table = loader.load_table().unwrap();
    let metadata = table.metadata();

    let history = metadata.history(MAIN_BRANCH);
    assert_eq!(history.len(), WRITERS as usize);
    assert_eq!(metadata.snapshots.len(), WRITERS as usize);
    let ids: HashSet<i64> = history.iter().map(|s| s.snapshot_id).collect();
    assert_eq!(ids, committed);

    let parents: HashSet<Option<i64>> = history.iter().map(|s| s.parent_snapshot_id).collect();
    assert_eq!(parents.len(), WRITERS as usize);
    for pair in history.windows(2) {
        assert_eq!(pair[0].parent_snapshot_id, Some(pair[1].snapshot_id));
        assert_eq!(pair[0].sequence_number, pair[1].sequence_number + 1);
    }

    let current = metadata.current_snapshot().unwrap();
    let expected_records: u64 = (1..=WRITERS as u64).sum();
    assert_eq!(current.record_count(), expected_records);
    assert_eq!(
        table.data_files(current).await.unwrap().len(),
        WRITERS as usize
    );
    loader.close().await.unwrap();
}

#[tokio::test]
async fn test_branch_append_leaves_main_untouched() {
    let temp_dir = TempDir::new().unwrap();
    let location = create_table(&temp_dir, TableCreation::new(schema())).await;

    let mut loader = TableLoader::from_path(&location, BTreeMap::new());
    loader.open().await.unwrap();
    let table = loader.load_table().unwrap();
    let builder = FileMetadataBuilder::new(table.clone());
    let coordinator = CommitCoordinator::new(table.clone(), fast_config(4));

    let main = coordinator
        .append(vec![builder.write_file(None, &records(0, 4)).await.unwrap()], MAIN_BRANCH)
        .await
        .unwrap();

    for start in [10, 20] {
        let file = builder.write_file(None, &records(start, 3)).await.unwrap();
        coordinator.append(vec![file], "exp").await.unwrap();
        assert_eq!(
            table.snapshot_for_ref(MAIN_BRANCH).unwrap().snapshot_id,
            main.snapshot_id
        );
    }

    let exp = table.snapshot_for_ref("exp").unwrap();
    assert_eq!(exp.record_count(), 10);
    let exp_history = table.history("exp");
    assert_eq!(exp_history.len(), 3);
    assert_eq!(exp_history[2].snapshot_id, main.snapshot_id);

    let main_snapshot = table.current_snapshot().unwrap();
    assert_eq!(main_snapshot.snapshot_id, main.snapshot_id);
    assert_eq!(table.data_files(&main_snapshot).await.unwrap().len(), 1);
    assert_eq!(table.data_files(&exp).await.unwrap().len(), 3);
    loader.close().await.unwrap();
}

#[tokio::test]
async fn test_file_metrics_match_reference() {
    let temp_dir = TempDir::new().unwrap();
    let location = create_table(&temp_dir, TableCreation::new(schema())).await;
    let mut loader = TableLoader::from_path(&location, BTreeMap::new());
    loader.open().await.unwrap();

    let batch = records(1, 60);
    let file = FileMetadataBuilder::new(loader.load_table().unwrap())
        .write_file(None, &batch)
        .await
        .unwrap();

    let ids: Vec<i64> = (1..=60).collect();
    let regions: Vec<&str> = batch
        .iter()
        .filter_map(|r| match r.get(1) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    let amounts: Vec<f64> = batch
        .iter()
        .filter_map(|r| match r.get(2) {
            Some(Value::Double(d)) if !d.is_nan() => Some(*d),
            _ => None,
        })
        .collect();
    let null_regions = batch.iter().filter(|r| r.get(1) == Some(&Value::Null)).count() as u64;
    let null_amounts = batch.iter().filter(|r| r.get(2) == Some(&Value::Null)).count() as u64;
    let nan_amounts = batch
        .iter()
        .filter(|r| matches!(r.get(2), Some(Value::Double(d)) if d.is_nan()))
        .count() as u64;

    assert_eq!(file.record_count(), 60);
    assert_eq!(file.value_counts()[&1], 60);
    assert_eq!(file.value_counts()[&2], 60);
    assert_eq!(file.null_value_counts()[&2], null_regions);
    assert_eq!(file.null_value_counts()[&3], null_amounts);
    assert_eq!(file.nan_value_counts()[&3], nan_amounts);
    assert!(!file.nan_value_counts().contains_key(&1));

    assert_eq!(file.lower_bounds()[&1], Value::Long(*ids.iter().min().unwrap()));
    assert_eq!(file.upper_bounds()[&1], Value::Long(*ids.iter().max().unwrap()));
    assert_eq!(
        file.lower_bounds()[&2],
        Value::String(regions.iter().min().unwrap().to_string())
    );
    assert_eq!(
        file.upper_bounds()[&2],
        Value::String(regions.iter().max().unwrap().to_string())
    );
    let min_amount = amounts.iter().copied().fold(f64::INFINITY, f64::min);
    let max_amount = amounts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(file.lower_bounds()[&3], Value::Double(min_amount));
    assert_eq!(file.upper_bounds()[&3], Value::Double(max_amount));

    loader.close().await.unwrap();
}

#[tokio::test]
async fn test_split_offsets_match_parquet_footer() {
    let temp_dir = TempDir::new().unwrap();
    let creation = TableCreation::new(schema()).with_property(ROW_GROUP_ROW_LIMIT, "10");
    let location = create_table(&temp_dir, creation).await;
    let mut loader = TableLoader::from_path(&location, BTreeMap::new());
    loader.open().await.unwrap();

    let file = FileMetadataBuilder::new(loader.load_table().unwrap())
        .write_file(None, &records(0, 45))
        .await
        .unwrap();

    let bytes = Bytes::from(std::fs::read(file.file_path()).unwrap());
    assert_eq!(file.file_size_in_bytes(), bytes.len() as u64);

    let reader = SerializedFileReader::new(bytes).unwrap();
    let footer_offsets: Vec<u64> = reader
        .metadata()
        .row_groups()
        .iter()
        .map(|rg| rg.column(0).byte_range().0)
        .collect();

    assert_eq!(footer_offsets.len(), 5);
    assert_eq!(file.split_offsets(), footer_offsets.as_slice());
    assert!(file.split_offsets().windows(2).all(|w| w[0] < w[1]));
    loader.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_commit_leaves_no_visible_files() {
    let temp_dir = TempDir::new().unwrap();
    let location = create_table(&temp_dir, TableCreation::new(schema())).await;
    let mut loader = TableLoader::from_path(&location, BTreeMap::new());
    loader.open().await.unwrap();
    let table = loader.load_table().unwrap();

    let good = FileMetadataBuilder::new(table.clone())
        .write_file(None, &records(0, 5))
        .await
        .unwrap();
    let foreign = tableport_core::spec::DataFile::builder(Default::default())
        .with_path(format!("{}/data/foreign.parquet", location))
        .with_spec_id(7)
        .with_record_count(1)
        .with_file_size_in_bytes(10)
        .build()
        .unwrap();

    let coordinator = CommitCoordinator::new(table.clone(), fast_config(4));
    let err = coordinator
        .append(vec![good, foreign], MAIN_BRANCH)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        tableport_core::Error::Commit(tableport_core::CommitError::Validation(_))
    ));

    let state = table.refresh().await.unwrap();
    assert_eq!(state.version, 1);
    assert!(state.metadata.current_snapshot().is_none());
    loader.close().await.unwrap();
}

#[tokio::test]
async fn test_infinite_bounds_can_be_read_back() {
    let temp_dir = TempDir::new().unwrap();
    let location = create_table(&temp_dir, TableCreation::new(schema())).await;
    let mut loader = TableLoader::from_path(&location, BTreeMap::new());
    loader.open().await.unwrap();
    let table = loader.load_table().unwrap();

    let rows = vec![
        Record::new(vec![
            Value::Long(1),
            Value::String("eu".into()),
            Value::Double(f64::INFINITY),
        ]),
        Record::new(vec![Value::Long(2), Value::Null, Value::Double(1.0)]),
    ];
    let file = FileMetadataBuilder::new(table.clone())
        .write_file(None, &rows)
        .await
        .unwrap();
    assert_eq!(file.upper_bounds()[&3], Value::Double(f64::INFINITY));

    CommitCoordinator::new(table, fast_config(4))
        .append(vec![file], MAIN_BRANCH)
        .await
        .unwrap();
    loader.close().await.unwrap();

    let mut reader = TableLoader::from_path(&location, BTreeMap::new());
    reader.open().await.unwrap();
    let table = reader.load_table().unwrap();
    let files = table
        .data_files(&table.current_snapshot().unwrap())
        .await
        .unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].lower_bounds()[&3], Value::Double(1.0));
    assert_eq!(files[0].upper_bounds()[&3], Value::Double(f64::INFINITY));
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_reserved_summary_key_is_rejected_before_commit() {
    let temp_dir = TempDir::new().unwrap();
    let location = create_table(&temp_dir, TableCreation::new(schema())).await;
    let mut loader = TableLoader::from_path(&location, BTreeMap::new());
    loader.open().await.unwrap();
    let table = loader.load_table().unwrap();

    let file = FileMetadataBuilder::new(table.clone())
        .write_file(None, &records(0, 3))
        .await
        .unwrap();
    let coordinator = CommitCoordinator::new(table.clone(), fast_config(4));
    let err = coordinator
        .append_with(AppendRequest::new(vec![file.clone()]).with_summary("operation", "custom"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        tableport_core::Error::Commit(tableport_core::CommitError::Validation(_))
    ));

    let result = coordinator
        .append_with(AppendRequest::new(vec![file]).with_summary("source", "job-7"))
        .await
        .unwrap();
    loader.close().await.unwrap();

    let mut reader = TableLoader::from_path(&location, BTreeMap::new());
    reader.open().await.unwrap();
    let snapshot = reader.load_table().unwrap().current_snapshot().unwrap();
    assert_eq!(snapshot.snapshot_id, result.snapshot_id);
    assert_eq!(snapshot.summary.get("source"), Some("job-7"));
    assert_eq!(snapshot.summary.get("operation"), None);
    reader.close().await.unwrap();
}
