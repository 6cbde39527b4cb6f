//! Snapshot and file listing commands.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tableport_core::spec::snapshot::summary::{ADDED_RECORDS, TOTAL_RECORDS};
use tableport_core::Config;

/// Print the history of a branch or tag, newest first.
pub async fn snapshots(config: &Config, ref_name: &str) -> Result<()> {
    let mut loader = config.table_loader()?;
    let history = loader
        .with_table(|table| async move { Ok(table.history(ref_name)) })
        .await?;

    if history.is_empty() {
        println!("No snapshots on {}", ref_name);
        return Ok(());
    }

    println!(
        "{:<20} {:<20} {:>6} {:<25} {:>10} {:>10}",
        "SNAPSHOT", "PARENT", "SEQ", "COMMITTED", "ADDED", "TOTAL"
    );
    for snapshot in history {
        let committed = DateTime::<Utc>::from_timestamp_millis(snapshot.timestamp_ms)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        println!(
            "{:<20} {:<20} {:>6} {:<25} {:>10} {:>10}",
            snapshot.snapshot_id,
            snapshot
                .parent_snapshot_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".into()),
            snapshot.sequence_number,
            committed,
            snapshot.summary.get(ADDED_RECORDS).unwrap_or("0"),
            snapshot.summary.get(TOTAL_RECORDS).unwrap_or("0"),
        );
    }
    Ok(())
}

/// Print the live data files of a branch or tag.
pub async fn files(config: &Config, ref_name: &str) -> Result<()> {
    let mut loader = config.table_loader()?;
    let files = loader
        .with_table(|table| async move {
            match table.snapshot_for_ref(ref_name) {
                Some(snapshot) => table.data_files(&snapshot).await,
                None => Ok(Vec::new()),
            }
        })
        .await?;

    if files.is_empty() {
        println!("No data files on {}", ref_name);
        return Ok(());
    }

    for file in files {
        println!(
            "{}\t{}\t{} records\t{} bytes\tsplits={:?}",
            file.file_path(),
            file.file_format(),
            file.record_count(),
            file.file_size_in_bytes(),
            file.split_offsets()
        );
    }
    Ok(())
}
