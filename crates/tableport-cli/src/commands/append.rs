//! Append command implementation.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tableport_core::commit::CommitCoordinatorConfig;
use tableport_core::spec::Record;
use tableport_core::{
    AppendRequest, CommitCoordinator, CommitResult, Config, FileMetadataBuilder,
};
use tracing::{info, warn};

/// Write the records of a JSON-lines file and commit them as one snapshot.
pub async fn run(
    config: &Config,
    records_path: &Path,
    branch: Option<String>,
    idempotency_key: Option<String>,
) -> Result<()> {
    let result = append(config, records_path, branch, idempotency_key).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "snapshot-id": result.snapshot_id,
            "parent-snapshot-id": result.parent_snapshot_id,
            "sequence-number": result.sequence_number,
            "branch": result.branch,
            "commit-id": result.commit_id,
            "files-added": result.files_added,
            "records-added": result.records_added,
            "retries": result.retries,
            "idempotent": result.was_idempotent,
        }))?
    );
    Ok(())
}

/// Append the records of `records_path` to the configured table.
///
/// Retry settings start from the `[commit]` section; the table's
/// `commit.retry.*` properties take precedence over it. A key that is
/// already on the branch returns the earlier commit without writing files.
pub async fn append(
    config: &Config,
    records_path: &Path,
    branch: Option<String>,
    idempotency_key: Option<String>,
) -> Result<CommitResult> {
    let content = std::fs::read_to_string(records_path)
        .with_context(|| format!("Cannot read {}", records_path.display()))?;
    let branch = branch.unwrap_or_else(|| config.commit.branch.clone());

    let mut loader = config.table_loader()?;
    let result = loader
        .with_table(|table| async move {
            let commit_config = commit_config(config, &table.metadata().properties)?;
            let coordinator = CommitCoordinator::builder()
                .table(table.clone())
                .config(commit_config)
                .build()?;

            if let Some(key) = &idempotency_key {
                if let Some(existing) = coordinator.committed_with_key(&branch, key).await? {
                    info!(
                        snapshot_id = existing.snapshot_id,
                        idempotency_key = %key,
                        "Batch already committed, nothing written"
                    );
                    return Ok(existing);
                }
            }

            let schema = table.metadata().current_schema()?.clone();
            let records = content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| {
                    serde_json::from_str::<serde_json::Value>(line)
                        .map_err(tableport_core::Error::from)
                        .and_then(|json| schema.record_from_json(&json))
                })
                .collect::<tableport_core::Result<Vec<Record>>>()?;

            let files = FileMetadataBuilder::new(table.clone())
                .with_format(config.write.format)
                .with_properties(config.write.properties.clone())
                .write_partitioned(&records)
                .await?;
            let written: Vec<String> =
                files.iter().map(|f| f.file_path().to_string()).collect();

            let mut request = AppendRequest::new(files)
                .to_branch(branch)
                .with_summary("tableport.source", records_path.display().to_string());
            if let Some(key) = idempotency_key {
                request = request.with_idempotency_key(key);
            }

            let result = coordinator.append_with(request).await;
            if let Err(e) = &result {
                // Files of an unknown outcome may be referenced by the table
                if !e.is_indeterminate() {
                    for location in &written {
                        if let Err(err) = table.io().delete(location).await {
                            warn!(location = %location, error = %err, "Failed to delete data file");
                        }
                    }
                }
            }
            result
        })
        .await;

    match result {
        Ok(result) => Ok(result),
        Err(tableport_core::Error::Commit(tableport_core::CommitError::EmptyCommit)) => {
            bail!("{} contains no records", records_path.display())
        }
        Err(e) => Err(e.into()),
    }
}

/// The `[commit]` section overlaid with the table's `commit.retry.*` properties.
fn commit_config(
    config: &Config,
    table_properties: &BTreeMap<String, String>,
) -> tableport_core::Result<CommitCoordinatorConfig> {
    CommitCoordinatorConfig::from(&config.commit).with_table_properties(table_properties)
}
