use super::AppendRequest;
use crate::catalog::TableState;
use crate::io::FileIo;
use crate::spec::snapshot::summary::{
    ADDED_DATA_FILES, ADDED_FILES_SIZE, ADDED_RECORDS, CHANGED_PARTITION_COUNT, COMMIT_ID,
    IDEMPOTENCY_KEY, TOTAL_DATA_FILES, TOTAL_FILES_SIZE, TOTAL_RECORDS,
};
use crate::spec::{
    DataFile, Manifest, ManifestEntry, ManifestList, ManifestStatus, Operation, PartitionData,
    Snapshot, Summary, TableMetadata,
};
use crate::Result;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Everything one attempt prepared, ready to be swapped in.
pub(super) struct PendingSnapshot {
    pub snapshot: Snapshot,
    pub metadata: TableMetadata,
    /// Manifest and manifest list files written by this attempt
    pub written: Vec<String>,
    pub records_added: u64,
}

/// Builds the manifests, manifest list and metadata for one append attempt.
pub(super) struct SnapshotProducer<'a> {
    pub io: &'a FileIo,
    pub location: &'a str,
    pub base: &'a TableState,
    pub request: &'a AppendRequest,
    pub parent: Option<&'a Snapshot>,
    pub commit_id: &'a str,
    pub attempt: u32,
}

impl SnapshotProducer<'_> {
    /// Write this attempt's files. Nothing is left behind on failure.
    pub async fn produce(&self) -> Result<PendingSnapshot> {
        let mut written = Vec::new();
        match self.build(&mut written).await {
            Ok((snapshot, metadata, records_added)) => Ok(PendingSnapshot {
                snapshot,
                metadata,
                written,
                records_added,
            }),
            Err(e) => {
                delete_files(self.io, &written).await;
                Err(e)
            }
        }
    }

    async fn build(&self, written: &mut Vec<String>) -> Result<(Snapshot, TableMetadata, u64)> {
        let metadata = &self.base.metadata;
        let snapshot_id = new_snapshot_id(metadata);
        let sequence_number = metadata.last_sequence_number + 1;

        let mut by_spec: BTreeMap<i32, Vec<&DataFile>> = BTreeMap::new();
        for file in &self.request.files {
            by_spec.entry(file.spec_id()).or_default().push(file);
        }

        let manifest_id = Uuid::new_v4();
        let mut manifests = Vec::new();
        for (index, (spec_id, files)) in by_spec.into_iter().enumerate() {
            let manifest = Manifest {
                spec_id,
                schema_id: metadata.current_schema_id,
                entries: files
                    .into_iter()
                    .map(|file| ManifestEntry {
                        status: ManifestStatus::Added,
                        snapshot_id,
                        sequence_number,
                        data_file: file.clone(),
                    })
                    .collect(),
            };
            let manifest_location =
                format!("{}/metadata/{}-m{}.json", self.location, manifest_id, index);
            written.push(manifest_location.clone());
            manifests.push(
                manifest
                    .write(self.io, &manifest_location, snapshot_id, sequence_number)
                    .await?,
            );
        }

        if let Some(parent) = self.parent {
            let parent_list = ManifestList::read(self.io, &parent.manifest_list).await?;
            manifests.extend(parent_list.manifests);
        }

        let list = ManifestList {
            snapshot_id,
            parent_snapshot_id: self.parent.map(|p| p.snapshot_id),
            sequence_number,
            manifests,
        };
        let list_location = format!(
            "{}/metadata/snap-{}-{}-{}.json",
            self.location,
            snapshot_id,
            self.attempt,
            Uuid::new_v4()
        );
        written.push(list_location.clone());
        list.write(self.io, &list_location).await?;

        let records_added: u64 = self.request.files.iter().map(DataFile::record_count).sum();
        let snapshot = Snapshot {
            snapshot_id,
            parent_snapshot_id: self.parent.map(|p| p.snapshot_id),
            sequence_number,
            timestamp_ms: chrono::Utc::now()
                .timestamp_millis()
                .max(metadata.last_updated_ms),
            manifest_list: list_location,
            summary: self.summary(records_added),
            schema_id: Some(metadata.current_schema_id),
        };

        debug!(
            snapshot_id = snapshot_id,
            parent_snapshot_id = ?snapshot.parent_snapshot_id,
            sequence_number = sequence_number,
            attempt = self.attempt,
            "Prepared snapshot"
        );

        let next = metadata.with_appended_snapshot(
            snapshot.clone(),
            &self.request.branch,
            Some(&self.base.metadata_location),
        );
        Ok((snapshot, next, records_added))
    }

    fn summary(&self, records_added: u64) -> Summary {
        let files = &self.request.files;
        let added_size: u64 = files.iter().map(DataFile::file_size_in_bytes).sum();

        let mut partitions: Vec<Option<&PartitionData>> = Vec::new();
        for file in files {
            if !partitions.contains(&file.partition()) {
                partitions.push(file.partition());
            }
        }

        let parent_total = |key: &str| self.parent.map_or(0, |p| p.summary.get_u64(key));

        let mut properties = self.request.summary.clone();
        properties.insert(ADDED_DATA_FILES.into(), files.len().to_string());
        properties.insert(ADDED_RECORDS.into(), records_added.to_string());
        properties.insert(ADDED_FILES_SIZE.into(), added_size.to_string());
        properties.insert(
            CHANGED_PARTITION_COUNT.into(),
            partitions.len().to_string(),
        );
        properties.insert(
            TOTAL_DATA_FILES.into(),
            (parent_total(TOTAL_DATA_FILES) + files.len() as u64).to_string(),
        );
        properties.insert(
            TOTAL_RECORDS.into(),
            (parent_total(TOTAL_RECORDS) + records_added).to_string(),
        );
        properties.insert(
            TOTAL_FILES_SIZE.into(),
            (parent_total(TOTAL_FILES_SIZE) + added_size).to_string(),
        );
        properties.insert(COMMIT_ID.into(), self.commit_id.to_string());
        if let Some(key) = &self.request.idempotency_key {
            properties.insert(IDEMPOTENCY_KEY.into(), key.clone());
        }

        Summary {
            operation: Operation::Append,
            properties,
        }
    }
}

/// Positive snapshot id not yet used by the table.
fn new_snapshot_id(metadata: &TableMetadata) -> i64 {
    loop {
        let (hi, lo) = Uuid::new_v4().as_u64_pair();
        let id = ((hi ^ lo) & i64::MAX as u64) as i64;
        if id != 0 && metadata.snapshot_by_id(id).is_none() {
            return id;
        }
    }
}

/// Best-effort removal of files an attempt wrote.
pub(super) async fn delete_files(io: &FileIo, files: &[String]) {
    for location in files {
        if let Err(e) = io.delete(location).await {
            warn!(location = %location, error = %e, "Failed to delete uncommitted file");
        }
    }
}
