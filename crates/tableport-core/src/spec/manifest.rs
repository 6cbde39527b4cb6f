//! Manifests and manifest lists.
//!
//! Both are stored as JSON documents next to the table metadata.

use super::data_file::DataFile;
use crate::io::FileIo;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Whether an entry was added, carried over or removed by its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStatus {
    Existing,
    Added,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestEntry {
    pub status: ManifestStatus,
    pub snapshot_id: i64,
    pub sequence_number: i64,
    pub data_file: DataFile,
}

/// A set of data file entries sharing one partition spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Manifest {
    pub spec_id: i32,
    pub schema_id: i32,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub async fn read(io: &FileIo, location: &str) -> Result<Self> {
        let bytes = io.new_input(location)?.read().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write the manifest and return its summary for a manifest list.
    pub async fn write(
        &self,
        io: &FileIo,
        location: &str,
        added_snapshot_id: i64,
        sequence_number: i64,
    ) -> Result<ManifestFile> {
        let json = serde_json::to_vec(self)?;
        let mut output = io.new_output(location)?;
        output.write_all(&json)?;
        let length = output.close().await?;

        let count = |status: ManifestStatus| {
            self.entries
                .iter()
                .filter(|e| e.status == status)
                .fold((0u64, 0u64), |(files, rows), e| {
                    (files + 1, rows + e.data_file.record_count())
                })
        };
        let (added_files, added_rows) = count(ManifestStatus::Added);
        let (existing_files, existing_rows) = count(ManifestStatus::Existing);
        let (deleted_files, deleted_rows) = count(ManifestStatus::Deleted);

        Ok(ManifestFile {
            manifest_path: location.to_string(),
            manifest_length: length,
            partition_spec_id: self.spec_id,
            added_snapshot_id,
            sequence_number,
            added_files_count: added_files,
            existing_files_count: existing_files,
            deleted_files_count: deleted_files,
            added_rows_count: added_rows,
            existing_rows_count: existing_rows,
            deleted_rows_count: deleted_rows,
        })
    }

    /// Data files visible through this manifest.
    pub fn live_files(&self) -> impl Iterator<Item = &DataFile> {
        self.entries
            .iter()
            .filter(|e| e.status != ManifestStatus::Deleted)
            .map(|e| &e.data_file)
    }
}

/// Summary of one manifest, as listed in a manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestFile {
    pub manifest_path: String,
    pub manifest_length: u64,
    pub partition_spec_id: i32,
    pub added_snapshot_id: i64,
    pub sequence_number: i64,
    pub added_files_count: u64,
    pub existing_files_count: u64,
    pub deleted_files_count: u64,
    pub added_rows_count: u64,
    pub existing_rows_count: u64,
    pub deleted_rows_count: u64,
}

/// Every manifest that makes up a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestList {
    pub snapshot_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<i64>,
    pub sequence_number: i64,
    pub manifests: Vec<ManifestFile>,
}

impl ManifestList {
    pub async fn read(io: &FileIo, location: &str) -> Result<Self> {
        let bytes = io.new_input(location)?.read().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn write(&self, io: &FileIo, location: &str) -> Result<u64> {
        let json = serde_json::to_vec(self)?;
        let mut output = io.new_output(location)?;
        output.write_all(&json)?;
        output.close().await
    }

    /// Read every manifest and collect the live data files.
    pub async fn data_files(&self, io: &FileIo) -> Result<Vec<DataFile>> {
        let mut files = Vec::new();
        for manifest_file in &self.manifests {
            let manifest = Manifest::read(io, &manifest_file.manifest_path).await?;
            files.extend(manifest.live_files().cloned());
        }
        Ok(files)
    }
}
