use super::parquet::{column_sizes, split_offsets, ParquetAppender};
use super::{FileAppender, FormatProperties};
use crate::catalog::Table;
use crate::spec::{DataFile, FileFormat, Metrics, PartitionData, PartitionSpec, Record, Schema};
use crate::{Error, Result, WriteError};
use parquet::file::reader::{FileReader, SerializedFileReader};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Turns records or pre-written files into validated [`DataFile`]s.
///
/// Files are written under `{table}/data/{partition path}/` and named
/// `{uuid}-{n}.{ext}`, where the uuid is fixed per builder and `n` counts the
/// files it wrote.
///
/// Format settings come from the table properties, overridden by
/// [`FileMetadataBuilder::with_properties`].
pub struct FileMetadataBuilder {
    table: Arc<Table>,
    format: FileFormat,
    properties: BTreeMap<String, String>,
    write_id: Uuid,
    file_count: AtomicU64,
}

impl FileMetadataBuilder {
    pub fn new(table: Arc<Table>) -> Self {
        Self {
            table,
            format: FileFormat::Parquet,
            properties: BTreeMap::new(),
            write_id: Uuid::new_v4(),
            file_count: AtomicU64::new(0),
        }
    }

    pub fn with_format(mut self, format: FileFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    /// Number of files written so far.
    pub fn files_written(&self) -> u64 {
        self.file_count.load(Ordering::Relaxed)
    }

    fn format_properties(
        &self,
        format: FileFormat,
        table_props: &BTreeMap<String, String>,
    ) -> Result<FormatProperties> {
        let mut merged = table_props.clone();
        merged.extend(self.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        FormatProperties::for_format(format, &merged)
    }

    fn next_location(&self, spec: &PartitionSpec, partition: Option<&PartitionData>) -> String {
        let n = self.file_count.fetch_add(1, Ordering::Relaxed);
        let file_name = format!("{}-{:05}.{}", self.write_id, n, self.format.extension());
        match partition {
            Some(partition) if !spec.is_unpartitioned() => format!(
                "{}/data/{}/{}",
                self.table.location(),
                spec.partition_to_path(partition),
                file_name
            ),
            _ => format!("{}/data/{}", self.table.location(), file_name),
        }
    }

    /// Write `records` into one file of the given partition.
    ///
    /// Every record must match the current schema and fall into `partition`.
    pub async fn write_file(
        &self,
        partition: Option<PartitionData>,
        records: &[Record],
    ) -> Result<DataFile> {
        let start = Instant::now();

        if records.is_empty() {
            return Err(WriteError::InvalidRecord("cannot write an empty data file".into()).into());
        }

        let metadata = self.table.metadata();
        let schema = metadata.current_schema()?;
        let spec = metadata.default_partition_spec()?;
        spec.validate_partition(schema, partition.as_ref())?;
        validate_records(schema, spec, partition.as_ref(), records)?;

        if self.format != FileFormat::Parquet {
            return Err(WriteError::UnsupportedFormat(format!(
                "no appender for {} files",
                self.format
            ))
            .into());
        }

        let properties = self.format_properties(self.format, &metadata.properties)?;
        let location = self.next_location(spec, partition.as_ref());
        let output = self.table.io().new_output(&location)?;

        let mut appender = ParquetAppender::new(schema, output, &properties)?;
        for record in records {
            appender.append(record)?;
        }
        appender.close().await?;

        let data_file = DataFile::builder(self.format)
            .with_path(location)
            .with_spec_id(spec.spec_id)
            .with_partition(partition)
            .with_metrics(appender.metrics())
            .with_file_size_in_bytes(appender.length())
            .with_split_offsets(appender.split_offsets())
            .build()?;

        info!(
            path = %data_file.file_path(),
            records = data_file.record_count(),
            size_bytes = data_file.file_size_in_bytes(),
            row_groups = data_file.split_offsets().len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Data file written"
        );

        Ok(data_file)
    }

    /// Group records by partition and write one file per partition.
    ///
    /// Files are returned in the order their partitions first appear.
    pub async fn write_partitioned(&self, records: &[Record]) -> Result<Vec<DataFile>> {
        let metadata = self.table.metadata();
        let schema = metadata.current_schema()?;
        let spec = metadata.default_partition_spec()?;

        let mut groups: Vec<(Option<PartitionData>, Vec<Record>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for record in records {
            schema.validate_record(record)?;
            let partition = spec.partition_for(schema, record)?;
            let key = partition
                .as_ref()
                .map(|p| spec.partition_to_path(p))
                .unwrap_or_default();
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push((partition.clone(), Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(record.clone());
        }

        debug!(
            records = records.len(),
            partitions = groups.len(),
            "Grouped records by partition"
        );

        let mut files = Vec::with_capacity(groups.len());
        for (partition, records) in groups {
            files.push(self.write_file(partition, &records).await?);
        }
        Ok(files)
    }

    /// Describe an existing Parquet file from its footer.
    pub async fn import_file(
        &self,
        location: &str,
        partition: Option<PartitionData>,
    ) -> Result<DataFile> {
        let format = location
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.parse::<FileFormat>())
            .transpose()?
            .unwrap_or_default();
        if format != FileFormat::Parquet {
            return Err(WriteError::UnsupportedFormat(format!(
                "cannot read {} footers: {}",
                format, location
            ))
            .into());
        }

        let metadata = self.table.metadata();
        let schema = metadata.current_schema()?;
        let spec = metadata.default_partition_spec()?;
        spec.validate_partition(schema, partition.as_ref())?;

        let bytes = self.table.io().new_input(location)?.read().await?;
        let file_size = bytes.len() as u64;
        let reader = SerializedFileReader::new(bytes).map_err(|e| {
            WriteError::Parquet(format!("Failed to read footer of {}: {}", location, e))
        })?;
        let footer = reader.metadata();
        let row_groups = footer.row_groups();

        let record_count = u64::try_from(footer.file_metadata().num_rows()).map_err(|_| {
            Error::Write(WriteError::InvalidDescriptor(format!(
                "negative row count in {}",
                location
            )))
        })?;

        let mut value_counts = BTreeMap::new();
        for rg in row_groups {
            for (index, column) in rg.columns().iter().enumerate() {
                let basic_info = column.column_descr().self_type().get_basic_info();
                let field_id = if basic_info.has_id() {
                    Some(basic_info.id())
                } else {
                    schema.fields.get(index).map(|f| f.id)
                };
                if let Some(field_id) = field_id {
                    *value_counts.entry(field_id).or_insert(0u64) +=
                        column.num_values().max(0) as u64;
                }
            }
        }

        let metrics = Metrics {
            record_count,
            column_sizes: column_sizes(schema, row_groups),
            value_counts,
            ..Default::default()
        };

        let data_file = DataFile::builder(format)
            .with_path(location)
            .with_spec_id(spec.spec_id)
            .with_partition(partition)
            .with_metrics(metrics)
            .with_file_size_in_bytes(file_size)
            .with_split_offsets(split_offsets(row_groups))
            .build()?;

        info!(
            path = %location,
            records = record_count,
            size_bytes = file_size,
            "Imported data file"
        );

        Ok(data_file)
    }
}

fn validate_records(
    schema: &Schema,
    spec: &PartitionSpec,
    partition: Option<&PartitionData>,
    records: &[Record],
) -> Result<()> {
    for record in records {
        schema.validate_record(record)?;
        if spec.is_unpartitioned() {
            continue;
        }
        let actual = spec.partition_for(schema, record)?;
        if actual.as_ref() != partition {
            return Err(WriteError::InvalidPartition(format!(
                "record {:?} belongs to partition {:?}, not {:?}",
                record.values(),
                actual.map(|p| spec.partition_to_path(&p)),
                partition.map(|p| spec.partition_to_path(p))
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        FilesystemTableOperations, FilesystemTables, TableCreation, TableOperations,
    };
    use crate::io::FileIo;
    use crate::spec::{NestedField, PrimitiveType, TableIdent, Value};
    use tempfile::TempDir;

    async fn table(temp_dir: &TempDir, partitioned: bool) -> Arc<Table> {
        let location = format!("{}/events", temp_dir.path().to_str().unwrap());
        let schema = Schema::new(
            0,
            vec![
                NestedField::required(1, "id", PrimitiveType::Long),
                NestedField::required(2, "region", PrimitiveType::String),
            ],
        )
        .unwrap();
        let mut creation = TableCreation::new(schema.clone());
        if partitioned {
            let spec = PartitionSpec::builder(&schema)
                .identity("region")
                .build()
                .unwrap();
            creation = creation.with_partition_spec(spec);
        }
        FilesystemTables::new(BTreeMap::new())
            .create(&location, creation)
            .await
            .unwrap();

        let io = FileIo::from_location(&location, BTreeMap::new()).unwrap();
        let ops = Arc::new(FilesystemTableOperations::new(&location, io));
        let state = ops.refresh().await.unwrap();
        Arc::new(Table::new(TableIdent::from_location(&location), ops, state))
    }

    fn record(id: i64, region: &str) -> Record {
        Record::new(vec![Value::Long(id), Value::String(region.into())])
    }

    #[tokio::test]
    async fn test_write_file_unpartitioned() {
        let temp_dir = TempDir::new().unwrap();
        let builder = FileMetadataBuilder::new(table(&temp_dir, false).await);

        let records: Vec<Record> = (0..10).map(|i| record(i, "eu")).collect();
        let file = builder.write_file(None, &records).await.unwrap();

        assert_eq!(file.record_count(), 10);
        assert!(file.file_path().contains("/events/data/"));
        assert!(file.file_path().ends_with("-00000.parquet"));
        assert_eq!(file.lower_bounds()[&1], Value::Long(0));
        assert_eq!(file.upper_bounds()[&1], Value::Long(9));
        assert_eq!(file.split_offsets().len(), 1);
        assert_eq!(builder.files_written(), 1);
    }

    #[tokio::test]
    async fn test_write_file_rejects_empty_and_bad_records() {
        let temp_dir = TempDir::new().unwrap();
        let builder = FileMetadataBuilder::new(table(&temp_dir, false).await);

        let err = builder.write_file(None, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Write(WriteError::InvalidRecord(_))));

        let bad = Record::new(vec![Value::String("x".into()), Value::String("eu".into())]);
        let err = builder.write_file(None, &[bad]).await.unwrap_err();
        assert!(matches!(err, Error::Write(WriteError::InvalidRecord(_))));
        assert_eq!(builder.files_written(), 0);
    }

    #[tokio::test]
    async fn test_partition_must_match_records() {
        let temp_dir = TempDir::new().unwrap();
        let builder = FileMetadataBuilder::new(table(&temp_dir, true).await);

        let err = builder.write_file(None, &[record(1, "eu")]).await.unwrap_err();
        assert!(matches!(err, Error::Write(WriteError::InvalidPartition(_))));

        let us = Some(PartitionData::new(vec![Value::String("us".into())]));
        let err = builder.write_file(us, &[record(1, "eu")]).await.unwrap_err();
        assert!(matches!(err, Error::Write(WriteError::InvalidPartition(_))));
    }

    #[tokio::test]
    async fn test_write_partitioned_fans_out() {
        let temp_dir = TempDir::new().unwrap();
        let builder = FileMetadataBuilder::new(table(&temp_dir, true).await);

        let records = vec![record(1, "eu"), record(2, "us"), record(3, "eu")];
        let files = builder.write_partitioned(&records).await.unwrap();

        assert_eq!(files.len(), 2);
        assert!(files[0].file_path().contains("/data/region=eu/"));
        assert_eq!(files[0].record_count(), 2);
        assert!(files[1].file_path().contains("/data/region=us/"));
        assert_eq!(files[1].record_count(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        let builder = FileMetadataBuilder::new(table(&temp_dir, false).await)
            .with_format(FileFormat::Avro);
        let err = builder.write_file(None, &[record(1, "eu")]).await.unwrap_err();
        assert!(matches!(err, Error::Write(WriteError::UnsupportedFormat(_))));
    }

    #[tokio::test]
    async fn test_import_matches_written_file() {
        let temp_dir = TempDir::new().unwrap();
        let builder = FileMetadataBuilder::new(table(&temp_dir, false).await).with_properties(
            BTreeMap::from([(
                "write.parquet.row-group-row-limit".to_string(),
                "3".to_string(),
            )]),
        );

        let records: Vec<Record> = (0..8).map(|i| record(i, "eu")).collect();
        let written = builder.write_file(None, &records).await.unwrap();
        let imported = builder.import_file(written.file_path(), None).await.unwrap();

        assert_eq!(imported.record_count(), 8);
        assert_eq!(imported.file_size_in_bytes(), written.file_size_in_bytes());
        assert_eq!(imported.split_offsets(), written.split_offsets());
        assert_eq!(imported.split_offsets().len(), 3);
        assert_eq!(imported.column_sizes(), written.column_sizes());
        assert_eq!(imported.value_counts()[&1], 8);
    }
}
