//! Parquet appender.
//!
//! Records are buffered into Arrow batches of `write.parquet.write-batch-size`
//! rows and streamed through an [`ArrowWriter`] into an [`OutputFile`].
//! Split offsets and column sizes are taken from the row groups the writer
//! itself flushed, so they always agree with the file footer.

use super::metrics::MetricsCollector;
use super::{FileAppender, FormatProperties};
use crate::io::OutputFile;
use crate::spec::{Metrics, PrimitiveType, Record, Schema, Value};
use crate::{Error, Result, WriteError};
use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Float32Array, Float64Array, Int32Array,
    Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use parquet::arrow::{ArrowWriter, PARQUET_FIELD_ID_META_KEY};
use parquet::basic::Compression;
use parquet::file::metadata::RowGroupMetaData;
use parquet::file::properties::WriterProperties;
use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

pub const COMPRESSION_CODEC: &str = "write.parquet.compression-codec";
pub const ROW_GROUP_ROW_LIMIT: &str = "write.parquet.row-group-row-limit";
pub const WRITE_BATCH_SIZE: &str = "write.parquet.write-batch-size";
pub const DICT_ENABLED: &str = "write.parquet.dict-enabled";

const DEFAULT_ROW_GROUP_ROW_LIMIT: usize = 128 * 1024;
const DEFAULT_WRITE_BATCH_SIZE: usize = 1024;

/// Writes records of one schema to a single Parquet file.
pub struct ParquetAppender {
    schema: Schema,
    arrow_schema: SchemaRef,
    location: String,
    writer: Option<ArrowWriter<OutputFile>>,
    pending: Vec<Record>,
    batch_size: usize,
    collector: MetricsCollector,
    column_sizes: BTreeMap<i32, u64>,
    split_offsets: Vec<u64>,
    length: u64,
}

impl ParquetAppender {
    pub fn new(schema: &Schema, output: OutputFile, properties: &FormatProperties) -> Result<Self> {
        let arrow_schema = arrow_schema(schema);
        let batch_size = parse_usize(properties, WRITE_BATCH_SIZE, DEFAULT_WRITE_BATCH_SIZE)?;
        let location = output.location().to_string();
        let writer_props = writer_properties(properties, batch_size)?;

        let writer = ArrowWriter::try_new(output, arrow_schema.clone(), Some(writer_props))
            .map_err(|e| {
                WriteError::Parquet(format!("Failed to create Parquet writer: {}", e))
            })?;

        Ok(Self {
            schema: schema.clone(),
            arrow_schema,
            location,
            writer: Some(writer),
            pending: Vec::with_capacity(batch_size),
            batch_size,
            collector: MetricsCollector::new(schema),
            column_sizes: BTreeMap::new(),
            split_offsets: Vec::new(),
            length: 0,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn writer_mut(&mut self) -> Result<&mut ArrowWriter<OutputFile>> {
        self.writer.as_mut().ok_or_else(|| {
            WriteError::Parquet(format!("{} is already closed", self.location)).into()
        })
    }

    fn write_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let records = std::mem::take(&mut self.pending);
        let batch = record_batch(&self.schema, &self.arrow_schema, &records)?;
        self.writer_mut()?
            .write(&batch)
            .map_err(|e| WriteError::Parquet(format!("Failed to write batch to Parquet: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl FileAppender for ParquetAppender {
    fn append(&mut self, record: &Record) -> Result<()> {
        if self.writer.is_none() {
            return Err(WriteError::Parquet(format!("{} is already closed", self.location)).into());
        }

        self.collector.update(record);
        self.pending.push(record.clone());
        if self.pending.len() >= self.batch_size {
            self.write_pending()?;
        }
        Ok(())
    }

    fn metrics(&self) -> Metrics {
        self.collector.finish(self.column_sizes.clone())
    }

    fn split_offsets(&self) -> Vec<u64> {
        self.split_offsets.clone()
    }

    fn length(&self) -> u64 {
        self.length
    }

    async fn close(&mut self) -> Result<()> {
        if self.writer.is_none() {
            return Ok(());
        }

        self.write_pending()?;
        let mut writer = self.writer.take().ok_or_else(|| {
            Error::Write(WriteError::Parquet(format!("{} is already closed", self.location)))
        })?;

        writer
            .flush()
            .map_err(|e| WriteError::Parquet(format!("Failed to flush row group: {}", e)))?;
        self.split_offsets = split_offsets(writer.flushed_row_groups());
        self.column_sizes = column_sizes(&self.schema, writer.flushed_row_groups());

        let output = writer
            .into_inner()
            .map_err(|e| WriteError::Parquet(format!("Failed to close Parquet writer: {}", e)))?;

        self.length = output
            .close()
            .await
            .map_err(|e| WriteError::Upload(format!("{}: {}", self.location, e)))?;

        debug!(
            path = %self.location,
            records = self.collector.record_count(),
            row_groups = self.split_offsets.len(),
            size_bytes = self.length,
            "Closed Parquet file"
        );

        Ok(())
    }
}

/// Start offset of each row group: the first byte of its first column chunk.
pub(crate) fn split_offsets<R: Borrow<RowGroupMetaData>>(row_groups: &[R]) -> Vec<u64> {
    row_groups
        .iter()
        .map(Borrow::borrow)
        .filter(|rg| rg.num_columns() > 0)
        .map(|rg| rg.column(0).byte_range().0)
        .collect()
}

/// Compressed on-disk size per field id, summed over row groups.
pub(crate) fn column_sizes<R: Borrow<RowGroupMetaData>>(
    schema: &Schema,
    row_groups: &[R],
) -> BTreeMap<i32, u64> {
    let mut sizes = BTreeMap::new();
    for rg in row_groups.iter().map(Borrow::borrow) {
        for (index, column) in rg.columns().iter().enumerate() {
            let basic_info = column.column_descr().self_type().get_basic_info();
            let field_id = if basic_info.has_id() {
                Some(basic_info.id())
            } else {
                schema.fields.get(index).map(|f| f.id)
            };
            if let Some(field_id) = field_id {
                *sizes.entry(field_id).or_insert(0) += column.compressed_size().max(0) as u64;
            }
        }
    }
    sizes
}

fn writer_properties(properties: &FormatProperties, batch_size: usize) -> Result<WriterProperties> {
    let compression = match properties
        .get(COMPRESSION_CODEC)
        .unwrap_or("zstd")
        .to_ascii_lowercase()
        .as_str()
    {
        "zstd" => Compression::ZSTD(Default::default()),
        "snappy" => Compression::SNAPPY,
        "gzip" => Compression::GZIP(Default::default()),
        "lz4" => Compression::LZ4,
        "uncompressed" | "none" => Compression::UNCOMPRESSED,
        other => {
            return Err(Error::Config(format!(
                "Unknown {} value: {}",
                COMPRESSION_CODEC, other
            )))
        }
    };

    let row_group_limit =
        parse_usize(properties, ROW_GROUP_ROW_LIMIT, DEFAULT_ROW_GROUP_ROW_LIMIT)?;
    let dictionary = match properties.get(DICT_ENABLED) {
        None => true,
        Some(v) => v.parse::<bool>().map_err(|_| {
            Error::Config(format!("Invalid {} value: {}", DICT_ENABLED, v))
        })?,
    };

    Ok(WriterProperties::builder()
        .set_compression(compression)
        .set_max_row_group_size(row_group_limit)
        .set_write_batch_size(batch_size)
        .set_dictionary_enabled(dictionary)
        .build())
}

fn parse_usize(properties: &FormatProperties, key: &str, default: usize) -> Result<usize> {
    match properties.get(key) {
        None => Ok(default),
        Some(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(Error::Config(format!("Invalid {} value: {}", key, v))),
        },
    }
}

fn arrow_type(ty: PrimitiveType) -> DataType {
    match ty {
        PrimitiveType::Boolean => DataType::Boolean,
        PrimitiveType::Int => DataType::Int32,
        PrimitiveType::Long => DataType::Int64,
        PrimitiveType::Float => DataType::Float32,
        PrimitiveType::Double => DataType::Float64,
        PrimitiveType::Date => DataType::Date32,
        PrimitiveType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        PrimitiveType::String => DataType::Utf8,
        PrimitiveType::Binary => DataType::Binary,
    }
}

/// Arrow schema carrying each column's field id for the Parquet writer.
fn arrow_schema(schema: &Schema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .fields
        .iter()
        .map(|field| {
            Field::new(&field.name, arrow_type(field.field_type), !field.required).with_metadata(
                HashMap::from([(PARQUET_FIELD_ID_META_KEY.to_string(), field.id.to_string())]),
            )
        })
        .collect();
    Arc::new(ArrowSchema::new(fields))
}

fn column_values<'a, T>(
    records: &'a [Record],
    index: usize,
    name: &str,
    extract: impl Fn(&'a Value) -> Option<T>,
) -> Result<Vec<Option<T>>> {
    records
        .iter()
        .map(|record| match record.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => extract(value).map(Some).ok_or_else(|| {
                Error::Write(WriteError::InvalidRecord(format!(
                    "unexpected value {:?} in column {}",
                    value, name
                )))
            }),
        })
        .collect()
}

fn record_batch(
    schema: &Schema,
    arrow_schema: &SchemaRef,
    records: &[Record],
) -> Result<RecordBatch> {
    let columns = schema
        .fields
        .iter()
        .enumerate()
        .map(|(i, field)| {
            let name = field.name.as_str();
            let array: ArrayRef = match field.field_type {
                PrimitiveType::Boolean => Arc::new(BooleanArray::from(column_values(
                    records,
                    i,
                    name,
                    |v| match v {
                        Value::Boolean(b) => Some(*b),
                        _ => None,
                    },
                )?)),
                PrimitiveType::Int => Arc::new(Int32Array::from(column_values(
                    records,
                    i,
                    name,
                    |v| match v {
                        Value::Int(n) => Some(*n),
                        _ => None,
                    },
                )?)),
                PrimitiveType::Long => Arc::new(Int64Array::from(column_values(
                    records,
                    i,
                    name,
                    |v| match v {
                        Value::Long(n) => Some(*n),
                        _ => None,
                    },
                )?)),
                PrimitiveType::Float => Arc::new(Float32Array::from(column_values(
                    records,
                    i,
                    name,
                    |v| match v {
                        Value::Float(n) => Some(*n),
                        _ => None,
                    },
                )?)),
                PrimitiveType::Double => Arc::new(Float64Array::from(column_values(
                    records,
                    i,
                    name,
                    |v| match v {
                        Value::Double(n) => Some(*n),
                        _ => None,
                    },
                )?)),
                PrimitiveType::Date => Arc::new(Date32Array::from(column_values(
                    records,
                    i,
                    name,
                    |v| match v {
                        Value::Date(d) => Some(*d),
                        _ => None,
                    },
                )?)),
                PrimitiveType::Timestamp => Arc::new(TimestampMicrosecondArray::from(
                    column_values(records, i, name, |v| match v {
                        Value::Timestamp(t) => Some(*t),
                        _ => None,
                    })?,
                )),
                PrimitiveType::String => Arc::new(StringArray::from(column_values(
                    records,
                    i,
                    name,
                    |v| match v {
                        Value::String(s) => Some(s.as_str()),
                        _ => None,
                    },
                )?)),
                PrimitiveType::Binary => Arc::new(BinaryArray::from(column_values(
                    records,
                    i,
                    name,
                    |v| match v {
                        Value::Binary(b) => Some(b.as_slice()),
                        _ => None,
                    },
                )?)),
            };
            Ok(array)
        })
        .collect::<Result<Vec<_>>>()?;

    RecordBatch::try_new(arrow_schema.clone(), columns)
        .map_err(|e| WriteError::Parquet(format!("Failed to build record batch: {}", e)).into())
}
