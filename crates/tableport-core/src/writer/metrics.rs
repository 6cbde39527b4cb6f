use crate::spec::{Metrics, Record, Schema, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Running column statistics over the records written to one file.
///
/// Value counts include nulls. NaN counts are kept for floating point
/// columns only. Nulls and NaN never become lower or upper bounds.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    columns: Vec<ColumnStats>,
    record_count: u64,
}

#[derive(Debug, Clone)]
struct ColumnStats {
    field_id: i32,
    floating_point: bool,
    values: u64,
    nulls: u64,
    nans: u64,
    lower: Option<Value>,
    upper: Option<Value>,
}

impl MetricsCollector {
    pub fn new(schema: &Schema) -> Self {
        let columns = schema
            .fields
            .iter()
            .map(|field| ColumnStats {
                field_id: field.id,
                floating_point: field.field_type.is_floating_point(),
                values: 0,
                nulls: 0,
                nans: 0,
                lower: None,
                upper: None,
            })
            .collect();

        Self {
            columns,
            record_count: 0,
        }
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Account for one record. The record must already match the schema.
    pub fn update(&mut self, record: &Record) {
        self.record_count += 1;

        for (stats, value) in self.columns.iter_mut().zip(record.values()) {
            stats.values += 1;
            if value.is_null() {
                stats.nulls += 1;
                continue;
            }
            if value.is_nan() {
                stats.nans += 1;
                continue;
            }

            let lower_is_greater = stats
                .lower
                .as_ref()
                .map_or(true, |lower| value.compare(lower) == Some(Ordering::Less));
            if lower_is_greater {
                stats.lower = Some(value.clone());
            }

            let upper_is_smaller = stats
                .upper
                .as_ref()
                .map_or(true, |upper| value.compare(upper) == Some(Ordering::Greater));
            if upper_is_smaller {
                stats.upper = Some(value.clone());
            }
        }
    }

    /// Final metrics, with on-disk column sizes supplied by the format writer.
    pub fn finish(&self, column_sizes: BTreeMap<i32, u64>) -> Metrics {
        let mut metrics = Metrics {
            record_count: self.record_count,
            column_sizes,
            ..Default::default()
        };

        for stats in &self.columns {
            metrics.value_counts.insert(stats.field_id, stats.values);
            metrics.null_value_counts.insert(stats.field_id, stats.nulls);
            if stats.floating_point {
                metrics.nan_value_counts.insert(stats.field_id, stats.nans);
            }
            if let Some(lower) = &stats.lower {
                metrics.lower_bounds.insert(stats.field_id, lower.clone());
            }
            if let Some(upper) = &stats.upper {
                metrics.upper_bounds.insert(stats.field_id, upper.clone());
            }
        }

        metrics
    }
}
