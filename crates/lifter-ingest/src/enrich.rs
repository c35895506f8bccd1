//! Batched CSV reading and provenance enrichment
//!
//! Rows are read in batches of at most `batch_size`, so memory stays
//! proportional to one batch regardless of member size. Every source column
//! is kept as nullable UTF-8 (empty fields become null) and two provenance
//! columns are appended with the same value on every row of a run:
//!
//! | column          | type                      | value                      |
//! |-----------------|---------------------------|----------------------------|
//! | `downloaded_at` | timestamp (µs, UTC)       | archive download completion |
//! | `created_date`  | UTF-8, `YYYYMMDD`         | UTC date of `downloaded_at` |

use arrow_array::{ArrayRef, RecordBatch, StringArray, TimestampMicrosecondArray};
use arrow_array::builder::StringBuilder;
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

pub const INGESTED_AT_COLUMN: &str = "downloaded_at";
pub const PARTITION_DATE_COLUMN: &str = "created_date";

/// Skipped rows logged individually before going quiet
const MAX_LOGGED_SKIPS: u64 = 10;

/// What to do with a row whose field count differs from the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedRowPolicy {
    /// Fail the run on the first malformed row
    #[default]
    Abort,
    /// Drop the row, count it and keep going
    Skip,
}

impl fmt::Display for MalformedRowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedRowPolicy::Abort => f.write_str("abort"),
            MalformedRowPolicy::Skip => f.write_str("skip"),
        }
    }
}

impl FromStr for MalformedRowPolicy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "abort" => Ok(MalformedRowPolicy::Abort),
            "skip" => Ok(MalformedRowPolicy::Skip),
            other => Err(IngestError::config(format!(
                "unknown malformed row policy '{}' (expected abort or skip)",
                other
            ))),
        }
    }
}

/// Run-wide provenance values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    ingested_at: DateTime<Utc>,
    partition_date: String,
}

impl Provenance {
    pub fn new(ingested_at: DateTime<Utc>) -> Self {
        Self {
            ingested_at,
            partition_date: ingested_at.format("%Y%m%d").to_string(),
        }
    }

    pub fn ingested_at(&self) -> DateTime<Utc> {
        self.ingested_at
    }

    pub fn partition_date(&self) -> &str {
        &self.partition_date
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnrichStats {
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub batches: u64,
}

/// Up to `batch_size` well-formed rows, in source order
#[derive(Debug, Clone)]
pub struct RowBatch {
    /// Source line of the first row
    pub first_line: u64,
    pub rows: Vec<StringRecord>,
}

impl RowBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Streams a delimited file as [`RowBatch`]es
pub struct BatchReader<R: Read> {
    reader: csv::Reader<R>,
    source: PathBuf,
    columns: Vec<String>,
    batch_size: usize,
    policy: MalformedRowPolicy,
    stats: EnrichStats,
    done: bool,
}

impl BatchReader<BufReader<File>> {
    pub fn open(path: &Path, batch_size: usize, policy: MalformedRowPolicy) -> Result<Self> {
        let file = File::open(path).map_err(|e| IngestError::staging(path, e))?;
        Self::new(BufReader::new(file), path, batch_size, policy)
    }
}

impl<R: Read> BatchReader<R> {
    /// Reads the header row immediately
    pub fn new(
        reader: R,
        source: impl Into<PathBuf>,
        batch_size: usize,
        policy: MalformedRowPolicy,
    ) -> Result<Self> {
        let source = source.into();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers = reader.headers().map_err(|e| read_error(e, &source, 1))?;
        let columns: Vec<String> = headers.iter().map(str::to_string).collect();
        if columns.is_empty() {
            return Err(IngestError::malformed(1, "missing header row"));
        }

        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(IngestError::malformed(
                    1,
                    format!("duplicate column name '{}'", column),
                ));
            }
        }

        debug!(source = %source.display(), columns = columns.len(), "Header read");

        Ok(Self {
            reader,
            source,
            columns,
            batch_size: batch_size.max(1),
            policy,
            stats: EnrichStats::default(),
            done: false,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn stats(&self) -> EnrichStats {
        self.stats
    }

    fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        if self.done {
            return Ok(None);
        }

        let mut rows = Vec::with_capacity(self.batch_size.min(8192));
        let mut first_line = None;

        while rows.len() < self.batch_size {
            let mut record = StringRecord::new();
            match self.reader.read_record(&mut record) {
                Ok(false) => {
                    self.done = true;
                    break;
                },
                Ok(true) => {
                    self.stats.rows_read += 1;
                    let line = record.position().map(|p| p.line()).unwrap_or(0);
                    if record.len() != self.columns.len() {
                        let reason = format!(
                            "expected {} fields, found {}",
                            self.columns.len(),
                            record.len()
                        );
                        self.reject(line, reason)?;
                        continue;
                    }
                    first_line.get_or_insert(line);
                    rows.push(record);
                },
                Err(e) => {
                    let line = e.position().map(|p| p.line()).unwrap_or(0);
                    if !matches!(e.kind(), csv::ErrorKind::Utf8 { .. }) {
                        return Err(read_error(e, &self.source, line));
                    }
                    self.stats.rows_read += 1;
                    self.reject(line, "field is not valid UTF-8".to_string())?;
                },
            }
        }

        if rows.is_empty() {
            return Ok(None);
        }

        self.stats.rows_written += rows.len() as u64;
        self.stats.batches += 1;
        Ok(Some(RowBatch {
            first_line: first_line.unwrap_or(0),
            rows,
        }))
    }

    fn reject(&mut self, line: u64, reason: String) -> Result<()> {
        match self.policy {
            MalformedRowPolicy::Abort => Err(IngestError::malformed(line, reason)),
            MalformedRowPolicy::Skip => {
                self.stats.rows_skipped += 1;
                if self.stats.rows_skipped <= MAX_LOGGED_SKIPS {
                    warn!(line, reason = %reason, "Skipping malformed row");
                } else if self.stats.rows_skipped == MAX_LOGGED_SKIPS + 1 {
                    warn!("Further malformed rows are skipped without logging");
                }
                Ok(())
            },
        }
    }
}

impl<R: Read> Iterator for BatchReader<R> {
    type Item = Result<RowBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}

fn read_error(error: csv::Error, source: &Path, line: u64) -> IngestError {
    match error.into_kind() {
        csv::ErrorKind::Io(io) => IngestError::staging(source, io),
        csv::ErrorKind::Utf8 { .. } => IngestError::malformed(line, "field is not valid UTF-8"),
        other => IngestError::malformed(line, format!("{:?}", other)),
    }
}

/// Source columns as nullable UTF-8 followed by the provenance columns.
/// A source column that already uses a provenance name is rejected.
pub fn output_schema(columns: &[String]) -> Result<Schema> {
    for reserved in [INGESTED_AT_COLUMN, PARTITION_DATE_COLUMN] {
        if columns.iter().any(|c| c == reserved) {
            return Err(IngestError::malformed(
                1,
                format!("source already has a '{}' column", reserved),
            ));
        }
    }

    let mut fields: Vec<Field> = columns
        .iter()
        .map(|name| Field::new(name, DataType::Utf8, true))
        .collect();
    fields.push(Field::new(
        INGESTED_AT_COLUMN,
        DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        false,
    ));
    fields.push(Field::new(PARTITION_DATE_COLUMN, DataType::Utf8, false));

    Ok(Schema::new(fields))
}

/// Turns row batches into Arrow record batches with provenance appended
pub struct Enricher {
    schema: SchemaRef,
    source_columns: usize,
    provenance: Provenance,
}

impl Enricher {
    pub fn new(columns: &[String], provenance: Provenance) -> Result<Self> {
        let schema = Arc::new(output_schema(columns)?);
        Ok(Self {
            schema,
            source_columns: columns.len(),
            provenance,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn enrich(&self, batch: &RowBatch) -> Result<RecordBatch> {
        let rows = batch.len();
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.source_columns + 2);

        for column in 0..self.source_columns {
            let mut builder = StringBuilder::with_capacity(rows, rows * 8);
            for record in &batch.rows {
                match record.get(column) {
                    Some(value) if !value.is_empty() => builder.append_value(value),
                    _ => builder.append_null(),
                }
            }
            arrays.push(Arc::new(builder.finish()));
        }

        let micros = self.provenance.ingested_at.timestamp_micros();
        arrays.push(Arc::new(
            TimestampMicrosecondArray::from(vec![micros; rows]).with_timezone("UTC"),
        ));
        arrays.push(Arc::new(StringArray::from(vec![
            self.provenance.partition_date.as_str();
            rows
        ])));

        RecordBatch::try_new(self.schema(), arrays).map_err(|e| {
            IngestError::encoding(format!(
                "building batch starting at line {}: {}",
                batch.first_line, e
            ))
        })
    }
}
