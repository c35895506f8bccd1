//! Output encoders
//!
//! Encoders receive enriched batches one at a time and write them to a
//! staged `.part` file. Nothing appears under the final path until
//! [`BatchEncoder::finish`] succeeds.

mod csv;
mod parquet;

pub use self::csv::CsvEncoder;
pub use self::parquet::ParquetEncoder;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Parquet,
    Csv,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Parquet => "parquet",
            OutputFormat::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Parquet => "application/vnd.apache.parquet",
            OutputFormat::Csv => "text/csv",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "parquet" => Ok(OutputFormat::Parquet),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(IngestError::config(format!(
                "unknown output format '{}' (expected parquet or csv)",
                other
            ))),
        }
    }
}

/// A finished, durable output file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedArtifact {
    pub path: PathBuf,
    pub bytes: u64,
    pub rows: u64,
}

pub trait BatchEncoder: Send {
    /// Append one batch; its schema must match the encoder's
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<()>;

    /// Flush, fsync and move the file into its final path
    fn finish(self: Box<Self>) -> Result<EncodedArtifact>;
}

/// Build the encoder for `format` writing to `path`. `batch_size` bounds
/// how many rows the encoder may buffer before flushing.
pub fn create_encoder(
    format: OutputFormat,
    schema: SchemaRef,
    path: &Path,
    batch_size: usize,
) -> Result<Box<dyn BatchEncoder>> {
    match format {
        OutputFormat::Parquet => Ok(Box::new(ParquetEncoder::create(schema, path, batch_size)?)),
        OutputFormat::Csv => Ok(Box::new(CsvEncoder::create(schema, path)?)),
    }
}

/// `<path>.part`, the in-progress sibling of `path`
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// Durably move a finished partial file to `path`
fn commit(file: std::fs::File, partial: &Path, path: &Path) -> Result<u64> {
    file.sync_all().map_err(|e| IngestError::staging(partial, e))?;
    drop(file);
    std::fs::rename(partial, path).map_err(|e| IngestError::staging(path, e))?;
    let bytes = std::fs::metadata(path)
        .map_err(|e| IngestError::staging(path, e))?
        .len();
    Ok(bytes)
}

fn check_schema(expected: &SchemaRef, batch: &RecordBatch) -> Result<()> {
    if batch.schema().fields() != expected.fields() {
        return Err(IngestError::encoding(format!(
            "batch schema does not match encoder schema ({} vs {} columns)",
            batch.num_columns(),
            expected.fields().len()
        )));
    }
    Ok(())
}
