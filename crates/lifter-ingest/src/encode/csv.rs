//! Delimited-text encoder
//!
//! Header row from the schema, nulls as empty fields, timestamps as
//! RFC 3339 with microseconds in UTC.

use ::csv::{Writer, WriterBuilder};
use arrow_array::{Array, RecordBatch, StringArray, TimestampMicrosecondArray};
use arrow_schema::SchemaRef;
use chrono::{DateTime, SecondsFormat};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{check_schema, commit, partial_path, BatchEncoder, EncodedArtifact};
use crate::error::{IngestError, Result};

pub struct CsvEncoder {
    schema: SchemaRef,
    writer: Writer<BufWriter<File>>,
    path: PathBuf,
    partial: PathBuf,
    rows: u64,
}

enum Column<'a> {
    Text(&'a StringArray),
    Timestamp(&'a TimestampMicrosecondArray),
}

impl Column<'_> {
    fn render(&self, row: usize) -> Result<String> {
        match self {
            Column::Text(array) if array.is_null(row) => Ok(String::new()),
            Column::Text(array) => Ok(array.value(row).to_string()),
            Column::Timestamp(array) if array.is_null(row) => Ok(String::new()),
            Column::Timestamp(array) => DateTime::from_timestamp_micros(array.value(row))
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Micros, true))
                .ok_or_else(|| {
                    IngestError::encoding(format!("timestamp out of range: {}", array.value(row)))
                }),
        }
    }
}

impl CsvEncoder {
    pub fn create(schema: SchemaRef, path: &Path) -> Result<Self> {
        let partial = partial_path(path);
        let file = File::create(&partial).map_err(|e| IngestError::staging(&partial, e))?;
        let mut writer = WriterBuilder::new().from_writer(BufWriter::new(file));

        writer
            .write_record(schema.fields().iter().map(|f| f.name().as_str()))
            .map_err(|e| IngestError::encoding(format!("csv header write failed: {}", e)))?;

        debug!(path = %partial.display(), "CSV encoder created");

        Ok(Self {
            schema,
            writer,
            path: path.to_path_buf(),
            partial,
            rows: 0,
        })
    }
}

impl BatchEncoder for CsvEncoder {
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        check_schema(&self.schema, batch)?;

        let columns = batch
            .columns()
            .iter()
            .enumerate()
            .map(|(i, array)| {
                if let Some(text) = array.as_any().downcast_ref::<StringArray>() {
                    Ok(Column::Text(text))
                } else if let Some(ts) = array.as_any().downcast_ref::<TimestampMicrosecondArray>() {
                    Ok(Column::Timestamp(ts))
                } else {
                    Err(IngestError::encoding(format!(
                        "column '{}' has unsupported type {}",
                        self.schema.field(i).name(),
                        array.data_type()
                    )))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mut record = Vec::with_capacity(columns.len());
        for row in 0..batch.num_rows() {
            record.clear();
            for column in &columns {
                record.push(column.render(row)?);
            }
            self.writer
                .write_record(&record)
                .map_err(|e| IngestError::encoding(format!("csv write failed: {}", e)))?;
        }

        self.rows += batch.num_rows() as u64;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<EncodedArtifact> {
        let this = *self;
        let buffered = this
            .writer
            .into_inner()
            .map_err(|e| IngestError::staging(&this.partial, std::io::Error::other(e.to_string())))?;
        let file = buffered
            .into_inner()
            .map_err(|e| IngestError::staging(&this.partial, e.into_error()))?;

        let bytes = commit(file, &this.partial, &this.path)?;
        debug!(path = %this.path.display(), rows = this.rows, bytes, "CSV file finished");

        Ok(EncodedArtifact {
            path: this.path,
            bytes,
            rows: this.rows,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::enrich::{BatchReader, Enricher, MalformedRowPolicy, Provenance};
    use chrono::{TimeZone, Utc};
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn test_csv_output_with_provenance() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.csv");

        let reader = BatchReader::new(
            Cursor::new(b"id,note\n1,\"a,b\"\n2,\n".to_vec()),
            "data.csv",
            1,
            MalformedRowPolicy::Abort,
        )
        .unwrap();
        let provenance = Provenance::new(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        let enricher = Enricher::new(reader.columns(), provenance).unwrap();

        let mut encoder: Box<dyn BatchEncoder> =
            Box::new(CsvEncoder::create(enricher.schema(), &path).unwrap());
        for batch in reader {
            encoder.write_batch(&enricher.enrich(&batch.unwrap()).unwrap()).unwrap();
        }
        let artifact = encoder.finish().unwrap();

        assert_eq!(artifact.rows, 2);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "id,note,downloaded_at,created_date\n\
             1,\"a,b\",2024-01-02T03:04:05.000000Z,20240102\n\
             2,,2024-01-02T03:04:05.000000Z,20240102\n"
        );
        assert_eq!(artifact.bytes, text.len() as u64);
    }
}
