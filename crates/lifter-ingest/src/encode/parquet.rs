//! Parquet encoder
//!
//! Snappy-compressed, one row group per `batch_size` rows at most, so the
//! writer never buffers more than one batch worth of rows.

use ::parquet::arrow::ArrowWriter;
use ::parquet::basic::Compression;
use ::parquet::file::properties::WriterProperties;
use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{check_schema, commit, partial_path, BatchEncoder, EncodedArtifact};
use crate::error::{IngestError, Result};

pub struct ParquetEncoder {
    schema: SchemaRef,
    writer: ArrowWriter<BufWriter<File>>,
    path: PathBuf,
    partial: PathBuf,
    rows: u64,
}

impl ParquetEncoder {
    pub fn create(schema: SchemaRef, path: &Path, batch_size: usize) -> Result<Self> {
        let partial = partial_path(path);
        let file = File::create(&partial).map_err(|e| IngestError::staging(&partial, e))?;

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(batch_size.max(1))
            .build();

        let writer = ArrowWriter::try_new(BufWriter::new(file), schema.clone(), Some(props))
            .map_err(|e| IngestError::encoding(format!("failed to create parquet writer: {}", e)))?;

        debug!(path = %partial.display(), batch_size, "Parquet encoder created");

        Ok(Self {
            schema,
            writer,
            path: path.to_path_buf(),
            partial,
            rows: 0,
        })
    }
}

impl BatchEncoder for ParquetEncoder {
    fn write_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        check_schema(&self.schema, batch)?;
        self.writer
            .write(batch)
            .map_err(|e| IngestError::encoding(format!("parquet write failed: {}", e)))?;
        self.rows += batch.num_rows() as u64;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<EncodedArtifact> {
        let this = *self;
        let buffered = this
            .writer
            .into_inner()
            .map_err(|e| IngestError::encoding(format!("failed to close parquet file: {}", e)))?;
        let file = buffered
            .into_inner()
            .map_err(|e| IngestError::staging(&this.partial, e.into_error()))?;

        let bytes = commit(file, &this.partial, &this.path)?;
        debug!(path = %this.path.display(), rows = this.rows, bytes, "Parquet file finished");

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
    use ::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use arrow_array::{Array, StringArray, TimestampMicrosecondArray};
    use chrono::{TimeZone, Utc};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn provenance() -> Provenance {
        Provenance::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap())
    }

    fn encode(data: &str, batch_size: usize, path: &Path) -> EncodedArtifact {
        let reader = BatchReader::new(
            Cursor::new(data.as_bytes().to_vec()),
            "data.csv",
            batch_size,
            MalformedRowPolicy::Abort,
        )
        .unwrap();
        let enricher = Enricher::new(reader.columns(), provenance()).unwrap();

        let mut encoder: Box<dyn BatchEncoder> =
            Box::new(ParquetEncoder::create(enricher.schema(), path, batch_size).unwrap());
        for batch in reader {
            encoder.write_batch(&enricher.enrich(&batch.unwrap()).unwrap()).unwrap();
        }
        encoder.finish().unwrap()
    }

    #[test]
    fn test_row_groups_bounded_by_batch_size() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.parquet");

        let mut data = String::from("id,name\n");
        for i in 0..10 {
            data.push_str(&format!("{},lifter{}\n", i, i));
        }
        let artifact = encode(&data, 4, &path);

        assert_eq!(artifact.rows, 10);
        assert_eq!(artifact.path, path);
        assert!(artifact.bytes > 0);
        assert!(!temp.path().join("out.parquet.part").exists());

        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(&path).unwrap()).unwrap();
        let metadata = builder.metadata().clone();
        assert_eq!(metadata.file_metadata().num_rows(), 10);
        for row_group in metadata.row_groups() {
            assert!(row_group.num_rows() <= 4);
        }

        let batches: Vec<RecordBatch> = builder.build().unwrap().map(|b| b.unwrap()).collect();
        let names = batches[0]
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.value(0), "lifter0");
        assert_eq!(batches[0].schema().field(2).name(), "downloaded_at");
    }

    /// Every row of the file, provenance included, as text
    fn decode_rows(path: &Path) -> Vec<Vec<Option<String>>> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
            .unwrap()
            .build()
            .unwrap();

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch.unwrap();
            let width = batch.num_columns();
            for row in 0..batch.num_rows() {
                let mut values = Vec::with_capacity(width);
                for col in 0..width {
                    let column = batch.column(col);
                    if column.is_null(row) {
                        values.push(None);
                    } else if let Some(ts) = column.as_any().downcast_ref::<TimestampMicrosecondArray>() {
                        values.push(Some(ts.value(row).to_string()));
                    } else {
                        let text = column.as_any().downcast_ref::<StringArray>().unwrap();
                        values.push(Some(text.value(row).to_string()));
                    }
                }
                rows.push(values);
            }
        }
        rows
    }

    fn row_group_sizes(path: &Path) -> Vec<i64> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap()).unwrap();
        builder.metadata().row_groups().iter().map(|rg| rg.num_rows()).collect()
    }

    fn synthetic_rows(count: usize) -> String {
        let mut data = String::from("id,note,total\n");
        for i in 0..count {
            data.push_str(&format!("{},entry {},{}.5\n", i, i, i * 3));
        }
        data
    }

    #[test]
    fn test_batch_size_does_not_change_rows() {
        let mut data = String::from("id,note,total\n");
        for i in 0..37 {
            match i % 5 {
                0 => data.push_str(&format!("{},\"first line\nsecond line {}\",{}\n", i, i, i * 10)),
                1 => data.push_str(&format!("{},,{}\n", i, i * 10)),
                2 => data.push_str(&format!("{},\"comma, inside\",\n", i)),
                _ => data.push_str(&format!("{},plain {},{}\n", i, i, i * 10)),
            }
        }

        let temp = TempDir::new().unwrap();
        let small = temp.path().join("small.parquet");
        let whole = temp.path().join("whole.parquet");
        assert_eq!(encode(&data, 4, &small).rows, 37);
        assert_eq!(encode(&data, 1000, &whole).rows, 37);

        let chunked = decode_rows(&small);
        let single = decode_rows(&whole);
        assert_eq!(chunked.len(), 37);
        assert_eq!(chunked, single);

        // Source order survives batching
        for (i, row) in chunked.iter().enumerate() {
            assert_eq!(row[0].as_deref(), Some(i.to_string().as_str()));
        }
        assert_eq!(chunked[0][1].as_deref(), Some("first line\nsecond line 0"));
        assert_eq!(chunked[1][1], None);
        assert_eq!(chunked[2][1].as_deref(), Some("comma, inside"));

        // One provenance value for the whole file
        assert!(chunked.iter().all(|row| row[3] == chunked[0][3] && row[4] == chunked[0][4]));
        assert_eq!(chunked[0][4].as_deref(), Some("20240601"));
    }

    #[test]
    fn test_row_groups_do_not_grow_with_input() {
        let temp = TempDir::new().unwrap();
        let small = temp.path().join("small.parquet");
        let large = temp.path().join("large.parquet");

        encode(&synthetic_rows(300), 128, &small);
        let artifact = encode(&synthetic_rows(30_000), 128, &large);
        assert_eq!(artifact.rows, 30_000);

        let small_groups = row_group_sizes(&small);
        let large_groups = row_group_sizes(&large);
        assert_eq!(small_groups.iter().copied().max(), Some(128));
        assert_eq!(large_groups.iter().copied().max(), Some(128));
        assert_eq!(large_groups.len(), 30_000usize.div_ceil(128));
        assert_eq!(large_groups.iter().sum::<i64>(), 30_000);
    }

    #[test]
    fn test_header_only_produces_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.parquet");
        let artifact = encode("id,name\n", 4, &path);

        assert_eq!(artifact.rows, 0);
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(&path).unwrap()).unwrap();
        assert_eq!(builder.metadata().file_metadata().num_rows(), 0);
        assert_eq!(builder.schema().fields().len(), 4);
    }

    #[test]
    fn test_schema_mismatch_is_encoding_error() {
        let temp = TempDir::new().unwrap();
        let reader = BatchReader::new(
            Cursor::new(b"a\n1\n".to_vec()),
            "data.csv",
            4,
            MalformedRowPolicy::Abort,
        )
        .unwrap();
        let other = Enricher::new(&["b".to_string(), "c".to_string()], Provenance::new(Utc::now())).unwrap();
        let enricher = Enricher::new(reader.columns(), Provenance::new(Utc::now())).unwrap();

        let mut encoder =
            ParquetEncoder::create(other.schema(), &temp.path().join("x.parquet"), 4).unwrap();
        let batch = enricher.enrich(&reader.into_iter().next().unwrap().unwrap()).unwrap();
        let err = encoder.write_batch(&batch).unwrap_err();
        assert!(matches!(err, IngestError::Encoding(_)));
    }
}
