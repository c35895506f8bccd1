//! Pipeline deduplication tests
//!
//! Tests that the pipeline correctly:
//! 1. Publishes a new payload under a digest-derived key
//! 2. Skips a payload that is already published, before extraction
//! 3. Publishes exactly one artifact when runs race on the same payload

mod common;

use anyhow::Result;
use arrow_array::{Array, StringArray, TimestampMicrosecondArray};
use common::{build_zip, Harness, NAMESPACE};
use lifter_common::checksum::compute_checksum;
use lifter_ingest::manifest::ManifestStore;
use lifter_ingest::{
    DigestScope, GateStrategy, OutputFormat, RunOutcome, RunState, SkipReason,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::File;

#[tokio::test]
async fn test_first_run_publishes_and_second_run_skips() -> Result<()> {
    let harness = Harness::start().await;
    let archive = build_zip(&[("data.csv", b"id,val\n1,10\n")]);
    let digest = compute_checksum(&archive);
    harness.serve(archive).await;

    let pipeline = harness.pipeline(harness.config());

    let first = pipeline.run().await?;
    assert_eq!(first.digest.as_str(), digest);
    assert_eq!(first.key, format!("{}/lifter-{}.parquet", NAMESPACE, digest));
    assert_eq!(
        first.states,
        vec![
            RunState::Fetched,
            RunState::Addressed,
            RunState::Extracted,
            RunState::Enriched,
            RunState::Encoded,
            RunState::Published,
        ]
    );
    assert!(matches!(first.outcome, RunOutcome::Published { rows: 1, .. }));

    let artifacts = harness.artifacts();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(
        artifacts[0],
        harness
            .dest_dir()
            .join(NAMESPACE)
            .join(format!("lifter-{}.parquet", digest))
    );

    // One row, source columns plus the two provenance columns
    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&artifacts[0])?)?.build()?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 1);

    let batch = &batches[0];
    let schema = batch.schema();
    let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(names, vec!["id", "val", "downloaded_at", "created_date"]);

    let val = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
    assert_eq!(val.value(0), "10");
    let ts = batch
        .column(2)
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .unwrap();
    assert_eq!(ts.value(0), first.ingested_at.timestamp_micros());
    let date = batch.column(3).as_any().downcast_ref::<StringArray>().unwrap();
    assert_eq!(date.value(0), first.ingested_at.format("%Y%m%d").to_string());

    let second = pipeline.run().await?;
    assert_eq!(second.digest, first.digest);
    assert_eq!(
        second.states,
        vec![RunState::Fetched, RunState::Addressed, RunState::Skipped]
    );
    assert_eq!(
        second.outcome,
        RunOutcome::Skipped {
            reason: SkipReason::ArtifactExists
        }
    );
    assert!(second.stats.is_none());
    assert_eq!(harness.artifacts().len(), 1);

    // Both runs cleaned up their staging directories
    assert!(harness.staging_runs().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_changed_payload_publishes_new_artifact() -> Result<()> {
    let harness = Harness::start().await;
    let pipeline = harness.pipeline(harness.config());

    harness.serve(build_zip(&[("data.csv", b"id,val\n1,10\n")])).await;
    let first = pipeline.run().await?;

    harness.serve(build_zip(&[("data.csv", b"id,val\n1,10\n2,20\n")])).await;
    let second = pipeline.run().await?;

    assert_ne!(first.digest, second.digest);
    assert!(first.is_published());
    assert!(second.is_published());
    assert_eq!(harness.artifacts().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_manifest_gate_skips_recorded_digest() -> Result<()> {
    let harness = Harness::start().await;
    harness.serve(build_zip(&[("data.csv", b"id,val\n1,10\n")])).await;

    let config = lifter_ingest::IngestConfig {
        gate: GateStrategy::Manifest,
        ..harness.config()
    };
    let pipeline = harness.pipeline(config);

    let first = pipeline.run().await?;
    assert!(first.is_published());

    let manifest = ManifestStore::new(harness.manifest_path()).load()?;
    assert_eq!(manifest.revision, 1);
    let entry = manifest.get(&first.key).expect("manifest entry");
    assert_eq!(entry.digest, first.digest);
    assert_eq!(entry.rows, 1);
    assert_eq!(entry.source_url, harness.source_url());

    let second = pipeline.run().await?;
    assert_eq!(
        second.outcome,
        RunOutcome::Skipped {
            reason: SkipReason::ManifestEntry
        }
    );
    assert_eq!(harness.artifacts().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_member_scope_ignores_repackaging() -> Result<()> {
    let harness = Harness::start().await;
    let config = lifter_ingest::IngestConfig {
        digest_scope: DigestScope::Member,
        ..harness.config()
    };
    let pipeline = harness.pipeline(config);

    harness
        .serve(build_zip(&[("data.csv", b"id,val\n1,10\n")]))
        .await;
    let first = pipeline.run().await?;
    assert_eq!(first.digest.as_str(), compute_checksum(b"id,val\n1,10\n"));

    // Same member, different container
    harness
        .serve(build_zip(&[("README.txt", b"release notes"), ("data.csv", b"id,val\n1,10\n")]))
        .await;
    let second = pipeline.run().await?;

    assert_eq!(second.digest, first.digest);
    assert_eq!(
        second.outcome,
        RunOutcome::Skipped {
            reason: SkipReason::ArtifactExists
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_csv_output_format() -> Result<()> {
    let harness = Harness::start().await;
    harness
        .serve(build_zip(&[("data.csv", b"id,val\n1,10\n2,\n")]))
        .await;

    let config = lifter_ingest::IngestConfig {
        output_format: OutputFormat::Csv,
        ..harness.config()
    };
    let summary = harness.pipeline(config).run().await?;
    assert!(summary.key.ends_with(".csv"));

    let artifacts = harness.artifacts();
    assert_eq!(artifacts.len(), 1);
    let text = std::fs::read_to_string(&artifacts[0])?;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "id,val,downloaded_at,created_date");
    assert!(lines[1].starts_with("1,10,"));
    assert!(lines[2].starts_with("2,,"));
    assert_eq!(lines.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_runs_publish_once() -> Result<()> {
    let harness = Harness::start().await;
    harness.serve(build_zip(&[("data.csv", b"id,val\n1,10\n2,20\n3,30\n")])).await;

    let a = harness.pipeline(harness.config());
    let b = harness.pipeline(harness.config());
    let (first, second) = tokio::join!(a.run(), b.run());
    let (first, second) = (first?, second?);

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.digest, second.digest);

    let published = [&first, &second].iter().filter(|s| s.is_published()).count();
    assert_eq!(published, 1);
    for summary in [&first, &second] {
        if let RunOutcome::Skipped { reason } = summary.outcome {
            assert!(matches!(
                reason,
                SkipReason::ArtifactExists | SkipReason::LostPublishRace
            ));
        }
    }

    assert_eq!(harness.artifacts().len(), 1);
    assert!(harness.staging_runs().is_empty());

    let manifest = ManifestStore::new(harness.manifest_path()).load()?;
    assert_eq!(manifest.len(), 1);
    Ok(())
}
