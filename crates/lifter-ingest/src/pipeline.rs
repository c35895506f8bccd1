//! Ingest run orchestration
//!
//! One run moves through
//!
//! ```text
//! FETCHED -> ADDRESSED -> SKIPPED
//!                      -> EXTRACTED -> ENRICHED -> ENCODED -> PUBLISHED
//! ```
//!
//! and any stage may end it in FAILED. Each run stages files under its own
//! `<staging>/<run_id>/` directory, which is removed when the run reaches a
//! terminal success state and kept for inspection when it fails.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::artifact::ArtifactKey;
use crate::config::IngestConfig;
use crate::digest::{ContentAddresser, ContentDigest};
use crate::encode::{create_encoder, EncodedArtifact, OutputFormat};
use crate::enrich::{BatchReader, EnrichStats, Enricher, MalformedRowPolicy, Provenance};
use crate::error::{IngestError, Result, RunFailure, Stage};
use crate::extract::{DataMember, Extractor};
use crate::fetch::Fetcher;
use crate::gate::{DedupGate, GateDecision, SkipReason};
use crate::manifest::ManifestStore;
use crate::publish::{PublishOutcome, Publisher};
use crate::storage::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Fetched,
    Addressed,
    Skipped,
    Extracted,
    Enriched,
    Encoded,
    Published,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Fetched => "FETCHED",
            RunState::Addressed => "ADDRESSED",
            RunState::Skipped => "SKIPPED",
            RunState::Extracted => "EXTRACTED",
            RunState::Enriched => "ENRICHED",
            RunState::Encoded => "ENCODED",
            RunState::Published => "PUBLISHED",
            RunState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Published { bytes: u64, rows: u64 },
    Skipped { reason: SkipReason },
}

/// Result of a run that reached PUBLISHED or SKIPPED
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_url: String,
    pub digest: ContentDigest,
    /// Destination object key
    pub key: String,
    pub destination: String,
    pub outcome: RunOutcome,
    /// States entered, in order
    pub states: Vec<RunState>,
    /// Absent when the run was skipped before extraction
    pub stats: Option<EnrichStats>,
    pub ingested_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn is_published(&self) -> bool {
        matches!(self.outcome, RunOutcome::Published { .. })
    }
}

/// Per-run bookkeeping: state trail and failure reporting
struct RunTracker {
    run_id: Uuid,
    staging: PathBuf,
    states: Vec<RunState>,
}

impl RunTracker {
    fn new(run_id: Uuid, staging: PathBuf) -> Self {
        Self {
            run_id,
            staging,
            states: Vec::new(),
        }
    }

    fn advance(&mut self, state: RunState) {
        info!(state = %state, "Run state changed");
        self.states.push(state);
    }

    fn fail(&mut self, stage: Stage, error: IngestError) -> RunFailure {
        self.states.push(RunState::Failed);
        error!(
            stage = %stage,
            kind = error.kind(),
            error = %error,
            staging = %self.staging.display(),
            "Run failed; staged files kept"
        );
        RunFailure {
            run_id: self.run_id,
            stage,
            error,
            staging_dir: self.staging.clone(),
        }
    }
}

pub struct IngestPipeline {
    config: IngestConfig,
    fetcher: Fetcher,
    store: Arc<dyn ObjectStore>,
    manifest: ManifestStore,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config.validate()?;
        let fetcher = Fetcher::new(
            config.request_timeout(),
            config.connect_timeout(),
            config.show_progress,
        )?;
        let manifest = ManifestStore::new(&config.manifest_path);

        Ok(Self {
            config,
            fetcher,
            store,
            manifest,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Execute one run end to end
    pub async fn run(&self) -> std::result::Result<RunSummary, RunFailure> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id);
        self.execute(run_id).instrument(span).await
    }

    async fn execute(&self, run_id: Uuid) -> std::result::Result<RunSummary, RunFailure> {
        let started = Instant::now();
        let config = &self.config;
        let staging = config.staging_dir.join(run_id.to_string());
        let mut run = RunTracker::new(run_id, staging.clone());
        let retry = config.retry_policy();

        info!(
            source = %config.source_url,
            namespace = %config.namespace,
            gate = %config.gate,
            format = %config.output_format,
            "Starting ingest run"
        );

        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| run.fail(Stage::Fetch, IngestError::staging(&staging, e)))?;

        // Fetch
        let url = config.source_url.as_str();
        let archive = retry
            .run("fetch", |_| self.fetcher.fetch(url, &staging))
            .await
            .map_err(|e| run.fail(Stage::Fetch, e))?;
        run.advance(RunState::Fetched);

        // Address
        let addresser =
            ContentAddresser::new(config.digest_scope, Extractor::new(config.member.clone()));
        let digest = {
            let archive = archive.clone();
            blocking(move || addresser.address(&archive))
                .await
                .map_err(|e| run.fail(Stage::Address, e))?
        };
        run.advance(RunState::Addressed);

        let key = ArtifactKey::new(
            &config.namespace,
            &config.artifact_prefix,
            &digest,
            config.output_format.extension(),
        );
        let destination = self.store.describe(&key.as_key());
        info!(digest = %digest, key = %key, "Artifact key derived");

        // Gate
        let gate = DedupGate::new(
            config.gate,
            Arc::clone(&self.store),
            self.manifest.clone(),
            retry,
        );
        let decision = gate
            .check(&key, &digest)
            .await
            .map_err(|e| run.fail(Stage::Gate, e))?;

        if let GateDecision::Skip(reason) = decision {
            info!(reason = %reason, destination = %destination, "Payload already published; skipping");
            run.advance(RunState::Skipped);
            return Ok(self.finish(
                run,
                archive.source_url,
                archive.downloaded_at,
                digest,
                key,
                destination,
                RunOutcome::Skipped { reason },
                None,
                started,
            ).await);
        }

        // Extract
        let member = {
            let extractor = Extractor::new(config.member.clone());
            let archive = archive.clone();
            let staging = staging.clone();
            blocking(move || extractor.extract(&archive, &staging))
                .await
                .map_err(|e| run.fail(Stage::Extract, e))?
        };
        run.advance(RunState::Extracted);

        // Enrich and encode, streamed batch by batch
        let provenance = Provenance::new(archive.downloaded_at);
        let output = staging.join(key.basename());
        let settings = TransformSettings {
            batch_size: config.batch_size,
            policy: config.malformed_rows,
            format: config.output_format,
        };
        let (artifact, stats) =
            match tokio::task::spawn_blocking(move || transform(&member, provenance, &output, settings))
                .await
            {
                Ok(Ok(done)) => done,
                Ok(Err((stage, e))) => return Err(run.fail(stage, e)),
                Err(e) => {
                    return Err(run.fail(
                        Stage::Encode,
                        IngestError::Internal(format!("encode task failed: {}", e)),
                    ))
                },
            };
        info!(
            rows_read = stats.rows_read,
            rows_written = stats.rows_written,
            rows_skipped = stats.rows_skipped,
            batches = stats.batches,
            "Member enriched"
        );
        run.advance(RunState::Enriched);
        run.advance(RunState::Encoded);

        // Publish
        let publisher = Publisher::new(Arc::clone(&self.store), self.manifest.clone(), retry);
        let published = publisher
            .publish(run_id, &artifact, &key, &digest, config.output_format, url)
            .await
            .map_err(|e| run.fail(Stage::Publish, e))?;

        let outcome = match published {
            PublishOutcome::Created => {
                run.advance(RunState::Published);
                RunOutcome::Published {
                    bytes: artifact.bytes,
                    rows: artifact.rows,
                }
            },
            PublishOutcome::AlreadyPresent => {
                run.advance(RunState::Skipped);
                RunOutcome::Skipped {
                    reason: SkipReason::LostPublishRace,
                }
            },
        };

        Ok(self.finish(
            run,
            archive.source_url,
            archive.downloaded_at,
            digest,
            key,
            destination,
            outcome,
            Some(stats),
            started,
        ).await)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        run: RunTracker,
        source_url: String,
        ingested_at: DateTime<Utc>,
        digest: ContentDigest,
        key: ArtifactKey,
        destination: String,
        outcome: RunOutcome,
        stats: Option<EnrichStats>,
        started: Instant,
    ) -> RunSummary {
        remove_staging(&run.staging).await;

        let summary = RunSummary {
            run_id: run.run_id,
            source_url,
            digest,
            key: key.as_key(),
            destination,
            outcome,
            states: run.states,
            stats,
            ingested_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            outcome = ?summary.outcome,
            duration_ms = summary.duration_ms,
            "Ingest run complete"
        );
        summary
    }
}

#[derive(Debug, Clone, Copy)]
struct TransformSettings {
    batch_size: usize,
    policy: MalformedRowPolicy,
    format: OutputFormat,
}

/// Stream the member through the enricher into the encoder. Blocking.
fn transform(
    member: &DataMember,
    provenance: Provenance,
    output: &Path,
    settings: TransformSettings,
) -> std::result::Result<(EncodedArtifact, EnrichStats), (Stage, IngestError)> {
    let enrich = |e| (Stage::Enrich, e);
    let encode = |e| (Stage::Encode, e);

    let mut reader =
        BatchReader::open(&member.path, settings.batch_size, settings.policy).map_err(enrich)?;
    let enricher = Enricher::new(reader.columns(), provenance).map_err(enrich)?;
    let mut encoder = create_encoder(settings.format, enricher.schema(), output, settings.batch_size)
        .map_err(encode)?;

    for batch in reader.by_ref() {
        let batch = batch.map_err(enrich)?;
        let record_batch = enricher.enrich(&batch).map_err(enrich)?;
        encoder.write_batch(&record_batch).map_err(encode)?;
    }
    let reader_stats = reader.stats();

    let artifact = encoder.finish().map_err(encode)?;
    drop(reader);

    // The member is consumed; only the archive and artifact stay staged
    match std::fs::remove_file(&member.path) {
        Ok(()) => debug!(path = %member.path.display(), "Removed extracted member"),
        Err(e) => warn!(path = %member.path.display(), error = %e, "Failed to remove extracted member"),
    }

    Ok((artifact, reader_stats))
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| IngestError::Internal(format!("blocking task failed: {}", e)))?
}

async fn remove_staging(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staging directory"),
    }
}
