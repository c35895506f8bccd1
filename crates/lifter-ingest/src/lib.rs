//! Lifter Ingest Library
//!
//! Idempotent ingestion of the OpenPowerlifting bulk export. A run downloads
//! the source archive, identifies it by SHA-256 digest, and publishes an
//! enriched columnar artifact at a key derived from that digest. A payload
//! that was already published is recognised before any extraction happens.
//!
//! # Pipeline
//!
//! - **fetch**: streaming download into a per-run staging directory
//! - **digest**: content addressing over the archive or its data member
//! - **gate**: existence- or manifest-based dedup decision
//! - **extract**: single data member selection and extraction
//! - **enrich**: batched CSV reading with provenance columns
//! - **encode**: Parquet (default) or CSV output
//! - **publish**: conditional put to S3 or a local directory, then manifest update
//!
//! # Example
//!
//! ```no_run
//! use lifter_ingest::{storage, IngestConfig, IngestPipeline};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let destination = storage::Destination::from_env()?;
//!     let store = storage::connect(&destination, Duration::from_secs(300)).await?;
//!
//!     let summary = IngestPipeline::new(config, store)?.run().await?;
//!     println!("{:?}", summary.outcome);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod artifact;
pub mod config;
pub mod digest;
pub mod encode;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod gate;
pub mod manifest;
pub mod pipeline;
pub mod publish;
pub mod retry;
pub mod storage;

pub use artifact::ArtifactKey;
pub use config::{IngestConfig, MemberSelector};
pub use digest::{ContentAddresser, ContentDigest, DigestScope};
pub use encode::OutputFormat;
pub use enrich::MalformedRowPolicy;
pub use error::{IngestError, Result, RunFailure, Stage};
pub use gate::{GateStrategy, SkipReason};
pub use pipeline::{IngestPipeline, RunOutcome, RunState, RunSummary};
