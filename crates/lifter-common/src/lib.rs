//! Lifter Common Library
//!
//! Shared utilities for the lifter ingest workspace.
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Checksums**: streaming SHA-256 over files and readers
//! - **Logging**: `tracing` subscriber configuration shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use lifter_common::checksum::compute_file_checksum;
//!
//! fn fingerprint(path: &str) -> lifter_common::Result<()> {
//!     let digest = compute_file_checksum(path)?;
//!     tracing::info!(%digest, "computed archive digest");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
