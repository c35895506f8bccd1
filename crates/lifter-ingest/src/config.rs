//! Ingest configuration
//!
//! Values come from `LIFTER_*` environment variables (a `.env` file is
//! honoured) with the defaults below; the CLI overrides individual fields.

use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::digest::DigestScope;
use crate::encode::OutputFormat;
use crate::enrich::MalformedRowPolicy;
use crate::error::{IngestError, Result};
use crate::gate::GateStrategy;
use crate::retry::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};

// ============================================================================
// Defaults
// ============================================================================

/// Latest OpenPowerlifting bulk export
pub const DEFAULT_SOURCE_URL: &str =
    "https://openpowerlifting.gitlab.io/opl-csv/files/openpowerlifting-latest.zip";

pub const DEFAULT_NAMESPACE: &str = "data/raw/openpowerlifting/lifter";

pub const DEFAULT_STAGING_DIR: &str = "./data/temp";

pub const DEFAULT_MANIFEST_PATH: &str = "./data/manifest.json";

pub const DEFAULT_MEMBER_EXTENSION: &str = "csv";

/// Artifact base names are `<prefix>-<digest>.<ext>`
pub const DEFAULT_ARTIFACT_PREFIX: &str = "lifter";

/// Rows per batch; peak memory is proportional to one batch
pub const DEFAULT_BATCH_SIZE: usize = 300_000;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Rules for picking the data member out of the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberSelector {
    /// Extension without the dot, compared case-insensitively
    pub extension: String,
    /// Exact base name; required when the archive holds several candidates
    pub name: Option<String>,
}

impl Default for MemberSelector {
    fn default() -> Self {
        Self {
            extension: DEFAULT_MEMBER_EXTENSION.to_string(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestConfig {
    pub source_url: String,
    /// Destination prefix the artifact is published under
    pub namespace: String,
    pub staging_dir: PathBuf,
    pub artifact_prefix: String,
    pub member: MemberSelector,
    pub digest_scope: DigestScope,
    pub batch_size: usize,
    pub malformed_rows: MalformedRowPolicy,
    pub output_format: OutputFormat,
    pub gate: GateStrategy,
    /// Manifest file; consulted by the manifest gate and updated after every publish
    pub manifest_path: PathBuf,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Draw a download progress bar
    pub show_progress: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_url: DEFAULT_SOURCE_URL.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            artifact_prefix: DEFAULT_ARTIFACT_PREFIX.to_string(),
            member: MemberSelector::default(),
            digest_scope: DigestScope::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            malformed_rows: MalformedRowPolicy::default(),
            output_format: OutputFormat::default(),
            gate: GateStrategy::default(),
            manifest_path: PathBuf::from(DEFAULT_MANIFEST_PATH),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            retry_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            show_progress: false,
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables and defaults
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            source_url: env_or("LIFTER_SOURCE_URL", defaults.source_url),
            namespace: env_or("LIFTER_NAMESPACE", defaults.namespace),
            staging_dir: env_or("LIFTER_STAGING_DIR", defaults.staging_dir),
            artifact_prefix: env_or("LIFTER_ARTIFACT_PREFIX", defaults.artifact_prefix),
            member: MemberSelector {
                extension: env_or("LIFTER_MEMBER_EXTENSION", defaults.member.extension),
                name: std::env::var("LIFTER_MEMBER_NAME").ok().filter(|s| !s.is_empty()),
            },
            digest_scope: env_parse("LIFTER_DIGEST_SCOPE", defaults.digest_scope)?,
            batch_size: env_parse("LIFTER_BATCH_SIZE", defaults.batch_size)?,
            malformed_rows: env_parse("LIFTER_MALFORMED_ROWS", defaults.malformed_rows)?,
            output_format: env_parse("LIFTER_OUTPUT_FORMAT", defaults.output_format)?,
            gate: env_parse("LIFTER_GATE", defaults.gate)?,
            manifest_path: env_or("LIFTER_MANIFEST_PATH", defaults.manifest_path),
            request_timeout_secs: env_parse(
                "LIFTER_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,
            connect_timeout_secs: env_parse(
                "LIFTER_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout_secs,
            )?,
            retry_attempts: env_parse("LIFTER_RETRY_ATTEMPTS", defaults.retry_attempts)?,
            retry_base_delay_ms: env_parse(
                "LIFTER_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            )?,
            show_progress: env_parse("LIFTER_SHOW_PROGRESS", defaults.show_progress)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_url.trim().is_empty() {
            return Err(IngestError::config("source URL cannot be empty"));
        }
        if !(self.source_url.starts_with("http://") || self.source_url.starts_with("https://")) {
            return Err(IngestError::config(format!(
                "source URL must be http(s): {}",
                self.source_url
            )));
        }
        if self.namespace.trim_matches('/').is_empty() {
            return Err(IngestError::config("namespace cannot be empty"));
        }
        if self.artifact_prefix.is_empty() || self.artifact_prefix.contains('/') {
            return Err(IngestError::config(format!(
                "artifact prefix must be a non-empty name without '/': {:?}",
                self.artifact_prefix
            )));
        }
        if self.member.extension.trim_start_matches('.').is_empty() {
            return Err(IngestError::config("member extension cannot be empty"));
        }
        if self.batch_size == 0 {
            return Err(IngestError::config("batch size must be greater than 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(IngestError::config("request timeout must be greater than 0"));
        }
        if self.retry_attempts == 0 {
            return Err(IngestError::config("retry attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }
}

fn env_or<T: From<String>>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => T::from(value),
        _ => default,
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value
            .parse()
            .map_err(|e| IngestError::config(format!("{}={:?}: {}", name, value, e))),
        _ => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with("LIFTER_") {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 300_000);
        assert_eq!(config.namespace, "data/raw/openpowerlifting/lifter");
        assert_eq!(config.member.extension, "csv");
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = IngestConfig {
            batch_size: 0,
            ..IngestConfig::default()
        };
        assert!(matches!(config.validate(), Err(IngestError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_non_http_source() {
        let config = IngestConfig {
            source_url: "ftp://example.org/latest.zip".into(),
            ..IngestConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("LIFTER_BATCH_SIZE", "1000");
        std::env::set_var("LIFTER_MALFORMED_ROWS", "skip");
        std::env::set_var("LIFTER_GATE", "manifest");
        std::env::set_var("LIFTER_OUTPUT_FORMAT", "csv");
        std::env::set_var("LIFTER_MEMBER_NAME", "openpowerlifting.csv");

        let config = IngestConfig::from_env().unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.malformed_rows, MalformedRowPolicy::Skip);
        assert_eq!(config.gate, GateStrategy::Manifest);
        assert_eq!(config.output_format, OutputFormat::Csv);
        assert_eq!(config.member.name.as_deref(), Some("openpowerlifting.csv"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        clear_env();
        std::env::set_var("LIFTER_BATCH_SIZE", "lots");
        let err = IngestConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("LIFTER_BATCH_SIZE"));
        clear_env();
    }
}
