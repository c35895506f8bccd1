//! Error taxonomy for ingest runs
//!
//! Each pipeline stage surfaces one of these kinds. Transport and
//! destination-state failures may be retried; structural and parse failures
//! never are, since a retry cannot change their outcome.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Source fetch failed: connection, non-success status or truncated body
    #[error("Transfer from {url} failed: {message}")]
    Transfer {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("No member matching {wanted} found in archive {archive}")]
    MemberNotFound { archive: PathBuf, wanted: String },

    #[error("Archive {archive} holds {} candidate data members ({}); configure an explicit member name", .candidates.len(), .candidates.join(", "))]
    AmbiguousMember {
        archive: PathBuf,
        candidates: Vec<String>,
    },

    /// The container itself could not be read
    #[error("Invalid archive {archive}: {message}")]
    InvalidArchive { archive: PathBuf, message: String },

    #[error("Malformed record at line {line}: {reason}")]
    MalformedRecord { line: u64, reason: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Publish to {key} failed: {message}")]
    Publish { key: String, message: String },

    #[error("Destination state check failed: {0}")]
    StateCheck(String),

    /// The manifest already maps the key to another digest. Permanent.
    #[error("Manifest maps {key} to digest {recorded}, refusing {offered}")]
    ManifestConflict {
        key: String,
        recorded: String,
        offered: String,
    },

    /// Local staging-directory IO
    #[error("Staging error at {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    pub fn transfer(url: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transfer {
            url: url.into(),
            status,
            message: message.into(),
        }
    }

    pub fn publish(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn state_check(message: impl Into<String>) -> Self {
        Self::StateCheck(message.into())
    }

    pub fn manifest_conflict(
        key: impl Into<String>,
        recorded: impl ToString,
        offered: impl ToString,
    ) -> Self {
        Self::ManifestConflict {
            key: key.into(),
            recorded: recorded.to_string(),
            offered: offered.to_string(),
        }
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn malformed(line: u64, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            line,
            reason: reason.into(),
        }
    }

    pub fn invalid_archive(archive: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidArchive {
            archive: archive.into(),
            message: message.into(),
        }
    }

    pub fn staging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Staging {
            path: path.into(),
            source,
        }
    }

    /// Stable label for logs and run summaries
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transfer { .. } => "transfer_error",
            Self::MemberNotFound { .. } => "member_not_found_error",
            Self::AmbiguousMember { .. } => "ambiguous_member_error",
            Self::InvalidArchive { .. } => "invalid_archive_error",
            Self::MalformedRecord { .. } => "malformed_record_error",
            Self::Encoding(_) => "encoding_error",
            Self::Publish { .. } => "publish_error",
            Self::StateCheck(_) => "state_check_error",
            Self::ManifestConflict { .. } => "manifest_conflict_error",
            Self::Staging { .. } => "staging_error",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether another attempt could plausibly succeed
    ///
    /// Client-side HTTP statuses (4xx other than 408/429) are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transfer { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500 || *code == 408 || *code == 429,
            },
            Self::Publish { .. } | Self::StateCheck(_) => true,
            _ => false,
        }
    }
}

/// Pipeline stage names used in run summaries and failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Address,
    Gate,
    Extract,
    Enrich,
    Encode,
    Publish,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Address => "address",
            Stage::Gate => "gate",
            Stage::Extract => "extract",
            Stage::Enrich => "enrich",
            Stage::Encode => "encode",
            Stage::Publish => "publish",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Terminal failure of one run: the stage that failed and why
#[derive(Error, Debug)]
#[error("ingest run {run_id} failed at {stage} stage ({}): {error}", .error.kind())]
pub struct RunFailure {
    pub run_id: uuid::Uuid,
    pub stage: Stage,
    #[source]
    pub error: IngestError,
    /// Staged files kept for diagnosis
    pub staging_dir: PathBuf,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_retry_depends_on_status() {
        assert!(IngestError::transfer("http://x", None, "connection reset").is_retryable());
        assert!(IngestError::transfer("http://x", Some(503), "unavailable").is_retryable());
        assert!(IngestError::transfer("http://x", Some(429), "slow down").is_retryable());
        assert!(!IngestError::transfer("http://x", Some(404), "not found").is_retryable());
    }

    #[test]
    fn test_structural_errors_are_not_retryable() {
        assert!(!IngestError::malformed(3, "bad").is_retryable());
        assert!(!IngestError::encoding("bad").is_retryable());
        assert!(!IngestError::MemberNotFound {
            archive: PathBuf::from("a.zip"),
            wanted: "*.csv".into(),
        }
        .is_retryable());
        assert!(IngestError::publish("k", "timeout").is_retryable());
        assert!(IngestError::state_check("timeout").is_retryable());
        assert!(!IngestError::manifest_conflict("ns/a", "aaaa", "bbbb").is_retryable());
    }

    #[test]
    fn test_ambiguous_member_lists_candidates() {
        let err = IngestError::AmbiguousMember {
            archive: PathBuf::from("a.zip"),
            candidates: vec!["a.csv".into(), "b.csv".into()],
        };
        let message = err.to_string();
        assert!(message.contains("2 candidate"));
        assert!(message.contains("a.csv, b.csv"));
        assert_eq!(err.kind(), "ambiguous_member_error");
    }

    #[test]
    fn test_run_failure_names_stage() {
        let failure = RunFailure {
            run_id: uuid::Uuid::nil(),
            stage: Stage::Enrich,
            error: IngestError::malformed(7, "expected 2 fields, found 3"),
            staging_dir: PathBuf::from("/tmp/x"),
        };
        let message = failure.to_string();
        assert!(message.contains("enrich stage"));
        assert!(message.contains("malformed_record_error"));
        assert!(message.contains("line 7"));
    }
}
