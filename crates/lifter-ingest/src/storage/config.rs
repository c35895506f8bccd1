use serde::Serialize;
use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::error::{IngestError, Result};

pub const DEFAULT_REGION: &str = "us-east-1";

/// Directory artifacts are published to when no bucket is configured
pub const DEFAULT_DEST_DIR: &str = "./data/published";

#[derive(Clone, Serialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Static credentials; the default AWS provider chain is used when unset
    #[serde(skip_serializing)]
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("path_style", &self.path_style)
            .finish()
    }
}

impl StorageConfig {
    /// `None` when `S3_BUCKET` is not set
    pub fn from_env() -> Result<Option<Self>> {
        let bucket = match env::var("S3_BUCKET") {
            Ok(bucket) if !bucket.is_empty() => bucket,
            _ => return Ok(None),
        };

        let path_style = match env::var("S3_PATH_STYLE") {
            Ok(value) if !value.is_empty() => value.parse().map_err(|_| {
                IngestError::config(format!("S3_PATH_STYLE={:?}: expected true or false", value))
            })?,
            _ => false,
        };

        Ok(Some(Self {
            endpoint: env::var("S3_ENDPOINT").ok().filter(|s| !s.is_empty()),
            region: env::var("S3_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string()),
            bucket,
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .ok(),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .ok(),
            path_style,
        }))
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_REGION.to_string(),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }

    pub fn for_aws(region: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            region: region.into(),
            bucket: bucket.into(),
            access_key: None,
            secret_key: None,
            path_style: false,
        }
    }

    pub(crate) fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key, &self.secret_key) {
            (Some(access), Some(secret)) => Some((access.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

/// Where artifacts are published
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Destination {
    S3(StorageConfig),
    Local { root: PathBuf },
}

impl Destination {
    /// S3 when `S3_BUCKET` is set, otherwise `LIFTER_DEST_DIR` (or the default)
    pub fn from_env() -> Result<Self> {
        if let Some(config) = StorageConfig::from_env()? {
            return Ok(Destination::S3(config));
        }
        let root = env::var("LIFTER_DEST_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEST_DIR));
        Ok(Destination::Local { root })
    }

    /// Short location for logs
    pub fn describe(&self) -> String {
        match self {
            Destination::S3(config) => format!("s3://{}", config.bucket),
            Destination::Local { root } => root.display().to_string(),
        }
    }
}
