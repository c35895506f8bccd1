//! Shared fixtures for pipeline integration tests
//!
//! A [`Harness`] serves an in-memory zip archive from a wiremock server and
//! publishes into a temporary directory, so whole runs execute without
//! network access or S3.

#![allow(dead_code)]

use lifter_ingest::storage::LocalStore;
use lifter_ingest::{IngestConfig, IngestPipeline};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const ARCHIVE_PATH: &str = "/files/openpowerlifting-latest.zip";
pub const NAMESPACE: &str = "ns";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lifter_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Zip archive holding `entries` in order
pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start zip entry");
        writer.write_all(data).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

pub struct Harness {
    pub server: MockServer,
    pub temp: TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        init_tracing();
        Self {
            server: MockServer::start().await,
            temp: TempDir::new().expect("temp dir"),
        }
    }

    /// Replace whatever the server returns with `body`
    pub async fn serve(&self, body: Vec<u8>) {
        self.server.reset().await;
        Mock::given(method("GET"))
            .and(path(ARCHIVE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&self.server)
            .await;
    }

    pub fn source_url(&self) -> String {
        format!("{}{}", self.server.uri(), ARCHIVE_PATH)
    }

    pub fn dest_dir(&self) -> PathBuf {
        self.temp.path().join("dest")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.temp.path().join("staging")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.temp.path().join("state").join("manifest.json")
    }

    pub fn config(&self) -> IngestConfig {
        IngestConfig {
            source_url: self.source_url(),
            namespace: NAMESPACE.to_string(),
            staging_dir: self.staging_dir(),
            manifest_path: self.manifest_path(),
            batch_size: 2,
            retry_attempts: 3,
            retry_base_delay_ms: 1,
            request_timeout_secs: 10,
            connect_timeout_secs: 5,
            ..IngestConfig::default()
        }
    }

    pub fn store(&self) -> Arc<LocalStore> {
        Arc::new(LocalStore::new(self.dest_dir()).expect("local store"))
    }

    pub fn pipeline(&self, config: IngestConfig) -> IngestPipeline {
        IngestPipeline::new(config, self.store()).expect("pipeline")
    }

    /// Published artifact files, sorted
    pub fn artifacts(&self) -> Vec<PathBuf> {
        list_files(&self.dest_dir().join(NAMESPACE))
    }

    /// Per-run staging directories still present
    pub fn staging_runs(&self) -> Vec<PathBuf> {
        list_files(&self.staging_dir())
    }
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.expect("dir entry").path())
            .filter(|p| {
                !p.file_name()
                    .map(|n| n.to_string_lossy().starts_with('.'))
                    .unwrap_or(false)
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}
