//! Source archive download
//!
//! The body is streamed to `<name>.part` in the run's staging directory,
//! flushed to disk, length-checked and only then renamed into place, so a
//! failed or truncated transfer never leaves a file that looks complete.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{IngestError, Result};

/// File name used when the URL has no usable last path segment
const FALLBACK_ARCHIVE_NAME: &str = "archive.zip";

const USER_AGENT: &str = concat!("lifter-ingest/", env!("CARGO_PKG_VERSION"));

/// A fully downloaded source archive
#[derive(Debug, Clone)]
pub struct Archive {
    pub source_url: String,
    pub path: PathBuf,
    pub byte_length: u64,
    /// Download completion time; the ingest timestamp of the run
    pub downloaded_at: DateTime<Utc>,
}

pub struct Fetcher {
    client: reqwest::Client,
    show_progress: bool,
}

impl Fetcher {
    pub fn new(
        request_timeout: Duration,
        connect_timeout: Duration,
        show_progress: bool,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| IngestError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            show_progress,
        })
    }

    /// Download `url` into `staging_dir`
    pub async fn fetch(&self, url: &str, staging_dir: &Path) -> Result<Archive> {
        let file_name = archive_file_name(url);
        let target = staging_dir.join(&file_name);
        let partial = staging_dir.join(format!("{}.part", file_name));

        info!(url, target = %target.display(), "Downloading source archive");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transfer_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::transfer(
                url,
                Some(status.as_u16()),
                format!("server responded with {}", status),
            ));
        }

        let expected = response.content_length();
        let received = match self.stream_body(url, response, &partial, expected).await {
            Ok(received) => received,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            },
        };

        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| IngestError::staging(&target, e))?;
        let downloaded_at = Utc::now();

        info!(url, bytes = received, "Download complete");

        Ok(Archive {
            source_url: url.to_string(),
            path: target,
            byte_length: received,
            downloaded_at,
        })
    }

    async fn stream_body(
        &self,
        url: &str,
        response: reqwest::Response,
        partial: &Path,
        expected: Option<u64>,
    ) -> Result<u64> {
        let pb = self.progress_bar(expected, partial);
        let mut file = File::create(partial)
            .await
            .map_err(|e| IngestError::staging(partial, e))?;

        let mut received = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transfer_error(url, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| IngestError::staging(partial, e))?;
            received += chunk.len() as u64;
            pb.set_position(received);
        }

        file.flush().await.map_err(|e| IngestError::staging(partial, e))?;
        file.sync_all().await.map_err(|e| IngestError::staging(partial, e))?;
        pb.finish_and_clear();

        if let Some(expected) = expected {
            if received != expected {
                return Err(IngestError::transfer(
                    url,
                    None,
                    format!("truncated body: expected {} bytes, received {}", expected, received),
                ));
            }
        }

        debug!(path = %partial.display(), bytes = received, "Body written");
        Ok(received)
    }

    fn progress_bar(&self, total: Option<u64>, partial: &Path) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(total.unwrap_or(0));
        let style = ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_message(format!(
            "Downloading {}",
            partial.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        ));
        pb
    }
}

fn transfer_error(url: &str, error: reqwest::Error) -> IngestError {
    let status = error.status().map(|s| s.as_u16());
    let message = if error.is_timeout() {
        format!("timed out: {}", error)
    } else {
        error.to_string()
    };
    IngestError::transfer(url, status, message)
}

/// Last URL path segment, reduced to a plain file name
fn archive_file_name(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| FALLBACK_ARCHIVE_NAME.to_string())
}
