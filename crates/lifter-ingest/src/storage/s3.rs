use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{
        http::HttpResponse, retry::RetryConfig, timeout::TimeoutConfig, Credentials, Region,
    },
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    Client,
};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::config::StorageConfig;
use super::{ObjectStore, PutOutcome};
use crate::error::{IngestError, Result};

/// Returned when `If-None-Match: *` finds an existing object
const PRECONDITION_FAILED: u16 = 412;

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(config: StorageConfig, timeout: Duration) -> Result<Self> {
        debug!(
            bucket = %config.bucket,
            endpoint = ?config.endpoint,
            region = %config.region,
            "Initializing S3 store"
        );

        let timeouts = TimeoutConfig::builder().operation_timeout(timeout).build();

        let mut builder = match config.static_credentials() {
            Some((access_key, secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "lifter-storage");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            None => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        // Attempts are bounded by the caller's RetryPolicy alone
        builder = builder
            .force_path_style(config.path_style)
            .timeout_config(timeouts)
            .retry_config(RetryConfig::disabled());
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!(bucket = %config.bucket, "S3 store initialized");

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    Ok(false)
                } else {
                    Err(IngestError::state_check(format!(
                        "HEAD s3://{}/{} failed: {}",
                        self.bucket,
                        key,
                        DisplayErrorContext(&e)
                    )))
                }
            },
        }
    }

    #[instrument(skip(self, path))]
    async fn put_if_absent(
        &self,
        key: &str,
        path: &Path,
        content_type: Option<&str>,
    ) -> Result<PutOutcome> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| IngestError::publish(key, format!("reading {}: {}", path.display(), e)))?;

        debug!("Uploading {} to s3://{}/{}", path.display(), self.bucket, key);

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .if_none_match("*");
        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        match request.send().await {
            Ok(_) => {
                info!("Successfully uploaded to s3://{}/{}", self.bucket, key);
                Ok(PutOutcome::Created)
            },
            Err(e) if http_status(&e) == Some(PRECONDITION_FAILED) => {
                debug!("s3://{}/{} already exists", self.bucket, key);
                Ok(PutOutcome::AlreadyExists)
            },
            Err(e) => Err(IngestError::publish(
                format!("s3://{}/{}", self.bucket, key),
                DisplayErrorContext(&e).to_string(),
            )),
        }
    }

    fn describe(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

fn http_status<E>(error: &SdkError<E, HttpResponse>) -> Option<u16> {
    error.raw_response().map(|response| response.status().as_u16())
}
