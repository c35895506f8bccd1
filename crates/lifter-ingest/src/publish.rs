//! Publishing encoded artifacts
//!
//! The destination is written with a conditional put and the manifest is
//! updated only once the destination has confirmed the object, so the
//! manifest never names an artifact that does not exist.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact::ArtifactKey;
use crate::digest::ContentDigest;
use crate::encode::{EncodedArtifact, OutputFormat};
use crate::error::Result;
use crate::manifest::{ManifestEntry, ManifestStore};
use crate::retry::RetryPolicy;
use crate::storage::{ObjectStore, PutOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Created,
    /// Another writer got there first; the existing object is untouched
    AlreadyPresent,
}

pub struct Publisher {
    store: Arc<dyn ObjectStore>,
    manifest: ManifestStore,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(store: Arc<dyn ObjectStore>, manifest: ManifestStore, retry: RetryPolicy) -> Self {
        Self {
            store,
            manifest,
            retry,
        }
    }

    pub async fn publish(
        &self,
        run_id: Uuid,
        artifact: &EncodedArtifact,
        key: &ArtifactKey,
        digest: &ContentDigest,
        format: OutputFormat,
        source_url: &str,
    ) -> Result<PublishOutcome> {
        let object_key = key.as_key();
        let location = self.store.describe(&object_key);

        let put = self
            .retry
            .run("publish", |_| {
                self.store
                    .put_if_absent(&object_key, &artifact.path, Some(format.content_type()))
            })
            .await?;

        let outcome = match put {
            PutOutcome::Created => {
                info!(
                    destination = %location,
                    bytes = artifact.bytes,
                    rows = artifact.rows,
                    "Artifact published"
                );
                PublishOutcome::Created
            },
            PutOutcome::AlreadyExists => {
                warn!(destination = %location, "Artifact appeared concurrently; keeping existing object");
                PublishOutcome::AlreadyPresent
            },
        };

        let holder = run_id.to_string();
        self.retry
            .run("manifest update", |_| {
                let entry = ManifestEntry {
                    digest: digest.clone(),
                    artifact: location.clone(),
                    source_url: source_url.to_string(),
                    rows: artifact.rows,
                    bytes: artifact.bytes,
                    published_at: Utc::now(),
                };
                let manifest = &self.manifest;
                let object_key = &object_key;
                let holder = &holder;
                async move { manifest.record(object_key, entry, holder).await }
            })
            .await?;

        Ok(outcome)
    }
}
