//! Dedup gate
//!
//! Decides, from the digest alone, whether a run goes on to extraction.
//! Nothing past this point runs for a payload that is already published.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::artifact::ArtifactKey;
use crate::digest::ContentDigest;
use crate::error::{IngestError, Result};
use crate::manifest::ManifestStore;
use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStrategy {
    /// Ask the destination whether the artifact key exists
    #[default]
    Existence,
    /// Consult the manifest file
    Manifest,
}

impl fmt::Display for GateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateStrategy::Existence => f.write_str("existence"),
            GateStrategy::Manifest => f.write_str("manifest"),
        }
    }
}

impl FromStr for GateStrategy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "existence" => Ok(GateStrategy::Existence),
            "manifest" => Ok(GateStrategy::Manifest),
            other => Err(IngestError::config(format!(
                "unknown gate strategy '{}' (expected existence or manifest)",
                other
            ))),
        }
    }
}

/// Why a run ended without publishing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The destination already holds the artifact key
    ArtifactExists,
    /// The manifest already records the digest
    ManifestEntry,
    /// A concurrent run published the same artifact first
    LostPublishRace,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::ArtifactExists => "artifact already exists at destination",
            SkipReason::ManifestEntry => "digest already recorded in manifest",
            SkipReason::LostPublishRace => "artifact published concurrently by another run",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Open,
    Skip(SkipReason),
}

pub struct DedupGate {
    strategy: GateStrategy,
    store: Arc<dyn ObjectStore>,
    manifest: ManifestStore,
    retry: RetryPolicy,
}

impl DedupGate {
    pub fn new(
        strategy: GateStrategy,
        store: Arc<dyn ObjectStore>,
        manifest: ManifestStore,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            strategy,
            store,
            manifest,
            retry,
        }
    }

    pub async fn check(&self, key: &ArtifactKey, digest: &ContentDigest) -> Result<GateDecision> {
        let decision = match self.strategy {
            GateStrategy::Existence => {
                let object_key = key.as_key();
                let exists = self
                    .retry
                    .run("destination existence check", |_| self.store.exists(&object_key))
                    .await?;
                if exists {
                    GateDecision::Skip(SkipReason::ArtifactExists)
                } else {
                    GateDecision::Open
                }
            },
            GateStrategy::Manifest => {
                let manifest = self
                    .retry
                    .run("manifest read", |_| {
                        let store = self.manifest.clone();
                        async move {
                            tokio::task::spawn_blocking(move || store.load())
                                .await
                                .map_err(|e| {
                                    IngestError::Internal(format!("manifest read task failed: {}", e))
                                })?
                        }
                    })
                    .await?;
                match manifest.get(&key.as_key()) {
                    Some(entry) if entry.digest == *digest => {
                        GateDecision::Skip(SkipReason::ManifestEntry)
                    },
                    Some(entry) => {
                        return Err(IngestError::manifest_conflict(key.as_key(), &entry.digest, digest))
                    },
                    None => GateDecision::Open,
                }
            },
        };

        info!(
            key = %key,
            strategy = %self.strategy,
            decision = ?decision,
            "Dedup gate evaluated"
        );
        Ok(decision)
    }
}
