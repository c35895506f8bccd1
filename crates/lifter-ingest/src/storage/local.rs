//! Filesystem-backed store
//!
//! Objects are staged next to their final path and hard-linked into place.
//! Linking fails if the target exists, which gives the same
//! create-only-if-absent guarantee as a conditional S3 put.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ObjectStore, PutOutcome};
use crate::error::{IngestError, Result};

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| IngestError::staging(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an object key onto a path below the root
    pub fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !plain {
            return Err(IngestError::config(format!("invalid object key {:?}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| IngestError::state_check(format!("checking {}: {}", path.display(), e)))
    }

    async fn put_if_absent(
        &self,
        key: &str,
        path: &Path,
        _content_type: Option<&str>,
    ) -> Result<PutOutcome> {
        let dest = self.resolve(key)?;
        let parent = dest
            .parent()
            .ok_or_else(|| IngestError::config(format!("invalid object key {:?}", key)))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| IngestError::publish(key, format!("creating {}: {}", parent.display(), e)))?;

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

        let outcome = self.link_into_place(key, path, &temp, &dest).await;
        let _ = tokio::fs::remove_file(&temp).await;

        match &outcome {
            Ok(PutOutcome::Created) => info!(dest = %dest.display(), "Object created"),
            Ok(PutOutcome::AlreadyExists) => debug!(dest = %dest.display(), "Object already exists"),
            Err(_) => {},
        }
        outcome
    }

    fn describe(&self, key: &str) -> String {
        self.root.join(key).display().to_string()
    }
}

impl LocalStore {
    async fn link_into_place(
        &self,
        key: &str,
        source: &Path,
        temp: &Path,
        dest: &Path,
    ) -> Result<PutOutcome> {
        tokio::fs::copy(source, temp)
            .await
            .map_err(|e| IngestError::publish(key, format!("copying {}: {}", source.display(), e)))?;

        let file = tokio::fs::File::open(temp)
            .await
            .map_err(|e| IngestError::publish(key, e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| IngestError::publish(key, e.to_string()))?;

        match tokio::fs::hard_link(temp, dest).await {
            Ok(()) => Ok(PutOutcome::Created),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(PutOutcome::AlreadyExists),
            Err(e) => Err(IngestError::publish(key, format!("linking {}: {}", dest.display(), e))),
        }
    }
}
