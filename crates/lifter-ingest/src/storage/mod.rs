//! Destination object stores
//!
//! The store is the source of truth for "already published". Writes are
//! conditional: a put never replaces an existing object, and a put that
//! loses to a concurrent writer reports [`PutOutcome::AlreadyExists`].

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

pub mod config;
mod local;
mod s3;

pub use config::{Destination, StorageConfig};
pub use local::LocalStore;
pub use s3::S3Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    /// An object was already present under the key; nothing was written
    AlreadyExists,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Upload the file at `path` under `key` unless the key is taken
    async fn put_if_absent(
        &self,
        key: &str,
        path: &Path,
        content_type: Option<&str>,
    ) -> Result<PutOutcome>;

    /// Human-readable location of `key`, for logs
    fn describe(&self, key: &str) -> String;
}

/// Open the store for `destination`
pub async fn connect(destination: &Destination, timeout: Duration) -> Result<Arc<dyn ObjectStore>> {
    match destination {
        Destination::S3(config) => Ok(Arc::new(S3Store::new(config.clone(), timeout).await?)),
        Destination::Local { root } => Ok(Arc::new(LocalStore::new(root.clone())?)),
    }
}
