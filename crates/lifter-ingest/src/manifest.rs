//! Publication manifest
//!
//! A JSON record of every artifact published to the destination, keyed by
//! artifact key. Updates follow a read/modify/commit contract: the writer
//! takes the exclusive `<manifest>.lock` file, reads the current revision,
//! and the commit is refused unless the on-disk revision is still the one
//! that was read. The document is replaced atomically via rename.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use crate::digest::ContentDigest;
use crate::error::{IngestError, Result};

/// How long to wait for a competing writer before giving up
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);

/// A lock file older than this is assumed to belong to a dead process
const LOCK_STALE_AFTER: Duration = Duration::from_secs(600);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// Incremented on every committed change
    pub revision: u64,

    #[serde(default)]
    pub entries: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub digest: ContentDigest,

    /// Where the artifact was published (`s3://…` or a local path)
    pub artifact: String,

    pub source_url: String,

    pub rows: u64,

    pub bytes: u64,

    pub published_at: DateTime<Utc>,
}

impl Manifest {
    pub fn get(&self, key: &str) -> Option<&ManifestEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Exclusive right to commit the manifest; released on drop
#[derive(Debug)]
pub struct ManifestLock {
    path: PathBuf,
}

impl ManifestLock {
    /// Create the lock file, polling until `wait` elapses if another holder
    /// has it
    pub async fn acquire(path: &Path, holder: &str, wait: Duration) -> Result<Self> {
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let note = format!("{} pid={} at={}\n", holder, std::process::id(), Utc::now());
                    file.write_all(note.as_bytes())
                        .map_err(|e| IngestError::state_check(format!("writing lock: {}", e)))?;
                    debug!(lock = %path.display(), holder, "Manifest lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                },
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(path) {
                        warn!(lock = %path.display(), "Removing stale manifest lock");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    if started.elapsed() >= wait {
                        let owner = std::fs::read_to_string(path).unwrap_or_default();
                        return Err(IngestError::state_check(format!(
                            "manifest lock {} is held by {}",
                            path.display(),
                            owner.trim()
                        )));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                },
                Err(e) => {
                    return Err(IngestError::state_check(format!(
                        "creating lock {}: {}",
                        path.display(),
                        e
                    )))
                },
            }
        }
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release manifest lock");
        }
    }
}

fn is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > LOCK_STALE_AFTER)
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
    lock_wait: Duration,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        sibling(&self.path, ".lock")
    }

    /// Current manifest; an absent file is an empty manifest at revision 0
    pub fn load(&self) -> Result<Manifest> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Manifest::default()),
            Err(e) => {
                return Err(IngestError::state_check(format!(
                    "reading manifest {}: {}",
                    self.path.display(),
                    e
                )))
            },
        };

        serde_json::from_str(&content).map_err(|e| {
            IngestError::state_check(format!("parsing manifest {}: {}", self.path.display(), e))
        })
    }

    pub async fn lock(&self, holder: &str) -> Result<ManifestLock> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| IngestError::state_check(format!("creating {}: {}", parent.display(), e)))?;
        }
        ManifestLock::acquire(&self.lock_path(), holder, self.lock_wait).await
    }

    /// Write `manifest` as revision `expected_revision + 1`. Refused when the
    /// stored revision moved since it was read.
    pub fn commit(
        &self,
        _lock: &ManifestLock,
        manifest: &mut Manifest,
        expected_revision: u64,
    ) -> Result<u64> {
        let current = self.load()?.revision;
        if current != expected_revision {
            return Err(IngestError::state_check(format!(
                "manifest revision changed from {} to {} during update",
                expected_revision, current
            )));
        }

        manifest.revision = expected_revision + 1;
        let content = serde_json::to_string_pretty(manifest)
            .map_err(|e| IngestError::state_check(format!("serializing manifest: {}", e)))?;

        let temp = sibling(&self.path, &format!(".{}.tmp", std::process::id()));
        write_synced(&temp, content.as_bytes())
            .and_then(|()| std::fs::rename(&temp, &self.path))
            .map_err(|e| {
                let _ = std::fs::remove_file(&temp);
                IngestError::state_check(format!("writing manifest {}: {}", self.path.display(), e))
            })?;

        Ok(manifest.revision)
    }

    /// Add `entry` under `key`. Recording the same digest again is a no-op;
    /// a different digest under an existing key is refused.
    pub async fn record(&self, key: &str, entry: ManifestEntry, holder: &str) -> Result<u64> {
        let lock = self.lock(holder).await?;
        let mut manifest = self.load()?;
        let expected = manifest.revision;

        if let Some(existing) = manifest.get(key) {
            if existing.digest == entry.digest {
                debug!(key, revision = expected, "Manifest already records artifact");
                return Ok(expected);
            }
            return Err(IngestError::manifest_conflict(key, &existing.digest, &entry.digest));
        }

        manifest.entries.insert(key.to_string(), entry);
        let revision = self.commit(&lock, &mut manifest, expected)?;
        info!(key, revision, "Manifest updated");
        Ok(revision)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}
