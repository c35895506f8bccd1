//! Destination key naming
//!
//! Every published artifact lives at `<namespace>/<prefix>-<digest>.<ext>`.
//! The key is a pure function of the digest, so checking for the key is
//! checking whether this payload was already published.

use serde::Serialize;
use std::fmt;

use crate::digest::ContentDigest;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct ArtifactKey {
    namespace: String,
    basename: String,
}

impl ArtifactKey {
    pub fn new(namespace: &str, prefix: &str, digest: &ContentDigest, extension: &str) -> Self {
        Self {
            namespace: namespace.trim_matches('/').to_string(),
            basename: format!(
                "{}-{}.{}",
                prefix,
                digest.as_str(),
                extension.trim_start_matches('.')
            ),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Full object key, `/`-separated
    pub fn as_key(&self) -> String {
        format!("{}/{}", self.namespace, self.basename)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.basename)
    }
}

impl From<ArtifactKey> for String {
    fn from(key: ArtifactKey) -> Self {
        key.as_key()
    }
}
