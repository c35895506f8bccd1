//! Content addressing of the downloaded archive
//!
//! The digest is the full lowercase SHA-256 of either the raw archive bytes
//! or the decompressed bytes of the selected data member. Member scope makes
//! the identity insensitive to archive timestamps and compression settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use tracing::info;
use zip::ZipArchive;

use lifter_common::checksum::{compute_reader_checksum, is_sha256_hex};

use crate::error::{IngestError, Result};
use crate::extract::Extractor;
use crate::fetch::Archive;

/// Which bytes are hashed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestScope {
    /// Raw bytes of the downloaded archive
    #[default]
    Archive,
    /// Decompressed bytes of the selected data member
    Member,
}

impl fmt::Display for DigestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestScope::Archive => f.write_str("archive"),
            DigestScope::Member => f.write_str("member"),
        }
    }
}

impl FromStr for DigestScope {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "archive" => Ok(DigestScope::Archive),
            "member" => Ok(DigestScope::Member),
            other => Err(IngestError::config(format!(
                "unknown digest scope '{}' (expected archive or member)",
                other
            ))),
        }
    }
}

/// Lowercase hex SHA-256 identifying one source payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn parse(hex: &str) -> Result<Self> {
        let normalized = hex.to_ascii_lowercase();
        if !is_sha256_hex(&normalized) {
            return Err(IngestError::config(format!("not a SHA-256 hex digest: {:?}", hex)));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.0
    }
}

pub struct ContentAddresser {
    scope: DigestScope,
    extractor: Extractor,
}

impl ContentAddresser {
    /// `extractor` decides which member is hashed under member scope
    pub fn new(scope: DigestScope, extractor: Extractor) -> Self {
        Self { scope, extractor }
    }

    pub fn scope(&self) -> DigestScope {
        self.scope
    }

    /// Digest a downloaded archive. Blocking; reads the file once.
    pub fn address(&self, archive: &Archive) -> Result<ContentDigest> {
        let digest = self.address_path(&archive.path)?;
        info!(
            digest = %digest,
            scope = %self.scope,
            archive = %archive.path.display(),
            "Archive addressed"
        );
        Ok(digest)
    }

    pub fn address_path(&self, path: &Path) -> Result<ContentDigest> {
        let file = File::open(path).map_err(|e| IngestError::staging(path, e))?;

        let hex = match self.scope {
            DigestScope::Archive => {
                let mut reader = BufReader::new(file);
                let (hex, _) = compute_reader_checksum(&mut reader)
                    .map_err(|e| IngestError::Internal(format!("hashing {}: {}", path.display(), e)))?;
                hex
            },
            DigestScope::Member => {
                let mut zip = ZipArchive::new(BufReader::new(file))
                    .map_err(|e| IngestError::invalid_archive(path, e.to_string()))?;
                let member = self.extractor.locate(&mut zip, path)?;
                let mut entry = zip
                    .by_index(member.index)
                    .map_err(|e| IngestError::invalid_archive(path, e.to_string()))?;
                let (hex, _) = compute_reader_checksum(&mut entry)
                    .map_err(|e| IngestError::invalid_archive(path, e.to_string()))?;
                hex
            },
        };

        ContentDigest::parse(&hex)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::MemberSelector;
    use lifter_common::checksum::compute_checksum;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    fn zip_with(data: &[u8], year: u16, method: CompressionMethod) -> Vec<u8> {
        let options = SimpleFileOptions::default()
            .compression_method(method)
            .last_modified_time(zip::DateTime::from_date_and_time(year, 1, 1, 0, 0, 0).unwrap());
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("data.csv", options).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn addresser(scope: DigestScope) -> ContentAddresser {
        ContentAddresser::new(scope, Extractor::new(MemberSelector::default()))
    }

    #[test]
    fn test_archive_scope_hashes_raw_bytes() {
        let temp = TempDir::new().unwrap();
        let bytes = zip_with(b"id,val\n1,10\n", 2020, CompressionMethod::Deflated);
        let path = temp.path().join("a.zip");
        std::fs::write(&path, &bytes).unwrap();

        let digest = addresser(DigestScope::Archive).address_path(&path).unwrap();
        assert_eq!(digest.as_str(), compute_checksum(&bytes));
        assert_eq!(digest.as_str().len(), 64);
    }

    #[test]
    fn test_member_scope_ignores_container_metadata() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.zip");
        let b = temp.path().join("b.zip");
        std::fs::write(&a, zip_with(b"id,val\n1,10\n", 2020, CompressionMethod::Deflated)).unwrap();
        std::fs::write(&b, zip_with(b"id,val\n1,10\n", 2024, CompressionMethod::Stored)).unwrap();

        let member = addresser(DigestScope::Member);
        assert_eq!(member.address_path(&a).unwrap(), member.address_path(&b).unwrap());
        assert_eq!(
            member.address_path(&a).unwrap().as_str(),
            compute_checksum(b"id,val\n1,10\n")
        );

        let archive = addresser(DigestScope::Archive);
        assert_ne!(archive.address_path(&a).unwrap(), archive.address_path(&b).unwrap());
    }

    #[test]
    fn test_member_scope_requires_member() {
        let temp = TempDir::new().unwrap();
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("notes.txt", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"nothing here").unwrap();
        let path = temp.path().join("a.zip");
        std::fs::write(&path, writer.finish().unwrap().into_inner()).unwrap();

        let err = addresser(DigestScope::Member).address_path(&path).unwrap_err();
        assert!(matches!(err, IngestError::MemberNotFound { .. }));
    }

    #[test]
    fn test_digest_parse_and_serde() {
        let hex = compute_checksum(b"x").to_uppercase();
        let digest = ContentDigest::parse(&hex).unwrap();
        assert_eq!(digest.as_str(), hex.to_lowercase());
        assert_eq!(digest.short().len(), 12);

        let json = serde_json::to_string(&digest).unwrap();
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);

        assert!(ContentDigest::parse("abc").is_err());
        assert!(serde_json::from_str::<ContentDigest>("\"abc\"").is_err());
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!("Member".parse::<DigestScope>().unwrap(), DigestScope::Member);
        assert_eq!(DigestScope::default(), DigestScope::Archive);
        assert!("both".parse::<DigestScope>().is_err());
    }
}
