//! Data member selection and extraction
//!
//! A candidate is any non-directory entry whose base name carries the
//! configured extension (case-insensitive). Exactly one candidate must
//! remain after applying the optional explicit name; the member is staged
//! under its base name so archive paths can never escape the staging area.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::ZipArchive;

use crate::config::MemberSelector;
use crate::error::{IngestError, Result};
use crate::fetch::Archive;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Position and name of the selected member inside an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    pub index: usize,
    /// Full path inside the archive
    pub name: String,
}

impl MemberRef {
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }
}

/// The tabular file extracted into staging
#[derive(Debug, Clone)]
pub struct DataMember {
    pub path: PathBuf,
    pub member_name: String,
    pub byte_length: u64,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    selector: MemberSelector,
}

impl Extractor {
    pub fn new(selector: MemberSelector) -> Self {
        Self { selector }
    }

    pub fn selector(&self) -> &MemberSelector {
        &self.selector
    }

    /// Find the single data member in `archive`. Entries are visited in
    /// listing order and their contents are not decompressed.
    pub fn locate<R: Read + Seek>(
        &self,
        archive: &mut ZipArchive<R>,
        archive_path: &Path,
    ) -> Result<MemberRef> {
        let extension = self.selector.extension.trim_start_matches('.');
        let mut candidates = Vec::new();

        for index in 0..archive.len() {
            let entry = archive
                .by_index_raw(index)
                .map_err(|e| IngestError::invalid_archive(archive_path, e.to_string()))?;
            if entry.is_dir() {
                continue;
            }

            let name = entry.name().to_string();
            if !has_extension(base_name(&name), extension) {
                continue;
            }
            if let Some(wanted) = &self.selector.name {
                if base_name(&name) != wanted.as_str() {
                    continue;
                }
            }
            candidates.push(MemberRef { index, name });
        }

        match candidates.len() {
            0 => Err(IngestError::MemberNotFound {
                archive: archive_path.to_path_buf(),
                wanted: match &self.selector.name {
                    Some(name) => name.clone(),
                    None => format!("*.{}", extension),
                },
            }),
            1 => Ok(candidates.remove(0)),
            _ => Err(IngestError::AmbiguousMember {
                archive: archive_path.to_path_buf(),
                candidates: candidates.into_iter().map(|c| c.name).collect(),
            }),
        }
    }

    /// Extract the data member of `archive` into `staging_dir`. Blocking.
    pub fn extract(&self, archive: &Archive, staging_dir: &Path) -> Result<DataMember> {
        let file = File::open(&archive.path).map_err(|e| IngestError::staging(&archive.path, e))?;
        let mut zip = ZipArchive::new(file)
            .map_err(|e| IngestError::invalid_archive(&archive.path, e.to_string()))?;

        let member = self.locate(&mut zip, &archive.path)?;
        info!(member = %member.name, archive = %archive.path.display(), "Selected data member");

        let target = staging_dir.join(member.base_name());
        let partial = staging_dir.join(format!("{}.part", member.base_name()));

        let mut entry = zip
            .by_index(member.index)
            .map_err(|e| IngestError::invalid_archive(&archive.path, e.to_string()))?;

        let written = match copy_member(&mut entry, &partial, &archive.path) {
            Ok(written) => written,
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            },
        };

        std::fs::rename(&partial, &target).map_err(|e| IngestError::staging(&target, e))?;
        debug!(path = %target.display(), bytes = written, "Member extracted");

        Ok(DataMember {
            path: target,
            member_name: member.name,
            byte_length: written,
        })
    }
}

/// Copy a member's decompressed bytes to `dest`. Read failures (bad CRC,
/// corrupt deflate stream) belong to the archive, write failures to staging.
fn copy_member<R: Read>(entry: &mut R, dest: &Path, archive_path: &Path) -> Result<u64> {
    let file = File::create(dest).map_err(|e| IngestError::staging(dest, e))?;
    let mut writer = BufWriter::new(file);
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;

    loop {
        let n = match entry.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(IngestError::invalid_archive(archive_path, e.to_string())),
        };
        writer
            .write_all(&buffer[..n])
            .map_err(|e| IngestError::staging(dest, e))?;
        written += n as u64;
    }

    let file = writer
        .into_inner()
        .map_err(|e| IngestError::staging(dest, e.into_error()))?;
    file.sync_all().map_err(|e| IngestError::staging(dest, e))?;
    Ok(written)
}

fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn has_extension(file_name: &str, extension: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}
