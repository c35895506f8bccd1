//! Streaming SHA-256 checksums
//!
//! Inputs are hashed through a fixed-size buffer so arbitrarily large files
//! never need to fit in memory. Digests are rendered as 64 lowercase hex
//! characters.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Length of a rendered SHA-256 digest
pub const SHA256_HEX_LEN: usize = 64;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the SHA-256 checksum of bytes already in memory
pub fn compute_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the SHA-256 checksum of any readable source, returning the hex
/// digest and the number of bytes consumed
pub fn compute_reader_checksum<R: Read>(reader: &mut R) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

/// Compute the SHA-256 checksum of a file
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path.as_ref())?;
    let (digest, _) = compute_reader_checksum(&mut file)?;
    Ok(digest)
}

/// Whether `value` looks like a rendered SHA-256 digest
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == SHA256_HEX_LEN && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
