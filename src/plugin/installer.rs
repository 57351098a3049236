use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::plugin::manifest::Source;

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("sha256 mismatch: expected {expected}, found {actual}")]
    DigestMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedDownload {
    pub sha256: String,
    pub size: u64,
}

/// Checks downloaded portable binaries against their manifest source block.
#[derive(Debug, Clone, Copy)]
pub struct PluginInstaller {
    verify_checksums: bool,
}

impl PluginInstaller {
    pub fn new(verify_checksums: bool) -> Self {
        Self { verify_checksums }
    }

    /// Size is always checked when the manifest declares one; the digest only
    /// when checksum verification is on and a checksum is declared.
    pub fn verify(&self, path: &Path, source: &Source) -> Result<VerifiedDownload, ChecksumError> {
        let io_err = |err| ChecksumError::Io {
            path: path.to_path_buf(),
            source: err,
        };

        let size = path.metadata().map_err(io_err)?.len();
        if let Some(expected) = source.file_size.filter(|expected| *expected != size) {
            return Err(ChecksumError::SizeMismatch {
                expected,
                actual: size,
            });
        }

        let sha256 = sha256_file(path)?;
        if let Some(expected) = source
            .checksum_sha256
            .as_deref()
            .filter(|_| self.verify_checksums)
        {
            if !expected.eq_ignore_ascii_case(&sha256) {
                return Err(ChecksumError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: sha256,
                });
            }
        }

        tracing::debug!("verified {} ({size} bytes)", path.display());
        Ok(VerifiedDownload { sha256, size })
    }
}

pub fn sha256_file(path: &Path) -> Result<String, ChecksumError> {
    let io_err = |err| ChecksumError::Io {
        path: path.to_path_buf(),
        source: err,
    };

    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(io_err)?;
    Ok(format!("{:x}", hasher.finalize()))
}
