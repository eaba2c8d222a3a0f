//! Deployment descriptor signatures.
//!
//! A descriptor is trusted when its ed25519 signature over
//! `sha256(descriptor)` verifies against any hex encoded public key (`*.pub`)
//! in the trusted key directories. Keys fetched from the exchange are staged
//! into the user key directory with [`StagedKeys`] for one verification and
//! removed when the guard drops, on success and failure alike.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("signature is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid key length: expected {expected}, found {found}")]
    InvalidLength { expected: usize, found: usize },

    #[error("no trusted public keys found")]
    NoTrustedKeys,

    #[error("deployment signature does not verify against any trusted key")]
    Mismatch,
}

const KEY_SUFFIX: &str = ".pub";

fn io_err(path: &Path, source: std::io::Error) -> SignatureError {
    SignatureError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn parse_key(content: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = hex::decode(content.trim())?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| SignatureError::InvalidLength {
        expected: 32,
        found: bytes.len(),
    })?;
    VerifyingKey::from_bytes(&arr).map_err(|_| SignatureError::Mismatch)
}

/// Every readable `*.pub` key in `dirs`. Missing directories are skipped,
/// malformed keys are logged and skipped.
pub fn load_trusted_keys(dirs: &[PathBuf]) -> Result<Vec<VerifyingKey>, SignatureError> {
    let mut keys = Vec::new();
    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(io_err(dir, e)),
        };
        for entry in entries {
            let path = entry.map_err(|e| io_err(dir, e))?.path();
            if !path.to_string_lossy().ends_with(KEY_SUFFIX) {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            match parse_key(&content) {
                Ok(k) => keys.push(k),
                Err(e) => warn!("skipping key {}: {}", path.display(), e),
            }
        }
    }
    Ok(keys)
}

/// Verify `signature_hex` over `sha256(deployment)`.
pub fn verify_deployment(deployment: &str, signature_hex: &str, dirs: &[PathBuf]) -> Result<(), SignatureError> {
    let sig_bytes = hex::decode(signature_hex.trim())?;
    let sig_arr: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| SignatureError::InvalidLength {
        expected: 64,
        found: sig_bytes.len(),
    })?;
    let sig = Signature::from_bytes(&sig_arr);

    let keys = load_trusted_keys(dirs)?;
    if keys.is_empty() {
        return Err(SignatureError::NoTrustedKeys);
    }

    let digest = Sha256::digest(deployment.as_bytes());
    if keys.iter().any(|k| k.verify(digest.as_slice(), &sig).is_ok()) {
        debug!("deployment signature verified against {} candidate keys", keys.len());
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Keys written to disk for one verification. Removed on drop.
#[derive(Debug)]
pub struct StagedKeys {
    files: Vec<PathBuf>,
}

impl StagedKeys {
    /// Write each `(name, content)` into `dir` as `<prefix>-<name>.pub`.
    pub fn stage(dir: &Path, prefix: &str, keys: &BTreeMap<String, String>) -> Result<Self, SignatureError> {
        let mut staged = StagedKeys { files: Vec::new() };
        if keys.is_empty() {
            return Ok(staged);
        }
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let safe_prefix: String = prefix
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        for (name, content) in keys {
            let stem = name.trim_end_matches(KEY_SUFFIX);
            let path = dir.join(format!("{}-{}{}", safe_prefix, stem, KEY_SUFFIX));
            // pushed before the write so a partial file is still removed
            staged.files.push(path.clone());
            std::fs::write(&path, content).map_err(|e| io_err(&path, e))?;
        }
        Ok(staged)
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl Drop for StagedKeys {
    fn drop(&mut self) {
        for f in &self.files {
            if let Err(e) = std::fs::remove_file(f) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("unable to remove staged key {}: {}", f.display(), e);
                }
            }
        }
    }
}
