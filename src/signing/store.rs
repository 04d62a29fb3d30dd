//! Filesystem signature store.
//!
//! Layout follows the container signature lookaside convention:
//! `<root>/<algorithm>=<hex>/signature-1`.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{SignatureStore, StoreError};

/// File name of the first signature for a digest.
const SIGNATURE_FILE: &str = "signature-1";

/// Stores signatures under a root directory.
#[derive(Debug, Clone)]
pub struct FsSignatureStore {
    root: PathBuf,
}

impl FsSignatureStore {
    /// Store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the signature file for `digest`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidDigest`] unless `digest` is `<algorithm>:<hex>`.
    pub fn signature_path(&self, digest: &str) -> Result<PathBuf, StoreError> {
        let invalid = || StoreError::InvalidDigest(digest.to_owned());
        let (algorithm, hex) = digest.split_once(':').ok_or_else(invalid)?;
        let well_formed = !algorithm.is_empty()
            && !hex.is_empty()
            && algorithm.chars().all(|c| c.is_ascii_alphanumeric())
            && hex.chars().all(|c| c.is_ascii_hexdigit());
        if !well_formed {
            return Err(invalid());
        }
        Ok(self
            .root
            .join(format!("{algorithm}={hex}"))
            .join(SIGNATURE_FILE))
    }
}

#[async_trait::async_trait]
impl SignatureStore for FsSignatureStore {
    async fn put_signature(&self, digest: &str, signature: &[u8]) -> Result<(), StoreError> {
        let path = self.signature_path(digest)?;
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::InvalidDigest(digest.to_owned()))?;
        tokio::fs::create_dir_all(dir).await?;

        let staging = dir.join(format!(".{SIGNATURE_FILE}.tmp"));
        tokio::fs::write(&staging, signature).await?;
        tokio::fs::rename(&staging, &path).await?;
        debug!(%digest, path = %path.display(), "stored signature");
        Ok(())
    }

    async fn has_signature(&self, digest: &str) -> bool {
        match self.signature_path(digest) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}
