//! Release signing and signature persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

pub mod command;
pub mod store;

pub use command::CommandSigner;
pub use store::FsSignatureStore;

/// Errors produced while signing.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    /// The signing claim could not be built.
    #[error("failed to build signing claim: {0}")]
    Claim(#[from] serde_json::Error),
    /// The signing command could not be run.
    #[error("signing command failed to run: {0}")]
    Exec(#[from] crate::exec::ExecError),
    /// The signing command exited unsuccessfully.
    #[error("signing command exited with {exit_code:?}: {output}")]
    Rejected {
        /// Exit code, if the command exited.
        exit_code: Option<i32>,
        /// Combined command output.
        output: String,
    },
    /// The signing command produced no signature.
    #[error("signing command produced an empty signature")]
    Empty,
}

/// Errors produced by signature stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The digest cannot be mapped to a storage location.
    #[error("invalid digest {0:?}")]
    InvalidDigest(String),
    /// Storage IO failed.
    #[error("signature store io failed: {0}")]
    Io(#[from] std::io::Error),
    /// Store is unusable.
    #[error("signature store unavailable: {0}")]
    Unavailable(String),
}

/// Produces a detached signature for a release artifact.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign the artifact with `digest` published at `location`.
    async fn sign(&self, digest: &str, location: &str) -> Result<Vec<u8>, SignError>;
}

/// Persists signatures keyed by digest.
#[async_trait]
pub trait SignatureStore: Send + Sync {
    /// Store `signature` for `digest`.
    async fn put_signature(&self, digest: &str, signature: &[u8]) -> Result<(), StoreError>;

    /// Whether a signature for `digest` is already stored.
    async fn has_signature(&self, digest: &str) -> bool;
}

/// Signature store held in memory.
#[derive(Debug, Default)]
pub struct InMemorySignatureStore {
    signatures: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemorySignatureStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored signature for `digest`.
    pub fn signature(&self, digest: &str) -> Option<Vec<u8>> {
        self.signatures
            .lock()
            .ok()
            .and_then(|map| map.get(digest).cloned())
    }
}

#[async_trait]
impl SignatureStore for InMemorySignatureStore {
    async fn put_signature(&self, digest: &str, signature: &[u8]) -> Result<(), StoreError> {
        let mut map = self
            .signatures
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("store lock poisoned: {e}")))?;
        map.insert(digest.to_owned(), signature.to_vec());
        Ok(())
    }

    async fn has_signature(&self, digest: &str) -> bool {
        self.signatures
            .lock()
            .map(|map| map.contains_key(digest))
            .unwrap_or(false)
    }
}
