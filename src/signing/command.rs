//! Signer delegating to an external signing command.
//!
//! The command receives an atomic container signature claim on stdin and must
//! write the detached signature to stdout (e.g. `gpg --batch --sign`).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::trace;

use crate::exec::{CommandRunner, ExecOptions};

use super::{SignError, Signer};

/// Claim type understood by container signature verifiers.
pub const CLAIM_TYPE: &str = "atomic container signature";

/// Signed claim binding a pull spec to a manifest digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureClaim {
    /// Fields a verifier must check.
    pub critical: CriticalClaim,
    /// Informational fields.
    pub optional: OptionalClaim,
}

/// Verifier-enforced part of a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CriticalClaim {
    /// Identity the image is published under.
    pub identity: ClaimIdentity,
    /// Image the claim is about.
    pub image: ClaimImage,
    /// Claim type, always [`CLAIM_TYPE`].
    #[serde(rename = "type")]
    pub claim_type: String,
}

/// Published identity of the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimIdentity {
    /// Pull spec the image is published at.
    #[serde(rename = "docker-reference")]
    pub docker_reference: String,
}

/// Content identity of the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimImage {
    /// Manifest digest.
    #[serde(rename = "docker-manifest-digest")]
    pub docker_manifest_digest: String,
}

/// Informational part of a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionalClaim {
    /// Tool that produced the claim.
    pub creator: String,
    /// Unix timestamp of signing.
    pub timestamp: i64,
}

impl SignatureClaim {
    /// Claim for `digest` published at `location`, timestamped now.
    pub fn new(digest: &str, location: &str) -> Self {
        Self {
            critical: CriticalClaim {
                identity: ClaimIdentity {
                    docker_reference: strip_digest(location).to_owned(),
                },
                image: ClaimImage {
                    docker_manifest_digest: digest.to_owned(),
                },
                claim_type: CLAIM_TYPE.to_owned(),
            },
            optional: OptionalClaim {
                creator: concat!("release-auditor ", env!("CARGO_PKG_VERSION")).to_owned(),
                timestamp: Utc::now().timestamp(),
            },
        }
    }
}

/// `repo@sha256:...` identifies as `repo`.
fn strip_digest(location: &str) -> &str {
    location
        .split_once('@')
        .map_or(location, |(repository, _)| repository)
}

/// Signs claims by piping them through a configured command.
#[derive(Clone)]
pub struct CommandSigner {
    runner: Arc<dyn CommandRunner>,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSigner {
    /// Signer running `program args...`.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        program: &str,
        args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            program: program.to_owned(),
            args,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Signer for CommandSigner {
    async fn sign(&self, digest: &str, location: &str) -> Result<Vec<u8>, SignError> {
        let claim = serde_json::to_vec(&SignatureClaim::new(digest, location))?;
        let opts = ExecOptions {
            timeout: self.timeout,
            stdin: Some(claim),
        };
        let result = self.runner.run(&self.program, &self.args, opts).await?;
        if !result.success() {
            return Err(SignError::Rejected {
                exit_code: result.exit_code,
                output: String::from_utf8_lossy(&result.stderr).trim().to_owned(),
            });
        }
        if result.stdout.is_empty() {
            return Err(SignError::Empty);
        }
        trace!(%digest, signature = %hex::encode(&result.stdout), "signed");
        Ok(result.stdout)
    }
}

impl std::fmt::Debug for CommandSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSigner")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
