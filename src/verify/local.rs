//! Host-local verification through the release CLI.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::exec::{CommandRunner, ExecOptions};

use super::Verification;

/// Runs `<program> adm release info --verify <location>` on this host.
#[derive(Clone)]
pub struct LocalVerifier {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Duration,
}

impl LocalVerifier {
    /// Verifier invoking `program` through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, program: &str, timeout: Duration) -> Self {
        Self {
            runner,
            program: program.to_owned(),
            timeout,
        }
    }

    /// Arguments passed to the CLI for `location`.
    pub fn verify_args(location: &str) -> Vec<String> {
        ["adm", "release", "info", "--verify", location]
            .iter()
            .map(|arg| (*arg).to_owned())
            .collect()
    }

    /// Verify the release at `location`.
    ///
    /// A non-zero exit, a timeout, or a CLI that cannot be started all fail the
    /// release with the CLI output as the message.
    pub async fn verify(&self, location: &str) -> Verification {
        let opts = ExecOptions {
            timeout: self.timeout,
            stdin: None,
        };
        let output = match self
            .runner
            .run(&self.program, &Self::verify_args(location), opts)
            .await
        {
            Ok(result) if result.success() => return Verification::Verified,
            Ok(result) => result.combined_output(),
            Err(e) => e.to_string(),
        };

        let message = format!("Unable to verify release:\n{}", output.trim());
        debug!(%location, %message, "release verification command failed");
        Verification::Failed(message)
    }
}

impl std::fmt::Debug for LocalVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalVerifier")
            .field("program", &self.program)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
