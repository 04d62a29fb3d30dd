//! Host process runner built on `tokio::process`.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{CommandRunner, ExecError, ExecOptions, ExecResult};

/// Runs programs directly on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        opts: ExecOptions,
    ) -> Result<ExecResult, ExecError> {
        let start = Instant::now();
        let stdin = if opts.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.to_owned(),
                source,
            })?;

        if let (Some(input), Some(mut pipe)) = (opts.stdin, child.stdin.take()) {
            // Fed from its own task while stdout and stderr are drained.
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    debug!(error = %e, "child closed stdin early");
                }
            });
        }

        match tokio::time::timeout(opts.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(ExecResult {
                    exit_code: output.status.code(),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    timed_out: false,
                    duration: start.elapsed(),
                })
            }
            Err(_) => {
                debug!(program, timeout_secs = opts.timeout.as_secs(), "command timed out");
                Ok(ExecResult {
                    exit_code: None,
                    stdout: Vec::new(),
                    stderr: format!("command timed out after {}s", opts.timeout.as_secs())
                        .into_bytes(),
                    timed_out: true,
                    duration: start.elapsed(),
                })
            }
        }
    }
}
