//! Configuration loading and validation.
//!
//! Loads `config.toml` from `--config`, `$RELEASE_AUDITOR_CONFIG`, or the
//! working directory. Every section uses `#[serde(default)]` so a missing or
//! empty file is valid. Environment variables override file values.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::throttle::DEFAULT_MAX_UNFINISHED_JOBS;

/// Env var naming the config file.
pub const CONFIG_PATH_ENV: &str = "RELEASE_AUDITOR_CONFIG";

/// Top-level auditor configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuditorConfig {
    /// Verification and throttling settings.
    pub audit: AuditConfig,
    /// Signing command; absent runs in audit-only mode.
    pub signer: Option<SignerConfig>,
    /// Signature store settings.
    pub store: StoreConfig,
    /// Where release descriptions are read from.
    pub releases: ReleasesConfig,
    /// Worker pool settings.
    pub workers: WorkersConfig,
    /// Docker job backend settings.
    pub docker: DockerConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Verification and throttling settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Pinned CLI image; `"local"` verifies on this host.
    pub cli_image: Option<String>,
    /// Namespace verification jobs are scoped to.
    pub job_namespace: String,
    /// Maximum concurrently unfinished verification jobs.
    pub max_unfinished_jobs: usize,
    /// Delay before polling a throttled or running verification again.
    pub requeue_delay_secs: u64,
    /// Hours after which a failed tag is retried.
    pub failure_cooldown_hours: u64,
    /// Deadline for persisting a signature.
    pub store_timeout_secs: u64,
    /// CLI used for local verification.
    pub local_tool: String,
    /// Timeout for one local verification.
    pub local_timeout_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            cli_image: None,
            job_namespace: "ci-release".to_owned(),
            max_unfinished_jobs: DEFAULT_MAX_UNFINISHED_JOBS,
            requeue_delay_secs: 10,
            failure_cooldown_hours: 12,
            store_timeout_secs: 30,
            local_tool: "oc".to_owned(),
            local_timeout_secs: 600,
        }
    }
}

impl AuditConfig {
    /// Requeue delay as a [`Duration`].
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_delay_secs)
    }

    /// Failure cooldown as a [`Duration`].
    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_hours.saturating_mul(3600))
    }

    /// Store deadline as a [`Duration`].
    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    /// Local verification timeout as a [`Duration`].
    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }
}

/// External signing command.
#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    /// Program to run.
    pub command: String,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Timeout for one signing call.
    #[serde(default = "default_signer_timeout_secs")]
    pub timeout_secs: u64,
}

/// Signature store settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Signature directory; defaults to `~/.release-auditor/signatures`.
    pub signatures_dir: Option<PathBuf>,
}

/// Release description source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReleasesConfig {
    /// Directory holding `*.json` release descriptions.
    pub dir: Option<PathBuf>,
    /// Seconds between directory scans.
    pub poll_interval_secs: u64,
}

impl Default for ReleasesConfig {
    fn default() -> Self {
        Self {
            dir: None,
            poll_interval_secs: 60,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Number of concurrent tag workers.
    pub count: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { count: 4 }
    }
}

/// Docker job backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Log lines kept as the diagnostic of a failed job.
    pub log_tail_lines: usize,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self { log_tail_lines: 50 }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rotated JSON logs; console only when unset.
    pub logs_dir: Option<PathBuf>,
}

/// Resolved filesystem paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Directory signatures are written to.
    pub signatures_dir: PathBuf,
    /// Directory release descriptions are read from.
    pub releases_dir: PathBuf,
}

impl AuditorConfig {
    /// Load configuration from `path` (or the default location) and apply env overrides.
    ///
    /// A missing file at the default location yields defaults; a missing file
    /// given explicitly is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => load_config(path)?,
            None => {
                let path = Self::config_path_with(|key| std::env::var(key).ok());
                match std::fs::read_to_string(&path) {
                    Ok(contents) => {
                        tracing::info!(path = %path.display(), "loading config from file");
                        Self::from_toml(&contents)
                            .with_context(|| format!("failed to parse config at {}", path.display()))?
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tracing::info!("no config file found, using defaults");
                        Self::default()
                    }
                    Err(e) => {
                        return Err(anyhow::anyhow!(
                            "failed to read config at {}: {e}",
                            path.display()
                        ))
                    }
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("RELEASE_AUDITOR_CLI_IMAGE") {
            self.audit.cli_image = Some(v).filter(|image| !image.is_empty());
        }
        if let Some(v) = env("RELEASE_AUDITOR_WORKERS") {
            match v.parse() {
                Ok(n) => self.workers.count = n,
                Err(_) => tracing::warn!(
                    var = "RELEASE_AUDITOR_WORKERS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Reject values the auditor cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers.count == 0 {
            anyhow::bail!("workers.count must be at least 1");
        }
        if self.audit.max_unfinished_jobs == 0 {
            anyhow::bail!("audit.max_unfinished_jobs must be at least 1");
        }
        if self.audit.requeue_delay_secs == 0 {
            anyhow::bail!("audit.requeue_delay_secs must be at least 1");
        }
        if self.audit.store_timeout_secs == 0 {
            anyhow::bail!("audit.store_timeout_secs must be at least 1");
        }
        if self.releases.poll_interval_secs == 0 {
            anyhow::bail!("releases.poll_interval_secs must be at least 1");
        }
        if self.audit.local_tool.trim().is_empty() {
            anyhow::bail!("audit.local_tool must not be empty");
        }
        if let Some(signer) = &self.signer {
            if signer.command.trim().is_empty() {
                anyhow::bail!("signer.command must not be empty");
            }
        }
        Ok(())
    }

    /// Resolve signature and release directories, defaulting under [`config_dir`].
    ///
    /// # Errors
    ///
    /// Returns an error if a default is needed and the home directory is unknown.
    pub fn runtime_paths(&self) -> anyhow::Result<RuntimePaths> {
        let signatures_dir = match &self.store.signatures_dir {
            Some(dir) => dir.clone(),
            None => config_dir()?.join("signatures"),
        };
        let releases_dir = match &self.releases.dir {
            Some(dir) => dir.clone(),
            None => config_dir()?.join("releases"),
        };
        Ok(RuntimePaths {
            signatures_dir,
            releases_dir,
        })
    }
}

/// Load config from a TOML file without env overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<AuditorConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    AuditorConfig::from_toml(&contents)
        .with_context(|| format!("failed to parse config at {}", path.display()))
}

/// Resolve the default state directory (`~/.release-auditor/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".release-auditor"))
}

fn default_signer_timeout_secs() -> u64 {
    60
}
