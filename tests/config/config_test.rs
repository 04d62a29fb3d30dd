//! Coverage for config parsing, overrides and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use release_auditor::config::{config_dir, load_config, AuditorConfig};

#[test]
fn config_dir_resolves() {
    let dir = match config_dir() {
        Ok(dir) => dir,
        Err(err) => panic!("config dir should resolve: {err}"),
    };
    assert!(dir.ends_with(".release-auditor"));
}

#[test]
fn parse_full_config() {
    let toml_str = r#"
[audit]
cli_image = "quay.io/example/cli:4.1"
job_namespace = "audit-jobs"
max_unfinished_jobs = 4
requeue_delay_secs = 15
failure_cooldown_hours = 6
store_timeout_secs = 45
local_tool = "/usr/local/bin/oc"
local_timeout_secs = 120

[signer]
command = "gpg"
args = ["--batch", "--sign"]

[store]
signatures_dir = "/var/lib/auditor/signatures"

[releases]
dir = "/etc/auditor/releases"
poll_interval_secs = 30

[workers]
count = 8

[docker]
log_tail_lines = 20

[logging]
logs_dir = "/var/log/auditor"
"#;
    let config = AuditorConfig::from_toml(toml_str).expect("config should parse");
    config.validate().expect("config should be valid");

    assert_eq!(config.audit.cli_image.as_deref(), Some("quay.io/example/cli:4.1"));
    assert_eq!(config.audit.job_namespace, "audit-jobs");
    assert_eq!(config.audit.max_unfinished_jobs, 4);
    assert_eq!(config.audit.requeue_delay(), Duration::from_secs(15));
    assert_eq!(config.audit.failure_cooldown(), Duration::from_secs(6 * 3600));
    assert_eq!(config.audit.store_timeout(), Duration::from_secs(45));
    assert_eq!(config.audit.local_tool, "/usr/local/bin/oc");
    assert_eq!(config.audit.local_timeout(), Duration::from_secs(120));

    let signer = config.signer.as_ref().expect("signer configured");
    assert_eq!(signer.command, "gpg");
    assert_eq!(signer.args, vec!["--batch", "--sign"]);
    assert_eq!(signer.timeout_secs, 60);

    assert_eq!(config.workers.count, 8);
    assert_eq!(config.docker.log_tail_lines, 20);
    assert_eq!(config.releases.poll_interval_secs, 30);
    assert_eq!(config.logging.logs_dir, Some(PathBuf::from("/var/log/auditor")));

    let paths = config.runtime_paths().expect("paths should resolve");
    assert_eq!(paths.signatures_dir, Path::new("/var/lib/auditor/signatures"));
    assert_eq!(paths.releases_dir, Path::new("/etc/auditor/releases"));
}

#[test]
fn default_paths_live_under_config_dir() {
    let config = AuditorConfig::default();
    let root = config_dir().expect("config dir");
    let paths = config.runtime_paths().expect("paths should resolve");
    assert_eq!(paths.signatures_dir, root.join("signatures"));
    assert_eq!(paths.releases_dir, root.join("releases"));
}

#[test]
fn unknown_section_values_must_type_check() {
    let result = AuditorConfig::from_toml("[workers]\ncount = \"many\"\n");
    assert!(result.is_err());
}

#[test]
fn env_overrides_take_precedence() {
    let mut config =
        AuditorConfig::from_toml("[audit]\ncli_image = \"file-image\"\n").expect("parse");
    config.apply_overrides(|key| match key {
        "RELEASE_AUDITOR_CLI_IMAGE" => Some("local".to_owned()),
        "RELEASE_AUDITOR_WORKERS" => Some("3".to_owned()),
        _ => None,
    });
    assert_eq!(config.audit.cli_image.as_deref(), Some("local"));
    assert_eq!(config.workers.count, 3);
}

#[test]
fn empty_cli_image_override_clears_pin() {
    let mut config =
        AuditorConfig::from_toml("[audit]\ncli_image = \"file-image\"\n").expect("parse");
    config.apply_overrides(|key| (key == "RELEASE_AUDITOR_CLI_IMAGE").then(String::new));
    assert!(config.audit.cli_image.is_none());
}

#[test]
fn invalid_worker_override_is_ignored() {
    let mut config = AuditorConfig::default();
    config.apply_overrides(|key| (key == "RELEASE_AUDITOR_WORKERS").then(|| "lots".to_owned()));
    assert_eq!(config.workers.count, 4);
}

#[test]
fn validation_rejects_unusable_values() {
    let cases = [
        ("[workers]\ncount = 0\n", "workers.count"),
        ("[audit]\nmax_unfinished_jobs = 0\n", "audit.max_unfinished_jobs"),
        ("[audit]\nrequeue_delay_secs = 0\n", "audit.requeue_delay_secs"),
        ("[audit]\nstore_timeout_secs = 0\n", "audit.store_timeout_secs"),
        ("[audit]\nlocal_tool = \" \"\n", "audit.local_tool"),
        ("[releases]\npoll_interval_secs = 0\n", "releases.poll_interval_secs"),
        ("[signer]\ncommand = \"\"\n", "signer.command"),
    ];
    for (toml_str, field) in cases {
        let config = AuditorConfig::from_toml(toml_str).expect("parse");
        let err = config.validate().expect_err("should be invalid");
        assert!(err.to_string().contains(field), "{field}: {err}");
    }
}

#[test]
fn load_config_reports_missing_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let err = load_config(&tmp.path().join("absent.toml")).expect_err("should fail");
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn load_reads_explicit_path() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("auditor.toml");
    std::fs::write(&path, "[audit]\nmax_unfinished_jobs = 5\n").expect("write");

    let config = AuditorConfig::load(Some(&path)).expect("config should load");
    assert_eq!(config.audit.max_unfinished_jobs, 5);
}
