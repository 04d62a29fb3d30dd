//! Tests for `ReleaseDirectory` and `InMemoryReleases`.

use release_auditor::release::{
    read_release_file, InMemoryReleases, PublishMode, Release, ReleaseDirectory, ReleaseError,
    ReleaseSource,
};

fn release_json(config_name: &str, source_name: &str) -> String {
    format!(
        r#"{{
  "source": {{"namespace": "ocp", "name": "{source_name}", "resourceVersion": "7"}},
  "target": {{
    "namespace": "ocp",
    "name": "release",
    "publicDockerImageRepository": "quay.io/example/release",
    "tags": [
      {{"name": "4.1.0", "annotations": {{
        "release.openshift.io/source": "ocp/{source_name}",
        "release.openshift.io/phase": "Accepted"
      }}}}
    ],
    "statusTags": [
      {{"tag": "4.1.0", "items": [{{"image": "sha256:aa", "dockerImageReference": "internal@sha256:aa"}}]}}
    ]
  }},
  "config": {{"name": "{config_name}", "as": "Stable"}}
}}"#
    )
}

#[tokio::test]
async fn load_all_reads_sorted_json_and_skips_bad_files() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    std::fs::write(tmp.path().join("b.json"), release_json("b", "src-b")).expect("write");
    std::fs::write(tmp.path().join("a.json"), release_json("a", "src-a")).expect("write");
    std::fs::write(tmp.path().join("broken.json"), "{not json").expect("write");
    std::fs::write(tmp.path().join("notes.txt"), "ignored").expect("write");

    let releases = ReleaseDirectory::new(tmp.path())
        .load_all()
        .await
        .expect("directory should load");

    let names: Vec<&str> = releases.iter().map(|r| r.config.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);

    let a = &releases[0];
    assert_eq!(a.config.as_mode, PublishMode::Stable);
    assert_eq!(a.source.resource_version, "7");
    assert_eq!(a.target.image_id_for_tag("4.1.0"), "sha256:aa");
    assert_eq!(
        a.target.public_pull_spec("4.1.0"),
        "quay.io/example/release@sha256:aa"
    );
    assert!(a.target.tags[0].has_source());
}

#[tokio::test]
async fn missing_directory_is_an_error() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let err = ReleaseDirectory::new(tmp.path().join("absent"))
        .load_all()
        .await
        .expect_err("missing dir should fail");
    assert!(matches!(err, ReleaseError::Read { .. }));
}

#[tokio::test]
async fn directory_source_finds_release_by_stream() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    std::fs::write(tmp.path().join("a.json"), release_json("a", "src-a")).expect("write");

    let dir = ReleaseDirectory::new(tmp.path());
    let found = dir.load_release("ocp", "src-a").await.expect("lookup");
    assert_eq!(found.map(|r| r.config.name), Some("a".to_owned()));
    assert!(dir.load_release("ocp", "other").await.expect("lookup").is_none());
}

#[tokio::test]
async fn parse_errors_name_the_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("broken.json");
    std::fs::write(&path, "42").expect("write");

    let err = read_release_file(&path).await.expect_err("should fail");
    assert!(matches!(err, ReleaseError::Parse { .. }));
    assert!(err.to_string().contains("broken.json"));
}

#[tokio::test]
async fn in_memory_releases_upsert_and_remove() {
    let releases = InMemoryReleases::new();
    let mut release: Release =
        serde_json::from_str(&release_json("a", "src-a")).expect("fixture parses");
    assert!(releases.upsert(release.clone()));

    release.config.name = "renamed".to_owned();
    assert!(releases.upsert(release));
    let loaded = releases
        .load_release("ocp", "src-a")
        .await
        .expect("lookup")
        .expect("release present");
    assert_eq!(loaded.config.name, "renamed");
    assert_eq!(releases.sources(), vec![("ocp".to_owned(), "src-a".to_owned())]);

    assert!(releases.remove("ocp", "src-a").is_some());
    assert!(releases
        .load_release("ocp", "src-a")
        .await
        .expect("lookup")
        .is_none());
}
