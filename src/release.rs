//! Release descriptions produced upstream and the source they are loaded from.
//!
//! A [`Release`] pairs the image stream that release tags are published into
//! (`target`) with the stream it was assembled from (`source`) and the
//! per-release configuration. The auditor never decides what a valid release
//! is; it only reads the tag annotations written by the release pipeline.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Annotation marking a tag as produced by the release pipeline.
pub const ANNOTATION_SOURCE: &str = "release.openshift.io/source";
/// Annotation carrying the lifecycle phase of a release tag.
pub const ANNOTATION_PHASE: &str = "release.openshift.io/phase";
/// Annotation recording the target image stream of a job.
pub const ANNOTATION_TARGET: &str = "release.openshift.io/target";
/// Annotation recording the release tag a job was created for.
pub const ANNOTATION_RELEASE_TAG: &str = "release.openshift.io/releaseTag";
/// Label and annotation recording why a job exists.
pub const ANNOTATION_JOB_PURPOSE: &str = "release.openshift.io/purpose";

/// How a release publishes its tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PublishMode {
    /// Regular rolling release stream.
    #[default]
    Default,
    /// Integration stream, never audited.
    Integration,
    /// Stable channel; the only mode whose tags are audited and signed.
    Stable,
}

/// Lifecycle phase written on a release tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagPhase {
    /// Release payload is still being assembled.
    Pending,
    /// Payload exists and is ready for testing.
    Ready,
    /// Payload passed its acceptance gates.
    Accepted,
    /// Payload failed its acceptance gates.
    Rejected,
    /// Payload could not be created.
    Failed,
}

impl TagPhase {
    /// Parse the phase annotation value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(Self::Pending),
            "Ready" => Some(Self::Ready),
            "Accepted" => Some(Self::Accepted),
            "Rejected" => Some(Self::Rejected),
            "Failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether a tag in this phase has a payload worth auditing.
    pub fn is_auditable(self) -> bool {
        matches!(self, Self::Accepted | Self::Ready | Self::Rejected)
    }
}

/// Namespaced reference to an image stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageStreamRef {
    /// Namespace holding the stream.
    pub namespace: String,
    /// Stream name.
    pub name: String,
    /// Last observed resource version.
    pub resource_version: String,
}

/// Per-release configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleaseConfig {
    /// Release name, the owner key for tracked tags.
    pub name: String,
    /// Publication mode.
    #[serde(rename = "as")]
    pub as_mode: PublishMode,
    /// CLI image to verify with when the controller has none pinned.
    #[serde(rename = "overrideCLIImage")]
    pub override_cli_image: Option<String>,
    /// Pull secret handed to verification jobs.
    pub pull_secret_name: Option<String>,
}

/// A tag entry in the image stream spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagReference {
    /// Tag name.
    pub name: String,
    /// Annotations written by the release pipeline.
    pub annotations: BTreeMap<String, String>,
}

impl TagReference {
    /// Whether the release pipeline produced this tag.
    pub fn has_source(&self) -> bool {
        self.annotations.contains_key(ANNOTATION_SOURCE)
    }

    /// Lifecycle phase from the phase annotation, if recognised.
    pub fn phase(&self) -> Option<TagPhase> {
        self.annotations
            .get(ANNOTATION_PHASE)
            .and_then(|value| TagPhase::parse(value))
    }
}

/// One image a status tag has pointed at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagEvent {
    /// Content digest, e.g. `sha256:...`.
    pub image: String,
    /// Internal pull spec of the image.
    pub docker_image_reference: String,
}

/// Status history of a single tag, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamedTagEventList {
    /// Tag name.
    pub tag: String,
    /// Observed images, newest first.
    pub items: Vec<TagEvent>,
}

/// The image stream release tags are published into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageStream {
    /// Namespace holding the stream.
    pub namespace: String,
    /// Stream name.
    pub name: String,
    /// Externally reachable repository, if published.
    pub public_docker_image_repository: String,
    /// Spec tags.
    pub tags: Vec<TagReference>,
    /// Status tags.
    pub status_tags: Vec<NamedTagEventList>,
}

impl ImageStream {
    fn latest_event(&self, tag: &str) -> Option<&TagEvent> {
        self.status_tags
            .iter()
            .find(|list| list.tag == tag)
            .and_then(|list| list.items.first())
    }

    /// Digest the tag currently points at, empty when unknown.
    pub fn image_id_for_tag(&self, tag: &str) -> String {
        self.latest_event(tag)
            .map(|event| event.image.clone())
            .unwrap_or_default()
    }

    /// Public pull spec for the tag, empty when unknown.
    ///
    /// Prefers `<public repository>@<digest>`; falls back to the internal
    /// reference when the stream has no public repository.
    pub fn public_pull_spec(&self, tag: &str) -> String {
        let Some(event) = self.latest_event(tag) else {
            return String::new();
        };
        if !self.public_docker_image_repository.is_empty() && !event.image.is_empty() {
            return format!("{}@{}", self.public_docker_image_repository, event.image);
        }
        event.docker_image_reference.clone()
    }
}

/// Resolved release description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Release {
    /// Stream the release was assembled from.
    pub source: ImageStreamRef,
    /// Stream release tags are published into.
    pub target: ImageStream,
    /// Per-release configuration.
    pub config: ReleaseConfig,
}

/// Errors produced while loading releases.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// Release description could not be read.
    #[error("failed to read release {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// Release description is not valid JSON.
    #[error("failed to parse release {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_json::Error,
    },
    /// Release registry is unusable.
    #[error("release registry unavailable: {0}")]
    Unavailable(String),
}

/// Looks up the release backing an image stream.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Load the release assembled from `namespace/name`.
    ///
    /// Returns `Ok(None)` when the release no longer exists.
    async fn load_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Release>, ReleaseError>;
}

/// Releases held in memory, keyed by source stream.
#[derive(Debug, Default)]
pub struct InMemoryReleases {
    releases: RwLock<HashMap<(String, String), Release>>,
}

impl InMemoryReleases {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a release. Returns `false` if the registry lock is poisoned.
    pub fn upsert(&self, release: Release) -> bool {
        let key = (
            release.source.namespace.clone(),
            release.source.name.clone(),
        );
        match self.releases.write() {
            Ok(mut map) => {
                map.insert(key, release);
                true
            }
            Err(_) => false,
        }
    }

    /// Source keys (`namespace`, `name`) of every held release.
    pub fn sources(&self) -> Vec<(String, String)> {
        self.releases
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove the release assembled from `namespace/name`.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<Release> {
        self.releases
            .write()
            .ok()
            .and_then(|mut map| map.remove(&(namespace.to_owned(), name.to_owned())))
    }
}

#[async_trait]
impl ReleaseSource for InMemoryReleases {
    async fn load_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Release>, ReleaseError> {
        let map = self
            .releases
            .read()
            .map_err(|e| ReleaseError::Unavailable(format!("release lock poisoned: {e}")))?;
        Ok(map.get(&(namespace.to_owned(), name.to_owned())).cloned())
    }
}

/// Releases described by `*.json` files in a directory.
#[derive(Debug, Clone)]
pub struct ReleaseDirectory {
    dir: PathBuf,
}

impl ReleaseDirectory {
    /// Reader over `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory being read.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Parse every release file in the directory.
    ///
    /// Files that fail to parse are logged and skipped so one bad file does
    /// not hide every other release.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory itself cannot be listed.
    pub async fn load_all(&self) -> Result<Vec<Release>, ReleaseError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|source| ReleaseError::Read {
                path: self.dir.clone(),
                source,
            })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| ReleaseError::Read {
                path: self.dir.clone(),
                source,
            })?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut releases = Vec::with_capacity(paths.len());
        for path in paths {
            match read_release_file(&path).await {
                Ok(release) => releases.push(release),
                Err(e) => warn!(error = %e, "skipping unreadable release file"),
            }
        }
        debug!(dir = %self.dir.display(), count = releases.len(), "loaded releases");
        Ok(releases)
    }
}

#[async_trait]
impl ReleaseSource for ReleaseDirectory {
    async fn load_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Release>, ReleaseError> {
        let releases = self.load_all().await?;
        Ok(releases
            .into_iter()
            .find(|r| r.source.namespace == namespace && r.source.name == name))
    }
}

/// Read a single JSON release description.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid release.
pub async fn read_release_file(path: &Path) -> Result<Release, ReleaseError> {
    let contents = tokio::fs::read(path)
        .await
        .map_err(|source| ReleaseError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_slice(&contents).map_err(|source| ReleaseError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
