//! Docker-attested label retrieval.
//!
//! Resolution path: pid → container id (64-hex component in the kernel
//! cgroup list) → container → image → signed digest comparison against the
//! Notary trust server → `pal.labels` image metadata. Digest comparison is
//! mandatory; any lookup failure denies the request.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use bollard::Docker;
use regex::Regex;

use super::notary::NotaryClient;
use super::{LabelsError, LabelsRetriever};

/// Image metadata key carrying the comma-separated label list.
const LABELS_KEY: &str = "pal.labels";

static CONTAINER_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9a-f]{64})").expect("container id regex is valid"));

/// Retriever backed by the local Docker runtime and a Notary trust server.
pub struct DockerRetriever {
    docker: Docker,
    notary: NotaryClient,
}

impl std::fmt::Debug for DockerRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRetriever")
            .field("notary", &self.notary)
            .finish_non_exhaustive()
    }
}

impl DockerRetriever {
    /// Connects to the local Docker daemon and prepares the Notary client.
    /// Empty `trust_server`/`trust_dir` select the Docker defaults.
    ///
    /// # Errors
    ///
    /// Fails when the Docker connection or the trust client cannot be set
    /// up.
    pub fn new(trust_server: &str, trust_dir: &str) -> Result<Self, LabelsError> {
        let docker = Docker::connect_with_local_defaults()?;
        let notary = NotaryClient::new(trust_server, trust_dir).map_err(LabelsError::Trust)?;
        Ok(Self { docker, notary })
    }

    async fn is_trusted(&self, image: &str, local_digest: &str) -> Result<bool, LabelsError> {
        let signed_digest = self
            .notary
            .signed_digest(image)
            .await
            .map_err(LabelsError::Trust)?;

        // Local repo digests come as `name@sha256:...`.
        let local = match local_digest.split_once('@') {
            Some((_, digest)) => digest,
            None => local_digest,
        };
        Ok(signed_digest == local)
    }
}

#[async_trait]
impl LabelsRetriever for DockerRetriever {
    async fn labels_for_pid(&self, pid: i32) -> Result<HashSet<String>, LabelsError> {
        let cgroups = tokio::fs::read_to_string(format!("/proc/{pid}/cgroup"))
            .await
            .map_err(|err| LabelsError::Cgroup { pid, source: err })?;
        let container_id = find_container_id(&cgroups).ok_or(LabelsError::UnknownContainer)?;

        let container = self
            .docker
            .inspect_container(&container_id, None::<bollard::container::InspectContainerOptions>)
            .await?;
        let image_ref = container.image.ok_or(LabelsError::UnknownContainer)?;

        let image = self.docker.inspect_image(&image_ref).await?;
        let tag = image
            .repo_tags
            .as_deref()
            .and_then(|tags| tags.first())
            .ok_or(LabelsError::UntaggedImage)?
            .clone();
        let digest = image
            .repo_digests
            .as_deref()
            .and_then(|digests| digests.first())
            .ok_or(LabelsError::UntaggedImage)?
            .clone();

        if !self.is_trusted(&tag, &digest).await? {
            return Err(LabelsError::UntrustedImage { image: tag, digest });
        }

        let mut labels = HashSet::new();
        if let Some(value) = image
            .config
            .and_then(|config| config.labels)
            .and_then(|mut map| map.remove(LABELS_KEY))
        {
            for label in value.split(',') {
                labels.insert(label.trim().to_string());
            }
        }
        Ok(labels)
    }
}

/// Scans a `/proc/<pid>/cgroup` listing for a 64-hex-digit container id.
fn find_container_id(cgroups: &str) -> Option<String> {
    for line in cgroups.lines() {
        // hierarchy-ID:controller-list:cgroup-path
        let path = line.rsplit(':').next()?;
        if let Some(captures) = CONTAINER_ID_REGEX.captures(path) {
            return Some(captures[1].to_string());
        }
    }
    None
}
