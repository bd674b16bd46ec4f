//! Label attestation.
//!
//! A retriever maps the pid of a connecting process to the set of labels
//! that process is entitled to receive secrets for. The production
//! implementation resolves the pid to a Docker container, verifies the
//! container image's signature against a Notary trust server, and reads the
//! label set from the image metadata. The caller never supplies labels
//! itself.

mod docker;
mod notary;

use std::collections::HashSet;
use std::io;

use async_trait::async_trait;
use thiserror::Error;

pub use docker::DockerRetriever;
pub use notary::{NotaryClient, NotaryError};

/// Resolves a caller pid to its attested label set.
///
/// Implementations must be safe for concurrent calls; the daemon invokes
/// the retriever from every connection task.
#[async_trait]
pub trait LabelsRetriever: Send + Sync {
    /// Returns the labels the process identified by `pid` may use.
    ///
    /// # Errors
    ///
    /// Any resolution or verification failure denies the request.
    async fn labels_for_pid(&self, pid: i32) -> Result<HashSet<String>, LabelsError>;
}

/// Label attestation failures.
#[derive(Debug, Error)]
pub enum LabelsError {
    /// The kernel cgroup list for the pid could not be read.
    #[error("could not read cgroup list for pid {pid}: {source}")]
    Cgroup {
        /// Pid whose cgroup file was inspected.
        pid: i32,
        /// Underlying I/O failure.
        source: io::Error,
    },

    /// No cgroup path component looks like a container id.
    #[error("unknown docker container")]
    UnknownContainer,

    /// The local container runtime could not answer.
    #[error("docker api request failed: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// The container's image carries no tag or digest to verify.
    #[error("image without tag or digests")]
    UntaggedImage,

    /// The trust status of the image could not be established.
    #[error("failed to get trust status: {0}")]
    Trust(#[source] NotaryError),

    /// The locally reported digest does not match the signed digest.
    #[error("image {image} with digest {digest} is not trusted")]
    UntrustedImage {
        /// Image reference under verification.
        image: String,
        /// Locally reported repository digest.
        digest: String,
    },
}

/// Fixed-answer retriever for tests.
#[derive(Debug, Clone, Default)]
pub struct MockRetriever {
    labels: HashSet<String>,
}

impl MockRetriever {
    /// A retriever that answers every pid with `labels`.
    #[must_use]
    pub fn new(labels: HashSet<String>) -> Self {
        Self { labels }
    }
}

#[async_trait]
impl LabelsRetriever for MockRetriever {
    async fn labels_for_pid(&self, _pid: i32) -> Result<HashSet<String>, LabelsError> {
        Ok(self.labels.clone())
    }
}
