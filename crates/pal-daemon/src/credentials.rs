//! Peer credentials extracted from the Unix socket.
//!
//! Authentication on the local socket is by kernel-reported process
//! identity, not cryptography: `SO_PEERCRED` on a filesystem-family stream
//! socket yields the `(pid, uid, gid)` of the connecting process. The
//! extraction must succeed once per connection before any request bytes are
//! read; the pid then drives the label attestor.

use std::io;

use thiserror::Error;
use tokio::net::UnixStream;

/// Kernel-reported identity of the peer process on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Process ID of the peer.
    pub pid: i32,
    /// User ID of the peer.
    pub uid: u32,
    /// Group ID of the peer.
    pub gid: u32,
}

/// Failure to obtain peer credentials for a connection.
///
/// Every variant's message leads with the fixed
/// `failed to retrieve peer credential of the connection` phrase the wire
/// contract promises.
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// The connection is not backed by a unix stream socket.
    #[error("failed to retrieve peer credential of the connection: internal listener is not a unix socket")]
    NotUnix,

    /// The `SO_PEERCRED` query failed.
    #[error("failed to retrieve peer credential of the connection: {0}")]
    Unavailable(#[source] io::Error),

    /// The kernel reported no pid for the peer.
    #[error("failed to retrieve peer credential of the connection: peer pid is not reported")]
    MissingPid,
}

impl PeerCredentials {
    /// Extracts credentials from a connected unix stream via `SO_PEERCRED`.
    ///
    /// # Errors
    ///
    /// Fails when the socket option cannot be read or the platform reports
    /// no peer pid.
    pub fn from_stream(stream: &UnixStream) -> Result<Self, CredentialsError> {
        let cred = stream.peer_cred().map_err(CredentialsError::Unavailable)?;
        let pid = cred.pid().ok_or(CredentialsError::MissingPid)?;
        Ok(Self {
            pid,
            uid: cred.uid(),
            gid: cred.gid(),
        })
    }
}

#[cfg(test)]
mod tests {
    use nix::unistd::{getgid, getuid};
    use tokio::net::UnixStream as TokioUnixStream;

    use super::*;

    #[tokio::test]
    async fn socketpair_reports_own_identity() {
        let (left, _right) = TokioUnixStream::pair().expect("socketpair");

        let creds = PeerCredentials::from_stream(&left).expect("peer credentials");

        assert_eq!(creds.uid, getuid().as_raw());
        assert_eq!(creds.gid, getgid().as_raw());
        assert_eq!(creds.pid, std::process::id() as i32);
    }
}
