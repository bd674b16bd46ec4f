//! Daemon request loop and per-request authorizer.
//!
//! The server blocks on accept and spawns one task per connection, so a
//! slow decrypt cannot head-of-line the accept path. Each connection
//! carries exactly one request and one response: peer credentials are
//! extracted first, then the caller's attested labels are resolved (when a
//! retriever is configured), then the request is read and processed entry
//! by entry. The first failure of any kind produces a single error
//! response and ends the request, so a response never carries both an
//! error and secrets.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use pal_core::codec;
use pal_core::config::ServerConfig;
use pal_core::decrypter::{self, Decrypter, DecrypterError, DecrypterSetupError};
use pal_core::wire::{self, DecryptionRequest, DecryptionResponse};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::credentials::PeerCredentials;
use crate::labels::{DockerRetriever, LabelsError, LabelsRetriever};
use crate::metrics::DecryptionCounters;

/// Where the daemon listens: a filesystem socket path or a numeric
/// descriptor inherited from the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// `unix://<path>`: bind a fresh socket at the path.
    Unix(PathBuf),
    /// `fd://<n>`: adopt an already-listening descriptor (n >= 3).
    Fd(RawFd),
}

/// Listen address parse failures.
#[derive(Debug, Error)]
pub enum AddressParseError {
    /// The address is not `proto://addr`.
    #[error("bad listen address {0:?}, expected unix://<path> or fd://<number>")]
    BadFormat(String),

    /// The fd part is not a number, or numbers a standard stream.
    #[error("invalid socket descriptor {0:?}, expected a number >= 3")]
    BadDescriptor(String),
}

impl FromStr for ListenAddress {
    type Err = AddressParseError;

    fn from_str(address: &str) -> Result<Self, Self::Err> {
        match address.split_once("://") {
            Some(("unix", path)) if !path.is_empty() => Ok(Self::Unix(PathBuf::from(path))),
            Some(("fd", number)) => {
                let fd: RawFd = number
                    .parse()
                    .map_err(|_| AddressParseError::BadDescriptor(number.to_string()))?;
                if fd < 3 {
                    return Err(AddressParseError::BadDescriptor(number.to_string()));
                }
                Ok(Self::Fd(fd))
            }
            _ => Err(AddressParseError::BadFormat(address.to_string())),
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Fd(fd) => write!(f, "fd://{fd}"),
        }
    }
}

/// A bound stream listener.
///
/// The daemon only ever binds unix sockets; the TCP variant exists so
/// tests can exercise the missing-peer-credential path over loopback.
#[derive(Debug)]
pub enum Listener {
    /// Filesystem-family stream socket.
    Unix(UnixListener),
    /// Loopback TCP socket, for tests.
    Tcp(TcpListener),
}

impl Listener {
    /// Binds (or adopts) the listener for an address. A stale socket file
    /// at a unix path is removed first.
    ///
    /// # Errors
    ///
    /// Fails when the path cannot be prepared or the bind/adoption fails.
    pub fn bind(address: &ListenAddress) -> io::Result<Self> {
        match address {
            ListenAddress::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Ok(Self::Unix(UnixListener::bind(path)?))
            }
            ListenAddress::Fd(fd) => {
                // Safety: the service manager handed us this descriptor and
                // nothing else in the process owns it.
                let std_listener =
                    unsafe { std::os::unix::net::UnixListener::from_raw_fd(*fd) };
                std_listener.set_nonblocking(true)?;
                Ok(Self::Unix(UnixListener::from_std(std_listener)?))
            }
        }
    }

    async fn accept(&self) -> io::Result<Connection> {
        match self {
            Self::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Connection::Unix(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Connection::Tcp(stream))
            }
        }
    }
}

/// One accepted connection.
#[derive(Debug)]
pub enum Connection {
    /// Connection on a unix stream socket.
    Unix(UnixStream),
    /// Connection on a TCP socket; never carries peer credentials.
    Tcp(TcpStream),
}

impl Connection {
    fn peer_credentials(&self) -> Result<PeerCredentials, crate::credentials::CredentialsError> {
        match self {
            Self::Unix(stream) => PeerCredentials::from_stream(stream),
            Self::Tcp(_) => Err(crate::credentials::CredentialsError::NotUnix),
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            Connection::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            Connection::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(stream) => Pin::new(stream).poll_flush(cx),
            Connection::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            Connection::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Daemon construction failures; fatal at startup.
#[derive(Debug, Error)]
pub enum ServerSetupError {
    /// A decrypter could not be built, or none are configured.
    #[error(transparent)]
    Decrypter(#[from] DecrypterSetupError),

    /// The configured retriever name is not `docker` or `mocker`.
    #[error("invalid labels retriever {0:?}")]
    UnknownRetriever(String),

    /// The docker retriever could not be set up.
    #[error("failed to configure labels retriever: {0}")]
    Labels(#[from] LabelsError),
}

/// The PAL daemon: verifies caller identity and decrypts their secrets.
pub struct Server {
    decrypters: HashMap<String, Decrypter>,
    retriever: Option<Arc<dyn LabelsRetriever>>,
    counters: DecryptionCounters,
}

impl Server {
    /// Builds a server from one environment's configuration.
    ///
    /// The `mocker` retriever name leaves the retriever slot empty for a
    /// later [`Server::with_retriever`] call from tests.
    ///
    /// # Errors
    ///
    /// Fails when no decrypter is configured, a configured decrypter
    /// cannot be constructed, or the retriever name is unknown.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ServerSetupError> {
        let decrypters = decrypter::from_config(config)?;

        let retriever: Option<Arc<dyn LabelsRetriever>> = if config.labels_enabled {
            match config.labels_retriever.as_str() {
                "docker" => Some(Arc::new(DockerRetriever::new(
                    &config.notary_trust_server,
                    &config.notary_trust_dir,
                )?)),
                "mocker" => None,
                other => return Err(ServerSetupError::UnknownRetriever(other.to_string())),
            }
        } else {
            None
        };

        Ok(Self {
            decrypters,
            retriever,
            counters: DecryptionCounters::new(),
        })
    }

    /// Builds a server from explicit parts, for tests and embedding.
    #[must_use]
    pub fn new(decrypters: HashMap<String, Decrypter>) -> Self {
        Self {
            decrypters,
            retriever: None,
            counters: DecryptionCounters::new(),
        }
    }

    /// Replaces the label retriever.
    #[must_use]
    pub fn with_retriever(mut self, retriever: Arc<dyn LabelsRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// A copy of the per-label decryption counters.
    #[must_use]
    pub fn counters(&self) -> HashMap<String, u64> {
        self.counters.snapshot()
    }

    /// Accepts and serves connections until `shutdown` resolves.
    ///
    /// Each accepted connection is handled on its own task; in-flight
    /// handlers finish on their own after the loop stops accepting.
    ///
    /// # Errors
    ///
    /// Returns the first fatal accept error.
    pub async fn serve<F>(self: Arc<Self>, listener: Listener, shutdown: F) -> io::Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut handlers = tokio::task::JoinSet::new();
        info!("pal server accepting connections");

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok(connection) => {
                        let server = Arc::clone(&self);
                        handlers.spawn(server.serve_connection(connection));
                    }
                    Err(err) => {
                        error!("failed to accept connection: {err}");
                    }
                },
                Some(_finished) = handlers.join_next() => {}
                () = &mut shutdown => break,
            }
        }

        info!(in_flight = handlers.len(), "pal server shutting down");
        while handlers.join_next().await.is_some() {}
        Ok(())
    }

    /// Handles one connection: one request, one response, guaranteed close.
    async fn serve_connection(self: Arc<Self>, mut connection: Connection) {
        debug!("new decryption connection");
        let response = self.handle(&mut connection).await;

        if let Some(err) = &response.error {
            error!(code = err.code, secret = %err.secret, "{}", err.message);
        }
        if let Err(err) = wire::write_value(&mut connection, &response).await {
            error!("failed to send decryption response: {err}");
        }
        // Dropping the connection closes it on every exit path.
    }

    async fn handle(&self, connection: &mut Connection) -> DecryptionResponse {
        let peer = match connection.peer_credentials() {
            Ok(peer) => peer,
            Err(err) => return DecryptionResponse::failure(err.to_string(), ""),
        };
        debug!(pid = peer.pid, uid = peer.uid, gid = peer.gid, "peer authenticated");

        let authorized = match &self.retriever {
            Some(retriever) => match retriever.labels_for_pid(peer.pid).await {
                Ok(labels) => Some(labels),
                Err(err) => {
                    return DecryptionResponse::failure(
                        format!("failed to get authorized labels: {err}"),
                        "",
                    )
                }
            },
            None => None,
        };

        let request: DecryptionRequest = match wire::read_value(connection).await {
            Ok(request) => request,
            Err(err) => {
                return DecryptionResponse::failure(format!("could not unmarshal JSON: {err}"), "")
            }
        };

        let mut secrets = HashMap::with_capacity(request.ciphertexts.len());
        for (key, value) in &request.ciphertexts {
            match self.decrypt_entry(value, authorized.as_ref()).await {
                Ok(plaintext) => {
                    secrets.insert(key.clone(), plaintext);
                }
                Err(err) => return DecryptionResponse::failure(err.to_string(), key.clone()),
            }
        }

        DecryptionResponse::success(secrets)
    }

    /// Runs one ciphertext through split, decode, decrypt, count, and
    /// authorize; returns the wire-ready plaintext.
    async fn decrypt_entry(
        &self,
        value: &str,
        authorized: Option<&HashSet<String>>,
    ) -> Result<String, EntryError> {
        let tagged = codec::split_value(value).ok_or(EntryError::MissingScheme)?;
        let ciphertext = STANDARD.decode(tagged.payload)?;
        let decrypter = self
            .decrypters
            .get(tagged.scheme)
            .ok_or_else(|| EntryError::UnknownScheme(tagged.scheme.to_string()))?;

        let secret = decrypter.decrypt(&ciphertext).await?;

        for label in &secret.labels {
            // Counted before the check: metrics reflect attempted accesses.
            self.counters.record(label);
            if let Some(authorized) = authorized {
                if !authorized.contains(label) {
                    let mut required: Vec<String> = authorized.iter().cloned().collect();
                    required.sort();
                    return Err(EntryError::UnauthorizedLabel {
                        label: label.clone(),
                        required,
                    });
                }
            }
        }

        Ok(codec::join_value(
            tagged.binary,
            &String::from_utf8_lossy(&secret.value),
        ))
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("schemes", &self.decrypters.keys().collect::<Vec<_>>())
            .field("labels_enabled", &self.retriever.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
enum EntryError {
    #[error("failed to decrypt secret: missing decrypter scheme")]
    MissingScheme,

    #[error("error decoding base64-encoded secret: {0}")]
    PayloadEncoding(#[from] base64::DecodeError),

    #[error("failed to decrypt secret: no decrypter configured for scheme {0:?}")]
    UnknownScheme(String),

    #[error("failed to decrypt secret: {0}")]
    Decrypt(#[from] DecrypterError),

    #[error("unauthorized label {label:?}, required one of {required:?}")]
    UnauthorizedLabel {
        label: String,
        required: Vec<String>,
    },
}
