//! Local-socket wire protocol.
//!
//! One JSON object request, one JSON object response, per connection. There
//! is no length prefix: each message is the first self-delimiting JSON value
//! on the stream, terminated by a newline on the write side. The async
//! reader feeds a growing buffer to an incremental parser until one complete
//! value is available; the sync reader lets `serde_json` pull bytes off the
//! stream directly. Reads are bounded to [`MAX_MESSAGE_SIZE`] so a client
//! cannot force an unbounded allocation.

use std::collections::HashMap;
use std::io;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size of a single wire message (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Error code carried by every daemon failure response.
pub const DECRYPTION_ERROR_CODE: u32 = 101;

/// A batch of tagged ciphertexts keyed by client-chosen names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionRequest {
    /// Map from env var name or file path to a tagged-ciphertext string.
    #[serde(default)]
    pub ciphertexts: HashMap<String, String>,
}

/// The daemon's answer: plaintexts or a single error, never both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionResponse {
    /// Populated on failure; suppresses `secrets`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,

    /// Populated on success, mapping request keys to plaintext strings
    /// (`base64:`-prefixed when the request carried the `+base64` infix).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<HashMap<String, String>>,
}

impl DecryptionResponse {
    /// A successful response carrying `secrets`.
    #[must_use]
    pub fn success(secrets: HashMap<String, String>) -> Self {
        Self {
            error: None,
            secrets: Some(secrets),
        }
    }

    /// A failure response with code [`DECRYPTION_ERROR_CODE`].
    #[must_use]
    pub fn failure(message: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            error: Some(ErrorResponse {
                code: DECRYPTION_ERROR_CODE,
                message: message.into(),
                secret: secret.into(),
            }),
            secrets: None,
        }
    }
}

/// Error record in a failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("code: {code}, reason: {message}")]
pub struct ErrorResponse {
    /// Numeric error code; always [`DECRYPTION_ERROR_CODE`] today.
    pub code: u32,
    /// Human-readable failure description.
    pub message: String,
    /// Key of the offending request entry, or empty.
    #[serde(default)]
    pub secret: String,
}

/// Wire transport errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Reading or writing the stream failed.
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream before a complete value arrived.
    #[error("connection closed before a complete message arrived")]
    ConnectionClosed,

    /// The first value on the stream is not the expected JSON shape.
    #[error("could not unmarshal JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Serializing the outgoing value failed.
    #[error("could not marshal JSON: {0}")]
    Encode(#[source] serde_json::Error),

    /// The incoming message exceeded [`MAX_MESSAGE_SIZE`].
    #[error("message exceeds {MAX_MESSAGE_SIZE} bytes")]
    TooLarge,
}

/// Reads the first complete JSON value from an async stream.
///
/// # Errors
///
/// Fails on I/O errors, malformed JSON, oversized messages, or a stream
/// that ends before one full value has arrived.
pub async fn read_value<T, R>(stream: &mut R) -> Result<T, WireError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(WireError::ConnectionClosed);
            }
            return serde_json::from_slice(&buf).map_err(WireError::Malformed);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::TooLarge);
        }

        let mut values = serde_json::Deserializer::from_slice(&buf).into_iter::<T>();
        match values.next() {
            Some(Ok(value)) => return Ok(value),
            Some(Err(err)) if err.is_eof() => {}
            Some(Err(err)) => return Err(WireError::Malformed(err)),
            None => {}
        }
    }
}

/// Writes one JSON value followed by a newline to an async stream.
///
/// # Errors
///
/// Fails on serialization or I/O errors.
pub async fn write_value<T, W>(stream: &mut W, value: &T) -> Result<(), WireError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut body = serde_json::to_vec(value).map_err(WireError::Encode)?;
    body.push(b'\n');
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the first complete JSON value from a blocking stream.
///
/// # Errors
///
/// Fails on I/O errors or malformed JSON.
pub fn read_value_sync<T, R>(reader: R) -> Result<T, WireError>
where
    T: DeserializeOwned,
    R: io::Read,
{
    let mut values = serde_json::Deserializer::from_reader(reader);
    T::deserialize(&mut values).map_err(WireError::Malformed)
}

/// Writes one JSON value followed by a newline to a blocking stream.
///
/// # Errors
///
/// Fails on serialization or I/O errors.
pub fn write_value_sync<T, W>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    T: Serialize,
    W: io::Write,
{
    let mut body = serde_json::to_vec(value).map_err(WireError::Encode)?;
    body.push(b'\n');
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_response_serializes_secrets_only() {
        let response = DecryptionResponse::success(HashMap::from([(
            "PLAIN".to_string(),
            "hunter2".to_string(),
        )]));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json, serde_json::json!({"secrets": {"PLAIN": "hunter2"}}));
    }

    #[test]
    fn empty_success_keeps_the_secrets_field() {
        let json = serde_json::to_string(&DecryptionResponse::success(HashMap::new())).unwrap();
        assert_eq!(json, r#"{"secrets":{}}"#);
    }

    #[test]
    fn failure_response_serializes_error_only() {
        let response = DecryptionResponse::failure("failed to decrypt secret: nope", "PLAIN");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "error": {
                    "code": 101,
                    "message": "failed to decrypt secret: nope",
                    "secret": "PLAIN",
                }
            })
        );
    }

    #[test]
    fn every_constructor_populates_exactly_one_side() {
        let ok = DecryptionResponse::success(HashMap::new());
        assert!(ok.error.is_none() && ok.secrets.is_some());
        let err = DecryptionResponse::failure("boom", "");
        assert!(err.error.is_some() && err.secrets.is_none());
    }

    #[test]
    fn error_display_matches_the_wire_contract() {
        let err = ErrorResponse {
            code: 101,
            message: "failed to retrieve peer credential of the connection".to_string(),
            secret: String::new(),
        };
        assert_eq!(
            err.to_string(),
            "code: 101, reason: failed to retrieve peer credential of the connection"
        );
    }

    #[test]
    fn sync_round_trip() {
        let request = DecryptionRequest {
            ciphertexts: HashMap::from([("KEY".to_string(), "ro:AAAA".to_string())]),
        };
        let mut buf = Vec::new();
        write_value_sync(&mut buf, &request).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));
        let decoded: DecryptionRequest = read_value_sync(&buf[..]).unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn async_read_waits_for_a_complete_value() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let body = br#"{"ciphertexts":{"KEY":"ro:AAAA"}}"#;
        let (head, tail) = body.split_at(10);

        client.write_all(head).await.unwrap();
        let read = tokio::spawn(async move {
            read_value::<DecryptionRequest, _>(&mut server).await.unwrap()
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        client.write_all(tail).await.unwrap();

        let request = read.await.unwrap();
        assert_eq!(request.ciphertexts["KEY"], "ro:AAAA");
    }

    #[tokio::test]
    async fn async_read_takes_only_the_first_value() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client
            .write_all(b"{\"ciphertexts\":{}}\n{\"ciphertexts\":{\"X\":\"ro:AAAA\"}}\n")
            .await
            .unwrap();
        let request: DecryptionRequest = read_value(&mut server).await.unwrap();
        assert!(request.ciphertexts.is_empty());
    }

    #[tokio::test]
    async fn async_read_rejects_garbage() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"not json at all\n").await.unwrap();
        drop(client);
        let err = read_value::<DecryptionRequest, _>(&mut server)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[tokio::test]
    async fn async_read_reports_closed_connections() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_value::<DecryptionRequest, _>(&mut server)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::ConnectionClosed));
    }
}
