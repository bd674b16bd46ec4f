//! Shared harness for daemon RPC tests.
//!
//! Provides a fake Red October service (the decryption itself is faked:
//! the sealed payload travels in clear inside the envelope, so the real
//! `ro` decrypter and envelope parsing are exercised end to end), a
//! server-under-test builder, and a blocking RPC client matching the real
//! client's open-write-read-close cycle.

use std::collections::HashMap;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use pal_core::decrypter::{Decrypter, RoDecrypter};
use pal_core::wire::{self, DecryptionRequest, DecryptionResponse};
use pal_daemon::server::{Listener, Server};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Builds the base64 payload of an `ro:` value: a sealed envelope whose
/// header binds `labels` and whose (fake-)sealed payload is `plaintext`.
pub fn seal(labels: &[&str], plaintext: &[u8]) -> String {
    let inner = serde_json::json!({
        "Version": 1,
        "Labels": labels,
        "Data": STANDARD.encode(plaintext),
    });
    let outer = serde_json::json!({
        "Version": 1,
        "Data": STANDARD.encode(serde_json::to_vec(&inner).expect("inner envelope serializes")),
    });
    STANDARD.encode(serde_json::to_vec(&outer).expect("outer envelope serializes"))
}

async fn decrypt_handler(Json(call): Json<serde_json::Value>) -> Json<serde_json::Value> {
    let ciphertext = STANDARD
        .decode(call["Data"].as_str().expect("Data is a string"))
        .expect("Data is base64");
    let outer: serde_json::Value =
        serde_json::from_slice(&ciphertext).expect("outer envelope parses");
    let inner_bytes = STANDARD
        .decode(outer["Data"].as_str().expect("outer Data is a string"))
        .expect("outer Data is base64");
    let inner: serde_json::Value =
        serde_json::from_slice(&inner_bytes).expect("inner envelope parses");

    let decrypted = serde_json::json!({
        "Data": inner["Data"],
    });
    Json(serde_json::json!({
        "Status": "ok",
        "Response": STANDARD.encode(serde_json::to_vec(&decrypted).expect("reply serializes")),
    }))
}

/// Starts the fake threshold service on an ephemeral loopback port and
/// returns its base URL.
pub async fn fake_threshold_service() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("loopback bind");
    let addr = listener.local_addr().expect("local addr");
    let router = Router::new().route("/decrypt", post(decrypt_handler));
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("fake service runs");
    });
    format!("http://{addr}")
}

/// A server-under-test with only the `ro` decrypter configured.
pub async fn ro_server() -> Server {
    let service_url = fake_threshold_service().await;
    let decrypter =
        RoDecrypter::new("test-user", "test-password", &service_url, "").expect("ro decrypter");
    Server::new(HashMap::from([(
        "ro".to_string(),
        Decrypter::RedOctober(decrypter),
    )]))
}

/// Serves `server` on `listener` until the returned sender is dropped.
pub fn start(
    server: Arc<Server>,
    listener: Listener,
) -> (oneshot::Sender<()>, JoinHandle<std::io::Result<()>>) {
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.serve(listener, async {
        let _ = stopped.await;
    }));
    (stop, handle)
}

/// One blocking open-write-read-close RPC cycle, as the real client does.
pub async fn rpc(socket_path: PathBuf, request: DecryptionRequest) -> DecryptionResponse {
    tokio::task::spawn_blocking(move || {
        let mut stream = StdUnixStream::connect(&socket_path).expect("dial daemon socket");
        wire::write_value_sync(&mut stream, &request).expect("write request");
        wire::read_value_sync(&stream).expect("read response")
    })
    .await
    .expect("rpc task")
}

/// Sends raw bytes over the socket and reads one response.
pub async fn rpc_raw(socket_path: PathBuf, body: Vec<u8>) -> DecryptionResponse {
    tokio::task::spawn_blocking(move || {
        use std::io::Write as _;
        let mut stream = StdUnixStream::connect(&socket_path).expect("dial daemon socket");
        stream.write_all(&body).expect("write raw request");
        stream
            .shutdown(std::net::Shutdown::Write)
            .expect("shutdown write side");
        wire::read_value_sync(&stream).expect("read response")
    })
    .await
    .expect("rpc task")
}
