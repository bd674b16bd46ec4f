//! End-to-end daemon RPC scenarios over real sockets.

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use pal_core::codec;
use pal_core::wire::DecryptionRequest;
use pal_daemon::labels::MockRetriever;
use pal_daemon::server::Listener;
use tokio::net::UnixListener;

use common::{ro_server, rpc, rpc_raw, seal, start};

fn attested() -> Arc<MockRetriever> {
    Arc::new(MockRetriever::new(HashSet::from([
        "app-foo".to_string(),
        "test-secret".to_string(),
    ])))
}

fn request(entries: &[(&str, String)]) -> DecryptionRequest {
    DecryptionRequest {
        ciphertexts: entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect(),
    }
}

struct TestSocket {
    _dir: tempfile::TempDir,
    path: std::path::PathBuf,
}

fn unix_listener() -> (TestSocket, Listener) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pald-rpc.sock");
    let listener = UnixListener::bind(&path).expect("bind unix socket");
    (TestSocket { _dir: dir, path }, Listener::Unix(listener))
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_secret_round_trips_through_the_threshold_service() {
    let server = Arc::new(ro_server().await.with_retriever(attested()));
    let (socket, listener) = unix_listener();
    let (_stop, _serving) = start(Arc::clone(&server), listener);

    let payload = seal(&["test-secret"], "super plain secret".as_bytes());
    let response = rpc(socket.path.clone(), request(&[("PLAIN", format!("ro:{payload}"))])).await;

    assert!(response.error.is_none(), "unexpected error: {:?}", response.error);
    let secrets = response.secrets.expect("secrets populated");
    assert_eq!(secrets["PLAIN"], "super plain secret");
}

#[tokio::test(flavor = "multi_thread")]
async fn binary_secret_comes_back_with_the_transport_prefix() {
    let server = Arc::new(ro_server().await.with_retriever(attested()));
    let (socket, listener) = unix_listener();
    let (_stop, _serving) = start(Arc::clone(&server), listener);

    // The producer base64-wraps binary plaintexts before sealing.
    let raw = [0u8, 159, 146, 150];
    let wrapped = STANDARD.encode(raw);
    let payload = seal(&["test-secret"], wrapped.as_bytes());
    let response = rpc(
        socket.path.clone(),
        request(&[("PLAIN", format!("ro+base64:{payload}"))]),
    )
    .await;

    let secrets = response.secrets.expect("secrets populated");
    assert_eq!(secrets["PLAIN"], format!("base64:{wrapped}"));
    assert_eq!(codec::decode_value(&secrets["PLAIN"]).unwrap(), raw);
}

#[tokio::test(flavor = "multi_thread")]
async fn unattested_label_denies_the_request() {
    let server = Arc::new(ro_server().await.with_retriever(attested()));
    let (socket, listener) = unix_listener();
    let (_stop, _serving) = start(Arc::clone(&server), listener);

    let payload = seal(&["required-label-but-not-exist"], b"nope");
    let response = rpc(socket.path.clone(), request(&[("PLAIN", format!("ro:{payload}"))])).await;

    assert!(response.secrets.is_none());
    let error = response.error.expect("error populated");
    assert_eq!(error.code, 101);
    assert!(
        error.message.contains("required-label-but-not-exist"),
        "message must name the denied label: {}",
        error.message
    );

    // Denied attempts still count.
    assert_eq!(server.counters()["required-label-but-not-exist"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_connections_have_no_peer_credentials() {
    let server = Arc::new(ro_server().await);
    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("loopback bind");
    let addr = tcp.local_addr().expect("local addr");
    let (_stop, _serving) = start(server, Listener::Tcp(tcp));

    // The daemon rejects the connection before reading any request bytes,
    // so the client only needs to read.
    let response = tokio::task::spawn_blocking(move || {
        let stream = std::net::TcpStream::connect(addr).expect("dial tcp");
        pal_core::wire::read_value_sync::<pal_core::wire::DecryptionResponse, _>(&stream)
            .expect("read response")
    })
    .await
    .expect("rpc task");

    let error = response.error.expect("error populated");
    assert_eq!(error.code, 101);
    assert!(
        error.message.contains("failed to retrieve peer credential"),
        "unexpected message: {}",
        error.message
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_request_returns_empty_secrets() {
    let server = Arc::new(ro_server().await.with_retriever(attested()));
    let (socket, listener) = unix_listener();
    let (_stop, _serving) = start(server, listener);

    let response = rpc(socket.path.clone(), DecryptionRequest::default()).await;

    assert!(response.error.is_none());
    assert_eq!(response.secrets, Some(HashMap::new()));
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_request_is_a_protocol_error() {
    let server = Arc::new(ro_server().await);
    let (socket, listener) = unix_listener();
    let (_stop, _serving) = start(server, listener);

    let response = rpc_raw(socket.path.clone(), b"this is not json\n".to_vec()).await;

    let error = response.error.expect("error populated");
    assert_eq!(error.code, 101);
    assert!(
        error.message.contains("could not unmarshal JSON"),
        "unexpected message: {}",
        error.message
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn undecodable_payload_fails_the_whole_request() {
    let server = Arc::new(ro_server().await.with_retriever(attested()));
    let (socket, listener) = unix_listener();
    let (_stop, _serving) = start(server, listener);

    let good = seal(&["test-secret"], b"fine");
    let response = rpc(
        socket.path.clone(),
        request(&[
            ("GOOD", format!("ro:{good}")),
            ("BAD", "ro:!!!not-base64!!!".to_string()),
        ]),
    )
    .await;

    // One error, no partial success, regardless of processing order.
    assert!(response.secrets.is_none());
    let error = response.error.expect("error populated");
    assert_eq!(error.code, 101);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_scheme_is_a_decrypt_failure() {
    let server = Arc::new(ro_server().await);
    let (socket, listener) = unix_listener();
    let (_stop, _serving) = start(server, listener);

    let response = rpc(
        socket.path.clone(),
        request(&[("PLAIN", "vault:AAAA".to_string())]),
    )
    .await;

    let error = response.error.expect("error populated");
    assert_eq!(error.code, 101);
    assert!(
        error.message.contains("no decrypter configured"),
        "unexpected message: {}",
        error.message
    );
    assert_eq!(error.secret, "PLAIN");
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_attestation_still_counts_labels() {
    let server = Arc::new(ro_server().await);
    let (socket, listener) = unix_listener();
    let (_stop, _serving) = start(Arc::clone(&server), listener);

    let payload = seal(&["test-secret"], b"visible");
    let response = rpc(socket.path.clone(), request(&[("PLAIN", format!("ro:{payload}"))])).await;

    assert_eq!(response.secrets.expect("secrets populated")["PLAIN"], "visible");
    assert_eq!(server.counters()["test-secret"], 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_labels_are_counted_per_occurrence() {
    let server = Arc::new(ro_server().await.with_retriever(attested()));
    let (socket, listener) = unix_listener();
    let (_stop, _serving) = start(Arc::clone(&server), listener);

    let payload = seal(&["test-secret", "test-secret"], b"twice-labeled");
    let response = rpc(socket.path.clone(), request(&[("PLAIN", format!("ro:{payload}"))])).await;

    assert_eq!(
        response.secrets.expect("secrets populated")["PLAIN"],
        "twice-labeled"
    );
    assert_eq!(server.counters()["test-secret"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn response_keys_match_request_keys_exactly() {
    let server = Arc::new(ro_server().await.with_retriever(attested()));
    let (socket, listener) = unix_listener();
    let (_stop, _serving) = start(server, listener);

    let entries: Vec<(&str, String)> = vec![
        ("FIRST", format!("ro:{}", seal(&["test-secret"], b"one"))),
        ("SECOND", format!("ro:{}", seal(&["test-secret"], b"two"))),
        ("/etc/third", format!("ro:{}", seal(&["app-foo"], b"three"))),
    ];
    let response = rpc(socket.path.clone(), request(&entries)).await;

    let secrets = response.secrets.expect("secrets populated");
    let mut got: Vec<&str> = secrets.keys().map(String::as_str).collect();
    got.sort_unstable();
    assert_eq!(got, ["/etc/third", "FIRST", "SECOND"]);
    assert_eq!(secrets["FIRST"], "one");
    assert_eq!(secrets["SECOND"], "two");
    assert_eq!(secrets["/etc/third"], "three");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_are_served_independently() {
    let server = Arc::new(ro_server().await.with_retriever(attested()));
    let (socket, listener) = unix_listener();
    let (_stop, _serving) = start(Arc::clone(&server), listener);

    let mut tasks = Vec::new();
    for index in 0..8 {
        let path = socket.path.clone();
        let payload = seal(&["test-secret"], format!("value-{index}").as_bytes());
        tasks.push(tokio::spawn(async move {
            let response = rpc(path, request(&[("KEY", format!("ro:{payload}"))])).await;
            (index, response)
        }));
    }

    for task in tasks {
        let (index, response) = task.await.expect("request task");
        let secrets = response.secrets.expect("secrets populated");
        assert_eq!(secrets["KEY"], format!("value-{index}"));
    }

    assert_eq!(server.counters()["test-secret"], 8);
}
