//! End-to-end tests over loopback TCP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;

use tcpwire::{
    Client, ClientError, CloseReason, CodecError, ConnectionId, JsonCodec, LifecycleObserver,
    MessageHandler, Server, ServerConfig, ServerError, Value, ValueCodec,
};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Running<H> {
    server: Arc<Server<H>>,
    accept: JoinHandle<Result<(), ServerError>>,
    addr: SocketAddr,
}

impl<H: MessageHandler> Running<H> {
    async fn client(&self) -> Client {
        let mut client = Client::new();
        client
            .connect("127.0.0.1", self.addr.port())
            .await
            .unwrap();
        client
    }

    async fn shutdown(self) {
        tokio::time::timeout(TIMEOUT, self.server.stop())
            .await
            .expect("stop timed out");
        self.accept.await.unwrap().unwrap();
    }
}

async fn run<H: MessageHandler>(server: Server<H>) -> Running<H> {
    let server = Arc::new(server);
    let runner = Arc::clone(&server);
    let accept = tokio::spawn(async move { runner.start().await });
    let addr = server.wait_listening().await.unwrap();
    Running {
        server,
        accept,
        addr,
    }
}

fn loopback() -> ServerConfig {
    ServerConfig::new("127.0.0.1", 0)
}

fn status_handler(_request: Value) -> Value {
    json!({"status": true})
}

#[derive(Default)]
struct AcceptLog {
    accepted: Mutex<Vec<ConnectionId>>,
}

impl LifecycleObserver for AcceptLog {
    fn on_accept(&self, id: ConnectionId, _peer: SocketAddr) {
        self.accepted.lock().unwrap().push(id);
    }
}

async fn wait_for_count<H: MessageHandler>(server: &Server<H>, count: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while server.connection_count() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection count never settled");
}

#[tokio::test]
async fn request_gets_status_response() {
    let running = run(Server::new(loopback(), status_handler)).await;

    let mut client = running.client().await;
    let response = client.send(&json!({"a": 1})).await.unwrap();
    assert_eq!(response, json!({"status": true}));

    client.close().await;
    running.shutdown().await;
}

#[tokio::test]
async fn several_requests_on_one_connection() {
    let running = run(Server::new(loopback(), |request: Value| {
        json!({ "doubled": request["n"].as_i64().unwrap_or(0) * 2 })
    }))
    .await;

    let mut client = running.client().await;
    for n in 0..10 {
        let response = client.send(&json!({ "n": n })).await.unwrap();
        assert_eq!(response, json!({ "doubled": n * 2 }));
    }

    running.shutdown().await;
}

/// Comma-separated counter: every position is distinct, so any reordering,
/// duplication or loss inside the payload changes it.
fn counting_payload(len: usize) -> String {
    let mut payload = String::with_capacity(len + 16);
    let mut n = 0u64;
    while payload.len() < len {
        payload.push_str(&n.to_string());
        payload.push(',');
        n += 1;
    }
    payload.truncate(len);
    payload
}

#[tokio::test]
async fn large_payload_is_reassembled() {
    let running = run(Server::new(loopback(), |request: Value| {
        let blob = request["blob"].as_str().unwrap_or_default();
        json!({ "len": blob.len(), "echo": blob })
    }))
    .await;

    let blob = counting_payload(5_000_000);
    let mut client = running.client().await;
    let response = client.send(&json!({ "blob": blob })).await.unwrap();
    assert_eq!(response["len"], json!(5_000_000));
    assert!(response["echo"].as_str() == Some(blob.as_str()));

    running.shutdown().await;
}

#[tokio::test]
async fn empty_response_is_not_a_missing_response() {
    let running = run(Server::new(loopback(), |_request: Value| json!({}))).await;

    let mut client = running.client().await;
    let response = client.send(&json!({"a": 1})).await.unwrap();
    assert_eq!(response, json!({}));
    assert!(client.is_connected());

    running.shutdown().await;
}

#[tokio::test]
async fn server_closing_after_accept_yields_no_response() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accept = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let mut client = Client::new();
    client.connect("127.0.0.1", port).await.unwrap();
    accept.await.unwrap();

    let err = client.send(&json!({"a": 1})).await.unwrap_err();
    assert!(err.is_no_response(), "unexpected error: {err}");
    assert!(!client.is_connected());

    let err = client.send(&json!({"a": 1})).await.unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test]
async fn connect_to_closed_port_is_refused() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut client = Client::new();
    let err = client.connect("127.0.0.1", port).await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionRefused { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connections_get_distinct_sequential_ids() {
    let log = Arc::new(AcceptLog::default());
    let running = run(
        Server::new(loopback().with_backlog(64), status_handler)
            .with_shared_observer(log.clone()),
    )
    .await;
    let port = running.addr.port();

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            tokio::spawn(async move {
                let mut client = Client::new();
                client.connect("127.0.0.1", port).await.unwrap();
                let response = client.send(&json!({"a": 1})).await.unwrap();
                assert_eq!(response, json!({"status": true}));
                client
            })
        })
        .collect();
    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }

    let ids: Vec<u64> = running.server.connections().iter().map(|c| c.id.get()).collect();
    assert_eq!(ids, (1..=32).collect::<Vec<_>>());

    let mut late = running.client().await;
    late.send(&json!({"a": 2})).await.unwrap();
    let last = *log.accepted.lock().unwrap().last().unwrap();
    assert_eq!(last, ConnectionId::new(33));

    drop(clients);
    running.shutdown().await;
}

#[tokio::test]
async fn closed_connection_leaves_registry() {
    let running = run(Server::new(loopback(), status_handler)).await;

    let mut client = running.client().await;
    client.send(&json!({"a": 1})).await.unwrap();
    assert_eq!(running.server.connection_count(), 1);

    client.close().await;
    wait_for_count(&running.server, 0).await;

    running.shutdown().await;
}

#[tokio::test]
async fn stop_closes_every_connection_and_listener() {
    let running = run(Server::new(loopback(), status_handler)).await;
    let port = running.addr.port();

    let mut clients = Vec::new();
    for _ in 0..5 {
        let mut client = running.client().await;
        client.send(&json!({"a": 1})).await.unwrap();
        clients.push(client);
    }
    assert_eq!(running.server.connection_count(), 5);

    let server = Arc::clone(&running.server);
    running.shutdown().await;
    assert_eq!(server.connection_count(), 0);
    assert!(!server.is_running());

    for client in &mut clients {
        let err = client.send(&json!({"a": 2})).await.unwrap_err();
        assert!(err.is_no_response(), "unexpected error: {err}");
    }

    let mut late = Client::new();
    let err = late.connect("127.0.0.1", port).await.unwrap_err();
    assert!(matches!(err, ClientError::ConnectionRefused { .. }));
}

struct NeverReplies;

#[async_trait]
impl MessageHandler for NeverReplies {
    async fn handle(&self, _request: Value) -> Value {
        std::future::pending().await
    }
}

#[tokio::test]
async fn stop_interrupts_pending_handler() {
    let running = run(Server::new(loopback(), NeverReplies)).await;
    let port = running.addr.port();

    let request = tokio::spawn(async move {
        let mut client = Client::new();
        client.connect("127.0.0.1", port).await.unwrap();
        client.send(&json!({"a": 1})).await
    });
    wait_for_count(&running.server, 1).await;

    running.shutdown().await;
    let err = request.await.unwrap().unwrap_err();
    assert!(err.is_no_response(), "unexpected error: {err}");
}

#[tokio::test]
async fn peer_dropping_mid_frame_does_not_affect_others() {
    let running = run(Server::new(loopback(), status_handler)).await;

    let mut steady = running.client().await;
    steady.send(&json!({"a": 1})).await.unwrap();

    let mut raw = TcpStream::connect(running.addr).await.unwrap();
    raw.write_all(&[0, 0, 0, 50, b'{', b'"']).await.unwrap();
    wait_for_count(&running.server, 2).await;
    drop(raw);
    wait_for_count(&running.server, 1).await;

    let response = steady.send(&json!({"a": 2})).await.unwrap();
    assert_eq!(response, json!({"status": true}));

    running.shutdown().await;
}

#[tokio::test]
async fn oversized_declared_length_closes_only_that_connection() {
    let running = run(Server::new(
        loopback().with_max_frame_length(1024),
        status_handler,
    ))
    .await;

    let mut steady = running.client().await;
    steady.send(&json!({"a": 1})).await.unwrap();

    let mut raw = TcpStream::connect(running.addr).await.unwrap();
    raw.write_all(&[0x7f, 0xff, 0xff, 0xff]).await.unwrap();
    wait_for_count(&running.server, 1).await;

    let response = steady.send(&json!({"a": 2})).await.unwrap();
    assert_eq!(response, json!({"status": true}));

    running.shutdown().await;
}

/// JSON with every byte flipped; unreadable by a plain JSON peer.
#[derive(Clone, Copy)]
struct InvertedJson;

impl ValueCodec for InvertedJson {
    fn name(&self) -> &'static str {
        "inverted-json"
    }

    fn encode(&self, value: &Value) -> Result<Bytes, CodecError> {
        let bytes = JsonCodec.encode(value)?;
        Ok(bytes.iter().map(|b| !b).collect())
    }

    fn decode(&self, payload: &[u8]) -> Result<Value, CodecError> {
        let plain: Vec<u8> = payload.iter().map(|b| !b).collect();
        JsonCodec.decode(&plain)
    }
}

#[tokio::test]
async fn custom_codec_is_used_on_both_ends() {
    let running = run(Server::new(loopback(), status_handler).with_codec(InvertedJson)).await;
    let port = running.addr.port();

    let mut client = Client::new().with_codec(InvertedJson);
    client.connect("127.0.0.1", port).await.unwrap();
    let response = client.send(&json!({"a": [1.5, "two", null]})).await.unwrap();
    assert_eq!(response, json!({"status": true}));

    let mut plain = Client::new();
    plain.connect("127.0.0.1", port).await.unwrap();
    let err = plain.send(&json!({"a": 1})).await.unwrap_err();
    assert!(err.is_no_response(), "unexpected error: {err}");

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_callbacks_do_not_stall_other_connections() {
    let started = Arc::new(AtomicUsize::new(0));
    let handler = {
        let started = Arc::clone(&started);
        move |request: Value| {
            if request["slow"] == json!(true) {
                started.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_secs(2));
            }
            json!({"status": true})
        }
    };
    let running = run(Server::new(loopback().with_backlog(16), handler)).await;
    let port = running.addr.port();

    let slow: Vec<_> = (0..8)
        .map(|_| {
            tokio::spawn(async move {
                let mut client = Client::new();
                client.connect("127.0.0.1", port).await.unwrap();
                client.send(&json!({"slow": true})).await.unwrap()
            })
        })
        .collect();
    tokio::time::timeout(TIMEOUT, async {
        while started.load(Ordering::SeqCst) < 8 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("slow callbacks never started");

    let began = Instant::now();
    let mut fast = running.client().await;
    let response = fast.send(&json!({"slow": false})).await.unwrap();
    assert_eq!(response, json!({"status": true}));
    assert!(
        began.elapsed() < Duration::from_secs(1),
        "fast request took {:?}",
        began.elapsed()
    );

    for task in slow {
        assert_eq!(task.await.unwrap(), json!({"status": true}));
    }
    running.shutdown().await;
}

#[derive(Default)]
struct SlowClose {
    closed: AtomicUsize,
}

impl LifecycleObserver for SlowClose {
    fn on_close(&self, _id: ConnectionId, _peer: SocketAddr, _reason: CloseReason, _requests: u64) {
        std::thread::sleep(Duration::from_millis(200));
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stops_both_wait_for_teardown() {
    let observer = Arc::new(SlowClose::default());
    let running = run(
        Server::new(loopback(), status_handler).with_shared_observer(observer.clone()),
    )
    .await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = running.client().await;
        client.send(&json!({"a": 1})).await.unwrap();
        clients.push(client);
    }

    let server = Arc::clone(&running.server);
    let (_, closed_after_second) = tokio::join!(server.stop(), async {
        server.stop().await;
        observer.closed.load(Ordering::SeqCst)
    });
    assert_eq!(closed_after_second, 3);
    assert_eq!(server.connection_count(), 0);

    running.shutdown().await;
}
