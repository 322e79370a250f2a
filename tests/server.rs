use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Empty};
use hyper::header::{HeaderMap, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;

use wheelhouse::{
    Credentials, Gateway, MockBridge, MockTransport, Pipe, PipeTransport, Session, SessionConfig,
    TlsConfig,
};

fn static_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("test.html"),
        "<html><body>A file</body></html>\n",
    )
    .unwrap();
    dir
}

async fn start(gateway: Gateway, addr: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    tokio::spawn(gateway.run());
    for _ in 0..200 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("gateway never started listening on {addr}");
}

async fn http_get(addr: &str, path: &str) -> hyper::Response<hyper::body::Incoming> {
    http_request(addr, Method::GET, path).await
}

async fn http_request(
    addr: &str,
    method: Method,
    path: &str,
) -> hyper::Response<hyper::body::Incoming> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = Request::builder()
        .method(method)
        .uri(path)
        .header(hyper::header::HOST, addr)
        .body(Empty::<Bytes>::new())
        .unwrap();
    sender.send_request(request).await.unwrap()
}

/// Writes a raw request and returns everything the server answers.
async fn raw_request(addr: &str, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

fn cat_session() -> Session {
    let transport = PipeTransport::new(Pipe::spawn(&["cat".to_string()], None, None));
    Session::new(
        Credentials::new("user", "password"),
        transport,
        SessionConfig::new(),
    )
}

#[tokio::test]
async fn it_serves_static_files() {
    let root = static_root();
    let addr = "127.0.0.1:7941";
    start(
        Gateway::new().bind(addr).with_document_root(root.path()),
        addr,
    )
    .await;

    let response = http_get(addr, "/test.html").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/html");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"<html><body>A file</body></html>\n");
}

#[tokio::test]
async fn it_serves_chunked_responses() {
    let root = static_root();
    let addr = "127.0.0.1:7942";
    start(
        Gateway::new().bind(addr).with_document_root(root.path()),
        addr,
    )
    .await;

    let response = raw_request(
        addr,
        "GET /test.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {response}");
    assert!(response.contains("transfer-encoding: chunked") ||
            response.contains("Transfer-Encoding: chunked"), "got: {response}");
    assert!(response.contains("<html><body>A file</body></html>\n"));
}

#[tokio::test]
async fn it_answers_not_found_outside_the_roots() {
    let root = static_root();
    let addr = "127.0.0.1:7943";
    start(
        Gateway::new().bind(addr).with_document_root(root.path()),
        addr,
    )
    .await;

    let response = http_get(addr, "/not-present.html").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(
        &body[..],
        b"<html><head><title>404 Not Found</title></head><body>Not Found</body></html>"
    );
}

#[tokio::test]
async fn it_answers_not_found_for_traversal_attempts() {
    // A secret right next to the served root.
    let outside = tempfile::tempdir().unwrap();
    std::fs::write(outside.path().join("secret.txt"), "top secret").unwrap();
    let root = outside.path().join("root");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("test.html"), "fine").unwrap();

    let addr = "127.0.0.1:7944";
    start(Gateway::new().bind(addr).with_document_root(&root), addr).await;

    let response = raw_request(
        addr,
        "GET /../secret.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.contains(" 404 "), "got: {response}");
    assert!(!response.contains("top secret"));
}

#[tokio::test]
async fn it_rejects_methods_other_than_get() {
    let addr = "127.0.0.1:7945";
    start(Gateway::new().bind(addr), addr).await;

    let response = http_request(addr, Method::POST, "/").await;

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn it_requires_a_host_header() {
    let addr = "127.0.0.1:7946";
    start(Gateway::new().bind(addr), addr).await;

    let response = raw_request(addr, "GET / HTTP/1.0\r\n\r\n").await;

    assert!(response.contains(" 400 "), "got: {response}");
}

#[tokio::test]
async fn it_rejects_requests_with_bodies() {
    let addr = "127.0.0.1:7947";
    start(Gateway::new().bind(addr), addr).await;

    let response = raw_request(
        addr,
        "GET / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
    )
    .await;

    assert!(response.contains(" 413 "), "got: {response}");
}

#[tokio::test]
async fn it_rejects_upgrades_from_a_bad_origin() {
    let session = cat_session();
    let addr = "127.0.0.1:7948";
    start(
        Gateway::new()
            .bind(addr)
            .with_sessions(move |_: &HeaderMap| Some(session.clone())),
        addr,
    )
    .await;

    let response = raw_request(
        addr,
        concat!(
            "GET /cockpit/socket HTTP/1.1\r\n",
            "Host: 127.0.0.1:7948\r\n",
            "Origin: http://another-place.com\r\n",
            "Upgrade: websocket\r\n",
            "Connection: Upgrade, close\r\n",
            "Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
            "Sec-WebSocket-Version: 13\r\n",
            "\r\n",
        ),
    )
    .await;

    assert!(response.contains(" 403 "), "got: {response}");
}

#[tokio::test]
async fn it_multiplexes_websockets_through_the_gateway() {
    let session = cat_session();
    let addr = "127.0.0.1:7949";
    start(
        Gateway::new()
            .bind(addr)
            .with_sessions(move |_: &HeaderMap| Some(session.clone())),
        addr,
    )
    .await;

    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/cockpit/socket"))
        .await
        .unwrap();

    client
        .send(Message::text("\n{\"command\":\"init\",\"version\":0}"))
        .await
        .unwrap();
    client
        .send(Message::text(
            "\n{\"command\":\"open\",\"channel\":\"4\",\"payload\":\"test-text\"}",
        ))
        .await
        .unwrap();

    // The session's init, then the echoed open.
    let init = client.next().await.unwrap().unwrap().into_text().unwrap();
    let value: Value = serde_json::from_str(init.split_once('\n').unwrap().1).unwrap();
    assert_eq!(value, json!({"command": "init", "version": 0}));

    let open = client.next().await.unwrap().unwrap().into_text().unwrap();
    let value: Value = serde_json::from_str(open.split_once('\n').unwrap().1).unwrap();
    assert_eq!(value["command"], "open");

    client.send(Message::text("4\nthe message")).await.unwrap();
    let echoed = client.next().await.unwrap().unwrap().into_text().unwrap();
    assert_eq!(echoed.as_str(), "4\nthe message");
}

#[tokio::test]
async fn it_closes_unauthenticated_sockets_with_no_session() {
    let addr = "127.0.0.1:7950";
    start(Gateway::new().bind(addr), addr).await;

    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/cockpit/socket"))
        .await
        .unwrap();

    let message = client.next().await.unwrap().unwrap().into_text().unwrap();
    let value: Value = serde_json::from_str(message.split_once('\n').unwrap().1).unwrap();
    assert_eq!(value["command"], "close");
    assert_eq!(value["channel"], "4");
    assert_eq!(value["reason"], "no-session");
}

#[tokio::test]
async fn it_serves_resources_through_the_session() {
    let (transport, mut bridge) = MockTransport::pair("mock");
    let session = Session::new(
        Credentials::new("user", "password"),
        transport,
        SessionConfig::new(),
    );
    let script = tokio::spawn(async move {
        script_resource_bridge(&mut bridge).await;
        bridge
    });

    let addr = "127.0.0.1:7951";
    start(
        Gateway::new()
            .bind(addr)
            .with_sessions(move |_: &HeaderMap| Some(session.clone())),
        addr,
    )
    .await;

    let response = http_get(addr, "/cockpit/another/test.html").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/html");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"<html>from the bridge</html>\n");
    script.await.unwrap();
}

async fn script_resource_bridge(bridge: &mut MockBridge) {
    let init = bridge.next_sent().await.unwrap();
    assert!(init.channel.is_none());
    bridge.send(None, Bytes::from_static(br#"{"command":"init","version":0}"#));

    let open = bridge.next_sent().await.unwrap();
    let value: Value = serde_json::from_slice(&open.payload).unwrap();
    assert_eq!(value["command"], "open");
    assert_eq!(value["payload"], "resource1");

    let channel = value["channel"].as_str().unwrap().to_owned();
    bridge.send(Some(&channel), Bytes::from_static(b"<html>from the bridge</html>\n"));
    bridge.send(
        None,
        Bytes::from(format!(r#"{{"command":"close","channel":"{channel}"}}"#)),
    );
}

#[tokio::test]
async fn it_answers_unauthorized_resources_without_a_session() {
    let addr = "127.0.0.1:7952";
    start(Gateway::new().bind(addr), addr).await;

    let response = http_get(addr, "/cockpit/another/test.html").await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn it_serves_loopback_plaintext_with_tls_configured() {
    let root = static_root();
    let addr = "127.0.0.1:7953";
    start(
        Gateway::new()
            .bind(addr)
            .with_tls(TlsConfig::new("tests/data/cert.pem", "tests/data/key.pem"))
            .with_document_root(root.path()),
        addr,
    )
    .await;

    // Loopback peers are not redirected; the request is served in clear.
    let response = http_get(addr, "/test.html").await;

    assert_eq!(response.status(), StatusCode::OK);
}
