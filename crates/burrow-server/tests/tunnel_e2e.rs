//! End-to-end: public client -> tunnel server -> tunnel socket

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use burrow_proto::{TunnelInfo, INVALID_ID_MESSAGE};
use burrow_server::{ServerConfig, TunnelServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn start_server() -> (SocketAddr, CancellationToken) {
    let config = ServerConfig {
        bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        broker_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        domains: vec!["example.com".to_string()],
        ..Default::default()
    };

    let server = TunnelServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    (addr, shutdown)
}

/// Send one request and read until the server closes
async fn exchange(addr: SocketAddr, request: &str) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    (head, raw[split + 4..].to_vec())
}

async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        assert_eq!(stream.read(&mut byte).await.unwrap(), 1, "closed mid-head");
        buf.push(byte[0]);
    }
    buf
}

async fn create_tunnel(addr: SocketAddr, id: &str) -> TunnelInfo {
    let (head, body) = exchange(
        addr,
        &format!("GET /{} HTTP/1.1\r\nHost: example.com\r\n\r\n", id),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected: {}", head);
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_invalid_subdomain_rejected() {
    let (addr, _shutdown) = start_server().await;

    let (head, body) = exchange(addr, "GET /abc HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.1 403"));

    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, serde_json::json!({ "message": INVALID_ID_MESSAGE }));
}

#[tokio::test]
async fn test_tunnel_status_after_creation() {
    let (addr, _shutdown) = start_server().await;
    let status = "GET /api/tunnels/abcd/status HTTP/1.1\r\nHost: example.com\r\n\r\n";

    let (head, _) = exchange(addr, status).await;
    assert!(head.starts_with("HTTP/1.1 404"));

    let info = create_tunnel(addr, "abcd").await;
    assert_eq!(info.id, "abcd");
    assert_eq!(info.url, "http://abcd.example.com");

    let (head, body) = exchange(addr, status).await;
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, br#"{"connected_sockets":0}"#.to_vec());
}

#[tokio::test]
async fn test_request_reaches_tunnel_socket() {
    let (addr, _shutdown) = start_server().await;
    let info = create_tunnel(addr, "e2e-test").await;

    let mut tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();

    let public = tokio::spawn(exchange(
        addr,
        "POST /hello?x=1 HTTP/1.1\r\nHost: e2e-test.example.com\r\nX-Trace: abc\r\nContent-Length: 4\r\n\r\nping",
    ));

    let raw = read_head(&mut tunnel).await;
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    let status = request.parse(&raw).unwrap();
    assert!(status.is_complete());
    assert_eq!(request.method, Some("POST"));
    assert_eq!(request.path, Some("/hello?x=1"));
    assert_eq!(request.version, Some(1));
    assert!(request
        .headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("x-trace") && h.value == b"abc"));

    let mut body = [0u8; 4];
    tunnel.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"ping");

    tunnel
        .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 4\r\n\r\npong")
        .await
        .unwrap();

    let (head, body) = timeout(Duration::from_secs(5), public).await.unwrap().unwrap();
    assert!(head.starts_with("HTTP/1.1 201"));
    assert_eq!(body, b"pong".to_vec());
}

#[tokio::test]
async fn test_upgrade_preserves_raw_headers() {
    let (addr, _shutdown) = start_server().await;
    let info = create_tunnel(addr, "ws-test").await;

    let mut tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();

    let request = "GET /socket HTTP/1.1\r\nhost: ws-test.example.com\r\nUpgrade: websocket\r\nconnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
    let mut public = TcpStream::connect(addr).await.unwrap();
    public.write_all(request.as_bytes()).await.unwrap();

    let forwarded = read_head(&mut tunnel).await;
    assert_eq!(String::from_utf8(forwarded).unwrap(), request);

    tunnel
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n")
        .await
        .unwrap();
    let answer = read_head(&mut public).await;
    assert!(answer.starts_with(b"HTTP/1.1 101"));

    public.write_all(b"frame").await.unwrap();
    let mut frame = [0u8; 5];
    tunnel.read_exact(&mut frame).await.unwrap();
    assert_eq!(&frame, b"frame");

    tunnel.write_all(b"reply").await.unwrap();
    let mut reply = [0u8; 5];
    public.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"reply");
}

#[tokio::test]
async fn test_tunnel_closed_when_client_leaves() {
    let (addr, _shutdown) = start_server().await;
    let info = create_tunnel(addr, "leaving").await;

    let tunnel = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(tunnel);

    // Default one second grace period
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (head, _) = exchange(
            addr,
            "GET /api/tunnels/leaving/status HTTP/1.1\r\nHost: example.com\r\n\r\n",
        )
        .await;
        if head.starts_with("HTTP/1.1 404") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "tunnel never removed");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
