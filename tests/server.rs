mod common;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use satchel::{AppConfig, Error, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use common::{Blog, app, app_with};

async fn read_all(mut stream: TcpStream) -> String {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8(out).unwrap()
}

async fn roundtrip(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    read_all(stream).await
}

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<(), Error>>,
}

impl Running {
    async fn start(app: satchel::App) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::from_listener(listener);
        let addr = server.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.serve_with_shutdown(app, async move {
            let _ = stopped.await;
        }));
        Self { addr, stop, task }
    }

    async fn stop(self) {
        self.stop.send(()).unwrap();
        self.task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn serves_over_a_socket_and_closes_bundles_on_shutdown() {
    let blog = Blog::default();
    let server = Running::start(app(&blog)).await;
    let addr = server.addr;

    let res = roundtrip(addr, "GET /posts/7 HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n").await;
    assert!(res.starts_with("HTTP/1.1 200 OK"), "{res}");
    assert!(res.ends_with(r#"{"id":"7"}"#), "{res}");

    let res = roundtrip(addr, "GET /away HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n").await;
    assert!(res.starts_with("HTTP/1.1 302 Found"), "{res}");
    assert!(res.to_ascii_lowercase().contains("location: /login"), "{res}");

    let res = roundtrip(addr, "GET /missing HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n").await;
    assert!(res.starts_with("HTTP/1.1 404 Not Found"), "{res}");

    server.stop().await;
    assert!(blog.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let config = AppConfig { max_body_bytes: 16, ..AppConfig::default() };
    let server = Running::start(app_with(config, &Blog::default())).await;

    let body = "x".repeat(100);
    let raw = format!(
        "POST /posts/1 HTTP/1.1\r\nhost: localhost\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    let res = roundtrip(server.addr, &raw).await;
    assert!(res.starts_with("HTTP/1.1 413 Payload Too Large"), "{res}");

    server.stop().await;
}

#[tokio::test]
async fn stalled_body_times_out() {
    let config = AppConfig { read_timeout_secs: 1, ..AppConfig::default() };
    let server = Running::start(app_with(config, &Blog::default())).await;

    // Announces ten bytes, sends two, then waits.
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"POST /posts/1 HTTP/1.1\r\nhost: localhost\r\ncontent-length: 10\r\nconnection: close\r\n\r\nab")
        .await
        .unwrap();
    let res = read_all(stream).await;
    assert!(res.starts_with("HTTP/1.1 408 Request Timeout"), "{res}");

    server.stop().await;
}

#[tokio::test]
async fn slow_action_times_out() {
    let config = AppConfig { write_timeout_secs: 1, ..AppConfig::default() };
    let server = Running::start(app_with(config, &Blog::default())).await;

    let res = roundtrip(server.addr, "GET /slow HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n").await;
    assert!(res.starts_with("HTTP/1.1 503 Service Unavailable"), "{res}");

    server.stop().await;
}
