//! Shared fixtures for proxy tests: a configurable proxy instance, a
//! recording upstream, and raw-socket HTTP helpers for asserting on
//! exact wire behavior.

#![allow(dead_code)]

use bytes::Bytes;
use ctxforge_forwarder::{Config, LogFormat, Server};
use ctxforge_rules::RuleSet;
use http::{HeaderMap, Response};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::rt::TokioIo;
use std::{convert::Infallible, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

pub struct TestProxy {
    pub addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    signal: drain::Signal,
}

impl TestProxy {
    /// Signals shutdown and waits for in-flight connections to drain.
    pub async fn shutdown(self) {
        self.signal.drain().await;
    }
}

pub fn test_config(target: SocketAddr, rules_json: &str) -> Config {
    Config {
        rules: RuleSet::from_inputs(None, Some(rules_json)).expect("test rules must parse"),
        target_authority: format!("127.0.0.1:{}", target.port())
            .parse()
            .expect("test authority must parse"),
        proxy_port: 0,
        metrics_port: 0,
        read_timeout: Duration::from_secs(15),
        write_timeout: Duration::from_secs(15),
        idle_timeout: Duration::from_secs(60),
        read_header_timeout: Duration::from_secs(5),
        target_dial_timeout: Duration::from_millis(500),
        rate_limit_enabled: false,
        rate_limit_rps: 1000.0,
        rate_limit_burst: 100,
        log_level: "info".to_string(),
        log_format: LogFormat::Console,
    }
}

pub async fn spawn_proxy(target: SocketAddr, rules_json: &str) -> TestProxy {
    spawn_proxy_with(test_config(target, rules_json)).await
}

pub async fn spawn_proxy_with(cfg: Config) -> TestProxy {
    let server = Server::bind(cfg).await.expect("proxy must bind");
    let addr = SocketAddr::from(([127, 0, 0, 1], server.proxy_addr().port()));
    let metrics_addr = SocketAddr::from(([127, 0, 0, 1], server.metrics_addr().port()));
    let signal = server.spawn();
    TestProxy {
        addr,
        metrics_addr,
        signal,
    }
}

/// One request as observed by the upstream application.
#[derive(Debug)]
pub struct Seen {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl Seen {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub struct Upstream {
    pub addr: SocketAddr,
    pub requests: mpsc::UnboundedReceiver<Seen>,
}

impl Upstream {
    pub async fn next(&mut self) -> Seen {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("timed out waiting for an upstream request")
            .expect("upstream channel closed")
    }
}

/// Spawns an HTTP upstream that records every request it sees and
/// responds 200 "OK".
pub async fn spawn_upstream() -> Upstream {
    spawn_upstream_responding(http::StatusCode::OK, "OK", Duration::ZERO).await
}

/// Spawns an upstream with a fixed response status/body, optionally
/// delaying each response.
pub async fn spawn_upstream_responding(
    status: http::StatusCode,
    body: &'static str,
    delay: Duration,
) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("upstream must bind");
    let addr = listener.local_addr().expect("upstream must have an address");
    let (tx, requests) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _peer)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: hyper::Request<Incoming>| {
                    let tx = tx.clone();
                    async move {
                        let (parts, req_body) = req.into_parts();
                        let collected = req_body
                            .collect()
                            .await
                            .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
                            .unwrap_or_default();
                        let _ = tx.send(Seen {
                            method: parts.method.to_string(),
                            path: parts.uri.path().to_string(),
                            headers: parts.headers.clone(),
                            body: collected,
                        });
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from_static(body.as_bytes())))
                                .expect("upstream response must be valid"),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    Upstream { addr, requests }
}

/// Spawns a raw TCP upstream that records the verbatim request head (for
/// asserting exact on-the-wire header casing) and replies 200.
pub async fn spawn_raw_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("upstream must bind");
    let addr = listener.local_addr().expect("upstream must have an address");
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _peer)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                    if let Some(end) = find(&buf, b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&buf[..end + 4]).into_owned();
                        let _ = tx.send(head);
                        let _ = stream
                            .write_all(
                                b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nOK",
                            )
                            .await;
                        return;
                    }
                }
            });
        }
    });

    (addr, rx)
}

/// Spawns a TCP echo server (stands in for an opaque TLS backend behind
/// CONNECT).
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("echo server must bind");
    let addr = listener.local_addr().expect("echo server must have an address");

    tokio::spawn(async move {
        while let Ok((mut stream, _peer)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0)
}

/// A raw HTTP/1.1 client over one TCP connection. Keeps a persistent
/// read buffer so pipelined responses are consumed one at a time.
pub struct RawClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("client must connect");
        stream.set_nodelay(true).expect("nodelay");
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Writes one request with the given request target (origin-form
    /// path, absolute-form URL, or CONNECT authority).
    pub async fn send(&mut self, method: &str, target: &str, headers: &[(&str, &str)]) {
        let mut req = format!("{method} {target} HTTP/1.1\r\n");
        if !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("host")) {
            req.push_str("Host: app.test\r\n");
        }
        for (name, value) in headers {
            req.push_str(&format!("{name}: {value}\r\n"));
        }
        req.push_str("\r\n");
        self.stream
            .write_all(req.as_bytes())
            .await
            .expect("failed to write request");
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream
            .write_all(bytes)
            .await
            .expect("failed to write");
    }

    /// Reads exactly one response (head plus content-length body).
    pub async fn read_response(&mut self) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut chunk = [0u8; 4096];

        loop {
            if let Some(end) = find(&self.buf, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&self.buf[..end + 4]).into_owned();
                let want = end + 4 + content_length(&head);
                while self.buf.len() < want {
                    let n = tokio::time::timeout_at(deadline, self.stream.read(&mut chunk))
                        .await
                        .expect("timed out reading response body")
                        .expect("failed to read response body");
                    assert!(n > 0, "connection closed mid-body");
                    self.buf.extend_from_slice(&chunk[..n]);
                }
                let rsp = String::from_utf8_lossy(&self.buf[..want]).into_owned();
                self.buf.drain(..want);
                return rsp;
            }

            let n = tokio::time::timeout_at(deadline, self.stream.read(&mut chunk))
                .await
                .expect("timed out reading response head")
                .expect("failed to read response head");
            assert!(n > 0, "connection closed before response head");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Reads raw bytes until `want` bytes arrive (for tunneled data).
    pub async fn read_exact_raw(&mut self, want: usize) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut chunk = [0u8; 4096];
        while self.buf.len() < want {
            let n = tokio::time::timeout_at(deadline, self.stream.read(&mut chunk))
                .await
                .expect("timed out reading tunneled bytes")
                .expect("failed to read tunneled bytes");
            assert!(n > 0, "connection closed mid-tunnel");
            self.buf.extend_from_slice(&chunk[..n]);
        }
        self.buf.drain(..want).collect()
    }
}
