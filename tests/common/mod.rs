//! Common test utilities for podtunnel integration tests
//!
//! This module provides shared test infrastructure including:
//! - An in-process mock API server that upgrades `portforward` requests to
//!   SPDY and relays stream pairs to local listeners, like a kubelet would
//! - An echo listener standing in for the process inside the pod
//! - Dialer construction helpers

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use podtunnel::config::{ClusterConfig, DialerConfig};
use podtunnel::k8s::PortForwardDialer;
use podtunnel::spdy::{ConnectionOptions, SpdyConnection, SpdyStream};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Generous bound for anything that should happen promptly
pub const PROMPTLY: Duration = Duration::from_secs(5);

type PodPorts = HashMap<u16, SocketAddr>;

#[derive(Default)]
struct State {
    /// (namespace, pod) -> pod port -> local address serving it
    pods: Mutex<HashMap<(String, String), PodPorts>>,
    tunnels: Mutex<Vec<SpdyConnection>>,
    authorization: Mutex<Vec<Option<String>>>,
    request_ids: Mutex<Vec<String>>,
    upgrades: AtomicUsize,
    upgrade_delay: Mutex<Duration>,
}

/// A fake API server speaking the port-forward protocol
pub struct MockControlPlane {
    addr: SocketAddr,
    state: Arc<State>,
    shutdown: CancellationToken,
}

impl Drop for MockControlPlane {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl MockControlPlane {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());
        let shutdown = CancellationToken::new();

        let server_state = state.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (socket, _) = tokio::select! {
                    _ = stop.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(_) => return,
                    },
                };
                tokio::spawn(serve_connection(socket, server_state.clone()));
            }
        });

        Self { addr, state, shutdown }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Make `pod` in `namespace` exist, forwarding `port` to `backend`
    pub fn add_pod(&self, namespace: &str, pod: &str, port: u16, backend: SocketAddr) {
        self.state.pods.lock().unwrap()
            .entry((namespace.to_string(), pod.to_string()))
            .or_default()
            .insert(port, backend);
    }

    /// Number of successful upgrades served
    pub fn upgrade_count(&self) -> usize {
        self.state.upgrades.load(Ordering::SeqCst)
    }

    /// Delay every upgrade response
    pub fn set_upgrade_delay(&self, delay: Duration) {
        *self.state.upgrade_delay.lock().unwrap() = delay;
    }

    /// Authorization header of each upgrade request, in arrival order
    pub fn authorizations(&self) -> Vec<Option<String>> {
        self.state.authorization.lock().unwrap().clone()
    }

    /// `requestid` of every data stream seen, in arrival order
    pub fn request_ids(&self) -> Vec<String> {
        self.state.request_ids.lock().unwrap().clone()
    }

    /// Drop every established tunnel without GOAWAY
    pub fn sever_tunnels(&self) {
        for tunnel in self.state.tunnels.lock().unwrap().drain(..) {
            tunnel.abort();
        }
    }

    /// Dialer pointed at this control plane
    pub fn dialer(&self) -> PortForwardDialer {
        PortForwardDialer::new(self.dialer_config()).unwrap()
    }

    pub fn dialer_config(&self) -> DialerConfig {
        let cluster = ClusterConfig::new(&self.url()).unwrap().with_token("test-token");
        DialerConfig::new(cluster)
            .with_handshake_timeout(PROMPTLY)
            .with_stream_creation_timeout(PROMPTLY)
            .with_ping_interval(Some(Duration::from_millis(500)))
    }
}

/// Read the request head one byte at a time so no tunnel bytes are buffered
async fn read_head(socket: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let byte = socket.read_u8().await.ok()?;
        head.push(byte);
        if head.len() > 64 * 1024 {
            return None;
        }
    }
    String::from_utf8(head).ok()
}

fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

async fn respond(socket: &mut TcpStream, status: &str, content_type: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status, content_type, body.len(), body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

fn not_found(pod: &str) -> String {
    serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("pods \"{}\" not found", pod),
        "reason": "NotFound",
        "details": { "name": pod, "kind": "pods" },
        "code": 404
    })
    .to_string()
}

async fn serve_connection(mut socket: TcpStream, state: Arc<State>) {
    let Some(head) = read_head(&mut socket).await else {
        return;
    };
    let route = Regex::new(r"^POST /api/v1/namespaces/([^/ ]+)/pods/([^/ ]+)/portforward HTTP/1\.1$").unwrap();
    let request_line = head.lines().next().unwrap_or_default();
    let Some(captures) = route.captures(request_line) else {
        respond(&mut socket, "404 Not Found", "text/plain", "404 page not found\n").await;
        return;
    };
    let namespace = captures[1].to_string();
    let pod = captures[2].to_string();

    if header(&head, "X-Stream-Protocol-Version") != Some("portforward.k8s.io")
        || !header(&head, "Upgrade").is_some_and(|u| u.eq_ignore_ascii_case("SPDY/3.1"))
    {
        respond(&mut socket, "400 Bad Request", "text/plain", "unable to upgrade: missing upgrade headers\n").await;
        return;
    }
    state.authorization.lock().unwrap().push(header(&head, "Authorization").map(str::to_string));

    let ports = state.pods.lock().unwrap().get(&(namespace.clone(), pod.clone())).cloned();
    let Some(ports) = ports else {
        respond(&mut socket, "404 Not Found", "application/json", &not_found(&pod)).await;
        return;
    };

    let delay = *state.upgrade_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let switching = "HTTP/1.1 101 Switching Protocols\r\n\
        Connection: Upgrade\r\n\
        Upgrade: SPDY/3.1\r\n\
        X-Stream-Protocol-Version: portforward.k8s.io\r\n\r\n";
    if socket.write_all(switching.as_bytes()).await.is_err() {
        return;
    }
    state.upgrades.fetch_add(1, Ordering::SeqCst);

    let tunnel = SpdyConnection::new(socket, ConnectionOptions::server());
    state.tunnels.lock().unwrap().push(tunnel.clone());

    // requestid -> (error stream, data stream)
    let mut pending: HashMap<String, (Option<SpdyStream>, Option<SpdyStream>)> = HashMap::new();
    while let Some(stream) = tunnel.accept().await {
        let get = |name: &str| {
            stream.headers().get(name).and_then(|v| v.to_str().ok()).unwrap_or_default().to_string()
        };
        let (kind, request_id, port) = (get("streamtype"), get("requestid"), get("port"));

        let entry = pending.entry(request_id.clone()).or_default();
        match kind.as_str() {
            "error" => entry.0 = Some(stream),
            "data" => {
                state.request_ids.lock().unwrap().push(request_id.clone());
                entry.1 = Some(stream);
            }
            _ => continue,
        }
        if entry.0.is_some() && entry.1.is_some() {
            if let Some((Some(error), Some(data))) = pending.remove(&request_id) {
                let port: u16 = port.parse().unwrap_or(0);
                let backend = ports.get(&port).copied();
                tokio::spawn(forward_pair(error, data, pod.clone(), port, backend));
            }
        }
    }
}

/// What the kubelet does with one stream pair
async fn forward_pair(mut error: SpdyStream, mut data: SpdyStream, pod: String, port: u16, backend: Option<SocketAddr>) {
    let upstream = match backend {
        Some(addr) => TcpStream::connect(addr).await.ok(),
        None => None,
    };
    let Some(mut upstream) = upstream else {
        let message = format!(
            "error forwarding port {} to pod {}, uid : failed to connect to localhost:{}: connection refused",
            port, pod, port
        );
        let _ = error.write_all(message.as_bytes()).await;
        let _ = error.shutdown().await;
        let _ = data.shutdown().await;
        return;
    };

    let _ = tokio::io::copy_bidirectional(&mut data, &mut upstream).await;
    let _ = error.shutdown().await;
}

/// A listener echoing every byte back until the peer half-closes
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// A listener that writes as fast as the socket accepts and counts the bytes
pub async fn spawn_firehose() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let written = Arc::new(AtomicUsize::new(0));
    let counter = written.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let chunk = vec![0x5a; 64 * 1024];
                while socket.write_all(&chunk).await.is_ok() {
                    counter.fetch_add(chunk.len(), Ordering::SeqCst);
                }
            });
        }
    });
    (addr, written)
}

/// A listener that accepts connections and never reads from them
pub async fn spawn_sink() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// Control plane with `pods/demo.default` whose port 8080 echoes
pub async fn echo_cluster() -> MockControlPlane {
    let mock = MockControlPlane::start().await;
    let echo = spawn_echo().await;
    mock.add_pod("default", "demo", 8080, echo);
    mock
}

/// Poll `condition` until it holds or [`PROMPTLY`] elapses
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + PROMPTLY;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
