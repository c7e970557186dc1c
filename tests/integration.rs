//! Integration tests for A3S FaaS
//!
//! These tests run a fake runner and the real gate on TCP listeners and
//! drive the management API and `/call/{id}` end to end over raw HTTP.

use a3s_faas::config::GateConfig;
use a3s_faas::dispatch::HttpRunner;
use a3s_faas::scaling::orchestrator::MockOrchestrator;
use a3s_faas::Gate;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Read one HTTP/1.1 request (headers plus Content-Length body)
async fn read_request(stream: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let len = head
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    k.eq_ignore_ascii_case("content-length")
                        .then(|| v.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            let mut body = buf[end + 4..].to_vec();
            while body.len() < len {
                let n = stream.read(&mut chunk).await.ok()?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..n]);
            }
            return Some((head, body));
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Fake runner: greets `args.name`, answers -404 on path `/fail`
async fn spawn_runner() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let Some((_, body)) = read_request(&mut stream).await else {
                    return;
                };
                let req: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
                let result = if req["path"] == "/fail" {
                    serde_json::json!({ "returnCode": -404, "returnValue": "missing" })
                } else {
                    let name = req["args"]["name"].as_str().unwrap_or("nobody");
                    serde_json::json!({
                        "returnCode": 0,
                        "returnValue": format!("hello {}", name),
                        "runTimeMicros": 250,
                    })
                };
                let body = result.to_string();
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

struct Reply {
    status: u16,
    head: String,
    body: String,
}

impl Reply {
    fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn send(addr: SocketAddr, method: &str, path: &str, headers: &[(&str, &str)], body: &str) -> Reply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut req = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Length: {}\r\n",
        method,
        path,
        addr,
        body.len()
    );
    for (k, v) in headers {
        req.push_str(&format!("{}: {}\r\n", k, v));
    }
    req.push_str("\r\n");
    req.push_str(body);
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut raw))
        .await
        .expect("response timed out")
        .unwrap();
    let raw = String::from_utf8_lossy(&raw).to_string();
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Reply {
        status,
        head: head.to_string(),
        body: body.to_string(),
    }
}

/// Gate on an ephemeral port whose deployments all resolve to the fake runner
async fn start_gate(config: GateConfig) -> (Arc<Gate>, SocketAddr) {
    let runner_addr = spawn_runner().await;
    let orchestrator = Arc::new(MockOrchestrator::new());
    orchestrator.set_address(runner_addr.to_string());

    let gate = Arc::new(
        Gate::with_parts(
            config,
            orchestrator,
            Arc::new(HttpRunner::new("/v1/run", 8687)),
        )
        .unwrap(),
    );
    gate.start().await.unwrap();
    let addr = gate.local_addr().unwrap();
    (gate, addr)
}

fn test_config() -> GateConfig {
    GateConfig {
        listen: "127.0.0.1:0".to_string(),
        ..GateConfig::default()
    }
}

/// Add a python function and report its pods ready; returns the cookie
async fn deploy(addr: SocketAddr, name: &str) -> String {
    let spec = serde_json::json!({
        "tenant": "acme",
        "project": "shop",
        "name": name,
        "lang": "python",
        "version": "v1",
    });
    let reply = send(addr, "POST", "/v1/functions", &[], &spec.to_string()).await;
    assert_eq!(reply.status, 201, "{}", reply.body);
    let cookie = reply.json()["cookie"].as_str().unwrap().to_string();

    let event = serde_json::json!({
        "deployment": { "cookie": cookie, "version": "v1", "build": false },
        "ready": true,
    });
    let reply = send(addr, "POST", "/v1/pods", &[], &event.to_string()).await;
    assert_eq!(reply.status, 202);

    for _ in 0..50 {
        let reply = send(addr, "GET", &format!("/v1/functions/{}", cookie), &[], "").await;
        if reply.json()["state"] == "ready" {
            return cookie;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("function {} never became ready", cookie);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_call_reaches_runner() {
    let (gate, addr) = start_gate(test_config()).await;
    let cookie = deploy(addr, "greeter").await;

    let reply = send(addr, "GET", &format!("/call/{}?name=world", cookie), &[], "").await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "hello world");

    let stats = send(addr, "GET", &format!("/v1/functions/{}/stats", cookie), &[], "").await;
    assert_eq!(stats.status, 200);
    assert_eq!(stats.json()["called"], 1);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_runner_failure_passes_through() {
    let (gate, addr) = start_gate(test_config()).await;
    let cookie = deploy(addr, "failing").await;

    let reply = send(addr, "POST", &format!("/call/{}/fail", cookie), &[], "").await;
    assert_eq!(reply.status, 404);
    assert_eq!(reply.body, "missing");

    gate.shutdown().await;
}

#[tokio::test]
async fn test_unknown_function_is_404() {
    let (gate, addr) = start_gate(test_config()).await;

    let reply = send(addr, "GET", "/call/0123456789abcdef", &[], "").await;
    assert_eq!(reply.status, 404);
    assert_eq!(reply.json()["code"], "not_found");

    gate.shutdown().await;
}

#[tokio::test]
async fn test_cors_preflight_and_headers() {
    let (gate, addr) = start_gate(test_config()).await;
    let cookie = deploy(addr, "cors").await;

    let reply = send(
        addr,
        "OPTIONS",
        &format!("/call/{}", cookie),
        &[
            ("Origin", "https://app.example.com"),
            ("Access-Control-Request-Method", "POST"),
        ],
        "",
    )
    .await;
    assert_eq!(reply.status, 204);
    assert!(reply
        .head
        .to_ascii_lowercase()
        .contains("access-control-allow-origin: *"));

    let reply = send(
        addr,
        "GET",
        &format!("/call/{}", cookie),
        &[("Origin", "https://app.example.com")],
        "",
    )
    .await;
    assert_eq!(reply.status, 200);
    assert!(reply
        .head
        .to_ascii_lowercase()
        .contains("access-control-allow-origin: *"));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_global_rate_limit_from_settings() {
    let (gate, addr) = start_gate(test_config()).await;
    let cookie = deploy(addr, "limited").await;

    let reply = send(addr, "PUT", "/v1/settings/global_rate", &[], r#"{"value": 1}"#).await;
    assert_eq!(reply.status, 200);

    let first = send(addr, "GET", &format!("/call/{}", cookie), &[], "").await;
    let second = send(addr, "GET", &format!("/call/{}", cookie), &[], "").await;
    assert_eq!(first.status, 200);
    assert_eq!(second.status, 429);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_deactivated_function_is_unavailable() {
    let (gate, addr) = start_gate(test_config()).await;
    let cookie = deploy(addr, "sleepy").await;

    let reply = send(addr, "POST", &format!("/v1/functions/{}/deactivate", cookie), &[], "").await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json()["state"], "deactivated");

    let reply = send(addr, "GET", &format!("/call/{}", cookie), &[], "").await;
    assert_eq!(reply.status, 503);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_health_and_metrics() {
    let (gate, addr) = start_gate(test_config()).await;
    let cookie = deploy(addr, "observed").await;
    send(addr, "GET", &format!("/call/{}", cookie), &[], "").await;

    let health = send(addr, "GET", "/health", &[], "").await;
    assert_eq!(health.status, 200);
    assert_eq!(health.json()["state"], "Running");
    assert_eq!(health.json()["total_calls"], 1);

    let metrics = send(addr, "GET", "/metrics", &[], "").await;
    assert_eq!(metrics.status, 200);
    assert!(metrics.body.contains("faas_calls_total 1"));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_remove_function() {
    let (gate, addr) = start_gate(test_config()).await;
    let cookie = deploy(addr, "doomed").await;

    let reply = send(addr, "DELETE", &format!("/v1/functions/{}", cookie), &[], "").await;
    assert_eq!(reply.status, 204);

    let reply = send(addr, "GET", &format!("/v1/functions/{}", cookie), &[], "").await;
    assert_eq!(reply.status, 404);

    gate.shutdown().await;
}
