//! In-process HTTP/1.1 test server with httpbin-style routes.
//!
//! The server speaks just enough HTTP/1.1 for the client's integration
//! tests: keep-alive request loops, fixed and chunked response bodies, and
//! a handful of deliberately pathological routes (conflicting framing
//! headers, oversized heads, interim responses).
//!
//! Routes:
//!
//! - `GET /get`, `GET /headers` — echo query arguments and headers as JSON
//! - `POST /post` — echo form fields, raw data and headers as JSON
//! - `/redirect-to?url=U[&status_code=N]`, `/redirect/{n}`,
//!   `/absolute-redirect/{n}` — redirect chains ending at `/get`
//! - `/status/{code}` — empty response with the given status
//! - `/image` — a small PNG with `Content-Type: image/png`
//! - `/drip?numbytes=N&chunks=C&delay_ms=D` — slow chunked body
//! - `/cookies`, `/cookies/set?name=value` — cookie echo and set+redirect
//! - `/close` — response with `Connection: close`
//! - `/until-close` — body framed by connection shutdown
//! - `/interim` — a `103` interim response before the final `200`
//! - `/both-framing` — both `Content-Length` and `Transfer-Encoding`
//! - `/big-head` — a response head larger than any sane cap

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A 1x1 transparent PNG.
const PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x62, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

#[derive(Default)]
struct Stats {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

/// Handle to a spawned mock server; shuts down on drop.
pub struct MockServer {
    addr: SocketAddr,
    host: &'static str,
    scheme: &'static str,
    stats: Arc<Stats>,
    task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    /// Spawns a plaintext server on an ephemeral localhost port.
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let stats = Arc::new(Stats::default());
        let loop_stats = stats.clone();

        let task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let stats = loop_stats.clone();
                tokio::spawn(async move {
                    track(&stats, serve_plain(socket)).await;
                });
            }
        });

        Self {
            addr,
            host: "127.0.0.1",
            scheme: "http",
            stats,
            task,
        }
    }

    /// Spawns a TLS server with a fresh self-signed certificate for
    /// `localhost`; returns the certificate (DER) so clients can trust it.
    pub async fn spawn_tls() -> (Self, Vec<u8>) {
        let certified_key = rcgen::generate_simple_self_signed(vec![
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ])
        .expect("generate certificate");
        let cert_der = certified_key.cert.der().to_vec();
        let key_der = certified_key.signing_key.serialize_der();

        let certs = vec![rustls::pki_types::CertificateDer::from(cert_der.clone())];
        let key = rustls::pki_types::PrivateKeyDer::Pkcs8(key_der.into());
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .expect("server tls config");
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let stats = Arc::new(Stats::default());
        let loop_stats = stats.clone();

        let task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let stats = loop_stats.clone();
                tokio::spawn(async move {
                    track(&stats, async move {
                        if let Ok(stream) = acceptor.accept(socket).await {
                            serve(stream).await;
                        }
                    })
                    .await;
                });
            }
        });

        (
            Self {
                addr,
                host: "localhost",
                scheme: "https",
                stats,
                task,
            },
            cert_der,
        )
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL for `path` (which must start with `/`).
    pub fn url(&self, path: &str) -> String {
        format!("{}://{}:{}{path}", self.scheme, self.host, self.addr.port())
    }

    /// Highest number of simultaneously open connections seen so far.
    pub fn peak_connections(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    /// Total connections accepted so far.
    pub fn total_connections(&self) -> usize {
        self.stats.total.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn track(stats: &Stats, fut: impl std::future::Future<Output = ()>) {
    let current = stats.current.fetch_add(1, Ordering::SeqCst) + 1;
    stats.peak.fetch_max(current, Ordering::SeqCst);
    stats.total.fetch_add(1, Ordering::SeqCst);
    fut.await;
    stats.current.fetch_sub(1, Ordering::SeqCst);
}

async fn serve_plain(socket: TcpStream) {
    serve(socket).await;
}

struct Request {
    method: String,
    path: String,
    query: BTreeMap<String, String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn wants_close(&self) -> bool {
        self.header("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }
}

async fn serve<S>(mut socket: S)
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    loop {
        let Some(request) = read_request(&mut socket, &mut buf).await else {
            return;
        };
        let client_close = request.wants_close();
        let server_close = respond(&mut socket, &request).await.is_err() || {
            matches!(
                request.path.as_str(),
                "/close" | "/until-close" | "/both-framing"
            )
        };
        if client_close || server_close {
            let _ = socket.shutdown().await;
            return;
        }
    }
}

async fn read_request<S>(socket: &mut S, buf: &mut Vec<u8>) -> Option<Request>
where
    S: AsyncReadExt + Unpin,
{
    let head_end = loop {
        if let Some(pos) = find_subsequence(buf, b"\r\n\r\n") {
            break pos;
        }
        let mut chunk = [0u8; 4096];
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let content_length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);

    buf.drain(..head_end + 4);
    while buf.len() < content_length {
        let mut chunk = [0u8; 4096];
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body: Vec<u8> = buf.drain(..content_length).collect();

    let (path, query_str) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target, String::new()),
    };
    let query = parse_urlencoded(&query_str);

    Some(Request {
        method,
        path,
        query,
        headers,
        body,
    })
}

async fn respond<S>(socket: &mut S, req: &Request) -> std::io::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    let path = req.path.as_str();

    // HEAD responses must not carry a body.
    if req.method == "HEAD" {
        return write_response(socket, 200, &[], b"").await;
    }

    if path == "/get" || path == "/headers" {
        let payload = echo_json(req);
        return write_response(socket, 200, &[("Content-Type", "application/json")], payload.as_bytes()).await;
    }

    if path == "/post" && req.method == "POST" {
        let payload = echo_json(req);
        return write_response(socket, 200, &[("Content-Type", "application/json")], payload.as_bytes()).await;
    }

    if path == "/redirect-to" {
        let target = req.query.get("url").cloned().unwrap_or_else(|| "/get".into());
        let status = req
            .query
            .get("status_code")
            .and_then(|s| s.parse().ok())
            .unwrap_or(302);
        return write_response(socket, status, &[("Location", &target)], b"").await;
    }

    if let Some(rest) = path.strip_prefix("/redirect/") {
        let n: u32 = rest.parse().unwrap_or(1);
        let target = if n <= 1 {
            "/get".to_string()
        } else {
            format!("/redirect/{}", n - 1)
        };
        return write_response(socket, 302, &[("Location", &target)], b"").await;
    }

    if let Some(rest) = path.strip_prefix("/absolute-redirect/") {
        let n: u32 = rest.parse().unwrap_or(1);
        let host = req.header("host").unwrap_or("127.0.0.1");
        let target = if n <= 1 {
            format!("http://{host}/get")
        } else {
            format!("http://{host}/absolute-redirect/{}", n - 1)
        };
        return write_response(socket, 302, &[("Location", &target)], b"").await;
    }

    if let Some(code) = path.strip_prefix("/status/") {
        let status: u16 = code.parse().unwrap_or(200);
        return write_response(socket, status, &[], b"").await;
    }

    if path == "/image" {
        return write_response(socket, 200, &[("Content-Type", "image/png")], PNG).await;
    }

    if path == "/drip" {
        let numbytes: usize = req.query.get("numbytes").and_then(|s| s.parse().ok()).unwrap_or(10);
        let chunks: usize = req
            .query
            .get("chunks")
            .and_then(|s| s.parse().ok())
            .unwrap_or(2)
            .max(1);
        let delay_ms: u64 = req.query.get("delay_ms").and_then(|s| s.parse().ok()).unwrap_or(10);

        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await?;
        let mut remaining = numbytes;
        for i in 0..chunks {
            let size = if i == chunks - 1 {
                remaining
            } else {
                (numbytes / chunks).min(remaining)
            };
            if size == 0 {
                continue;
            }
            remaining -= size;
            let data = vec![b'*'; size];
            socket.write_all(format!("{size:x}\r\n").as_bytes()).await?;
            socket.write_all(&data).await?;
            socket.write_all(b"\r\n").await?;
            socket.flush().await?;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        socket.write_all(b"0\r\n\r\n").await?;
        return socket.flush().await;
    }

    if path == "/cookies" {
        let mut cookies = serde_json::Map::new();
        if let Some(header) = req.header("cookie") {
            for pair in header.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    cookies.insert(name.to_string(), serde_json::Value::from(value));
                }
            }
        }
        let payload = serde_json::json!({ "cookies": cookies }).to_string();
        return write_response(socket, 200, &[("Content-Type", "application/json")], payload.as_bytes()).await;
    }

    if path == "/cookies/set" {
        let mut headers: Vec<(String, String)> = vec![("Location".into(), "/cookies".into())];
        for (name, value) in &req.query {
            headers.push(("Set-Cookie".into(), format!("{name}={value}; Path=/")));
        }
        let borrowed: Vec<(&str, &str)> = headers.iter().map(|(n, v)| (n.as_str(), v.as_str())).collect();
        return write_response(socket, 302, &borrowed, b"").await;
    }

    if path == "/close" {
        return write_response(socket, 200, &[("Connection", "close")], b"closed").await;
    }

    if path == "/until-close" {
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nraw body until close")
            .await?;
        return socket.flush().await;
    }

    if path == "/interim" {
        socket.write_all(b"HTTP/1.1 103 Early Hints\r\n\r\n").await?;
        socket.flush().await?;
        return write_response(socket, 200, &[("Content-Type", "text/plain")], b"final").await;
    }

    if path == "/both-framing" {
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n")
            .await?;
        return socket.flush().await;
    }

    if path == "/big-head" {
        let padding = "a".repeat(100 * 1024);
        let head = format!("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nX-Pad: {padding}\r\n\r\n");
        socket.write_all(head.as_bytes()).await?;
        return socket.flush().await;
    }

    if let Some(ms) = path.strip_prefix("/delay-body/") {
        let ms: u64 = ms.parse().unwrap_or(100);
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\n")
            .await?;
        socket.flush().await?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        socket.write_all(b"late").await?;
        return socket.flush().await;
    }

    write_response(socket, 404, &[], b"not found").await
}

/// httpbin-style echo payload: `args`, `headers` (canonical-cased names),
/// plus `form`/`data` for POSTs.
fn echo_json(req: &Request) -> String {
    let mut headers = serde_json::Map::new();
    for (name, value) in &req.headers {
        headers.insert(canonical_case(name), serde_json::Value::from(value.as_str()));
    }
    let args: serde_json::Map<String, serde_json::Value> = req
        .query
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::from(v.as_str())))
        .collect();

    let mut payload = serde_json::json!({
        "args": args,
        "headers": headers,
    });

    if req.method == "POST" {
        let is_form = req
            .header("content-type")
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        let body_text = String::from_utf8_lossy(&req.body).into_owned();
        let form: serde_json::Map<String, serde_json::Value> = if is_form {
            parse_urlencoded(&body_text)
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::from(v)))
                .collect()
        } else {
            serde_json::Map::new()
        };
        payload["form"] = serde_json::Value::Object(form);
        payload["data"] = serde_json::Value::from(if is_form { String::new() } else { body_text });
    }

    payload.to_string()
}

async fn write_response<S>(
    socket: &mut S,
    status: u16,
    headers: &[(&str, &str)],
    body: &[u8],
) -> std::io::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    let reason = match status {
        200 => "OK",
        302 => "Found",
        301 => "Moved Permanently",
        303 => "See Other",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        404 => "Not Found",
        _ => "Status",
    };
    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    socket.write_all(head.as_bytes()).await?;
    socket.write_all(body).await?;
    socket.flush().await
}

/// `Test-Header` style casing, matching what httpbin reports.
fn canonical_case(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn parse_urlencoded(input: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for pair in input.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        out.insert(percent_decode(key), percent_decode(value));
    }
    out
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = &input[i + 1..i + 3];
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 2;
                } else {
                    out.push(b'%');
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
