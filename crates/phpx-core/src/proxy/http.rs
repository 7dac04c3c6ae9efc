//! Filtering HTTP/CONNECT proxy.
//!
//! Listens on a loopback TCP port or a Unix domain socket. CONNECT requests
//! are tunnelled with a bidirectional splice after the domain filter admits
//! the target; plain requests are forwarded upstream with the hop-by-hop
//! `Proxy-*` headers stripped and redirects left to the client.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::Client;

use super::filter::DomainFilter;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// HTTP/HTTPS proxy with domain filtering.
pub struct HttpProxy {
    filter: Arc<DomainFilter>,
    port: u16,
    socket_path: Option<PathBuf>,
    local_addr: Option<SocketAddr>,
    done: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    accept_handle: Option<JoinHandle<()>>,
}

impl HttpProxy {
    #[must_use]
    pub fn new(filter: Arc<DomainFilter>) -> Self {
        Self {
            filter,
            port: 0,
            socket_path: None,
            local_addr: None,
            done: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            accept_handle: None,
        }
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start the proxy on an OS-assigned loopback TCP port.
    ///
    /// # Errors
    /// Returns an error when the listener cannot be bound.
    pub fn start(&mut self) -> Result<()> {
        let listener =
            TcpListener::bind("127.0.0.1:0").context("failed to start proxy listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read proxy listener address")?;
        self.port = addr.port();
        self.local_addr = Some(addr);

        let upstream = upstream_client()?;
        let filter = Arc::clone(&self.filter);
        let done = Arc::clone(&self.done);
        let active = Arc::clone(&self.active);
        let handle = thread::spawn(move || {
            for conn in listener.incoming() {
                if done.load(Ordering::SeqCst) {
                    break;
                }
                match conn {
                    Ok(stream) => {
                        spawn_connection(Box::new(stream), &filter, &upstream, &active);
                    }
                    Err(err) => {
                        tracing::debug!("proxy accept error: {err}");
                    }
                }
            }
        });
        self.accept_handle = Some(handle);
        tracing::debug!(port = self.port, "http proxy started");
        Ok(())
    }

    /// Start the proxy on a Unix domain socket with owner-only permissions.
    ///
    /// # Errors
    /// Returns an error when the socket cannot be bound.
    #[cfg(unix)]
    pub fn start_unix(&mut self, socket_path: PathBuf) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        use std::os::unix::net::UnixListener;

        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to start proxy on {}", socket_path.display()))?;
        if let Err(err) =
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
        {
            tracing::warn!("could not set proxy socket permissions: {err}");
        }
        self.socket_path = Some(socket_path.clone());

        let upstream = upstream_client()?;
        let filter = Arc::clone(&self.filter);
        let done = Arc::clone(&self.done);
        let active = Arc::clone(&self.active);
        let handle = thread::spawn(move || {
            for conn in listener.incoming() {
                if done.load(Ordering::SeqCst) {
                    break;
                }
                match conn {
                    Ok(stream) => {
                        spawn_connection(Box::new(stream), &filter, &upstream, &active);
                    }
                    Err(err) => {
                        tracing::debug!("proxy accept error: {err}");
                    }
                }
            }
        });
        self.accept_handle = Some(handle);
        tracing::debug!(socket = %socket_path.display(), "http proxy started on unix socket");
        Ok(())
    }

    /// Stop the proxy: wake the accept loop, drain in-flight connections for
    /// up to five seconds, and remove the Unix socket file if any.
    pub fn stop(&mut self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(addr) = self.local_addr {
            let _ = TcpStream::connect_timeout(&addr, Duration::from_secs(1));
        }
        #[cfg(unix)]
        if let Some(path) = &self.socket_path {
            let _ = std::os::unix::net::UnixStream::connect(path);
        }
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
        tracing::debug!("http proxy stopped");
    }
}

impl Drop for HttpProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

fn upstream_client() -> Result<Client> {
    Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .context("failed to build upstream HTTP client")
}

/// A client-side connection the proxy can splice: both TCP and Unix streams.
pub(crate) trait ProxyStream: Read + Write + Send {
    fn try_clone_stream(&self) -> io::Result<Box<dyn ProxyStream>>;
    fn set_stream_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn shutdown_write(&self) -> io::Result<()>;
}

impl ProxyStream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Box<dyn ProxyStream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_stream_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

#[cfg(unix)]
impl ProxyStream for std::os::unix::net::UnixStream {
    fn try_clone_stream(&self) -> io::Result<Box<dyn ProxyStream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_stream_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn spawn_connection(
    stream: Box<dyn ProxyStream>,
    filter: &Arc<DomainFilter>,
    upstream: &Client,
    active: &Arc<AtomicUsize>,
) {
    active.fetch_add(1, Ordering::SeqCst);
    let filter = Arc::clone(filter);
    let upstream = upstream.clone();
    let guard = ActiveGuard(Arc::clone(active));
    thread::spawn(move || {
        let _guard = guard;
        handle_connection(stream, &filter, &upstream);
    });
}

fn handle_connection(mut stream: Box<dyn ProxyStream>, filter: &DomainFilter, upstream: &Client) {
    let _ = stream.set_stream_timeout(Some(HANDSHAKE_TIMEOUT));

    let (head, leftover) = match read_head(stream.as_mut()) {
        Ok(parts) => parts,
        Err(err) => {
            tracing::debug!("proxy request read failed: {err}");
            return;
        }
    };
    let Some(request) = parse_head(&head) else {
        write_simple_response(stream.as_mut(), 400, "Bad Request", "malformed request\n");
        return;
    };

    if request.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(stream, &request, filter);
    } else {
        handle_http(stream, request, leftover, filter, upstream);
    }
}

struct Request {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

fn read_head(stream: &mut dyn ProxyStream) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end + 4);
            buf.truncate(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_head(head: &[u8]) -> Option<Request> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    parts.next()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Some(Request {
        method,
        target,
        headers,
    })
}

/// Dial a `host:port` target, trying every resolved address.
pub(crate) fn dial(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let addrs = addr.to_socket_addrs()?;
    let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved");
    for sockaddr in addrs {
        match TcpStream::connect_timeout(&sockaddr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}

fn handle_connect(mut stream: Box<dyn ProxyStream>, request: &Request, filter: &DomainFilter) {
    let host = request.target.as_str();
    if !filter.is_allowed(host) {
        tracing::debug!("proxy blocked CONNECT {host}");
        write_simple_response(
            stream.as_mut(),
            403,
            "Forbidden",
            &format!("Domain not allowed: {host}\n"),
        );
        return;
    }
    tracing::debug!("proxy CONNECT {host}");

    let addr = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:443")
    };
    let target = match dial(&addr, DIAL_TIMEOUT) {
        Ok(target) => target,
        Err(err) => {
            write_simple_response(stream.as_mut(), 502, "Bad Gateway", &format!("{err}\n"));
            return;
        }
    };

    if stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .is_err()
    {
        return;
    }
    let _ = stream.set_stream_timeout(None);
    splice(stream, Box::new(target));
}

/// Copy both directions until each side closes; each direction may half-close
/// first, and the client socket is only released once both copies finish.
fn splice(client: Box<dyn ProxyStream>, target: Box<dyn ProxyStream>) {
    let Ok(client_writer) = client.try_clone_stream() else {
        return;
    };
    let Ok(target_writer) = target.try_clone_stream() else {
        return;
    };

    let up = thread::spawn(move || {
        let mut reader = client;
        let mut writer = target_writer;
        let _ = io::copy(&mut reader, &mut writer);
        let _ = writer.shutdown_write();
    });
    let down = thread::spawn(move || {
        let mut reader = target;
        let mut writer = client_writer;
        let _ = io::copy(&mut reader, &mut writer);
        let _ = writer.shutdown_write();
    });
    let _ = up.join();
    let _ = down.join();
}

fn handle_http(
    mut stream: Box<dyn ProxyStream>,
    request: Request,
    mut body: Vec<u8>,
    filter: &DomainFilter,
    upstream: &Client,
) {
    let host = request
        .header("Host")
        .map(str::to_string)
        .or_else(|| authority_from_url(&request.target))
        .unwrap_or_default();
    if host.is_empty() {
        write_simple_response(stream.as_mut(), 400, "Bad Request", "missing host\n");
        return;
    }
    if !filter.is_allowed(&host) {
        tracing::debug!("proxy blocked {} {}", request.method, request.target);
        write_simple_response(
            stream.as_mut(),
            403,
            "Forbidden",
            &format!("Domain not allowed: {host}\n"),
        );
        return;
    }
    tracing::debug!("proxy {} {}", request.method, request.target);

    let content_length = request
        .header("Content-Length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        write_simple_response(stream.as_mut(), 413, "Payload Too Large", "body too large\n");
        return;
    }
    while body.len() < content_length {
        let mut chunk = vec![0u8; (content_length - body.len()).min(64 * 1024)];
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }

    let Ok(method) = reqwest::Method::from_bytes(request.method.as_bytes()) else {
        write_simple_response(stream.as_mut(), 400, "Bad Request", "unsupported method\n");
        return;
    };
    let url = if request.target.starts_with("http://") || request.target.starts_with("https://") {
        request.target.clone()
    } else {
        format!("http://{host}{}", request.target)
    };

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &request.headers {
        if is_hop_header(name) {
            continue;
        }
        let Ok(header_name) = reqwest::header::HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(header_value) = reqwest::header::HeaderValue::from_str(value) else {
            continue;
        };
        headers.append(header_name, header_value);
    }

    let mut builder = upstream.request(method, &url).headers(headers);
    if content_length > 0 {
        builder = builder.body(body);
    }
    let response = match builder.send() {
        Ok(response) => response,
        Err(err) => {
            write_simple_response(stream.as_mut(), 502, "Bad Gateway", &format!("{err}\n"));
            return;
        }
    };

    let status = response.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        let lower = name.as_str();
        if lower == "transfer-encoding" || lower == "connection" || lower == "content-length" {
            continue;
        }
        if let Ok(value) = value.to_str() {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    let payload = match response.bytes() {
        Ok(payload) => payload,
        Err(err) => {
            write_simple_response(stream.as_mut(), 502, "Bad Gateway", &format!("{err}\n"));
            return;
        }
    };
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    ));
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(&payload);
}

/// Extract `host[:port]` from an absolute-form request target.
fn authority_from_url(target: &str) -> Option<String> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    if authority.is_empty() {
        None
    } else {
        Some(authority.to_string())
    }
}

fn is_hop_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("Proxy-Connection")
        || name.eq_ignore_ascii_case("Proxy-Authenticate")
        || name.eq_ignore_ascii_case("Proxy-Authorization")
        || name.eq_ignore_ascii_case("Host")
        || name.eq_ignore_ascii_case("Content-Length")
        || name.eq_ignore_ascii_case("Connection")
}

fn write_simple_response(stream: &mut dyn ProxyStream, code: u16, reason: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
}
