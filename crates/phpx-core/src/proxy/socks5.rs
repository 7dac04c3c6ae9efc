//! Filtering SOCKS5 proxy for non-HTTP traffic.
//!
//! Plain SOCKS5 without authentication: CONNECT only, IPv4/domain/IPv6
//! address forms, targets evaluated through the shared domain filter. Data is
//! relayed with half-close semantics; both directions must complete before
//! the client socket is released.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::filter::DomainFilter;
use super::http::dial;

const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPT: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_CONN_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// SOCKS5 proxy server with domain filtering.
pub struct Socks5Proxy {
    filter: Arc<DomainFilter>,
    port: u16,
    local_addr: Option<SocketAddr>,
    done: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    accept_handle: Option<JoinHandle<()>>,
}

impl Socks5Proxy {
    #[must_use]
    pub fn new(filter: Arc<DomainFilter>) -> Self {
        Self {
            filter,
            port: 0,
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
            TcpListener::bind("127.0.0.1:0").context("failed to start SOCKS5 listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read SOCKS5 listener address")?;
        self.port = addr.port();
        self.local_addr = Some(addr);

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
                        active.fetch_add(1, Ordering::SeqCst);
                        let filter = Arc::clone(&filter);
                        let active = Arc::clone(&active);
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, &filter) {
                                tracing::debug!("socks5 session error: {err}");
                            }
                            active.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(err) => {
                        tracing::debug!("socks5 accept error: {err}");
                    }
                }
            }
        });
        self.accept_handle = Some(handle);
        tracing::debug!(port = self.port, "socks5 proxy started");
        Ok(())
    }

    /// Stop the proxy and drain in-flight sessions for up to five seconds.
    pub fn stop(&mut self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(addr) = self.local_addr {
            let _ = TcpStream::connect_timeout(&addr, Duration::from_secs(1));
        }
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        tracing::debug!("socks5 proxy stopped");
    }
}

impl Drop for Socks5Proxy {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_connection(mut conn: TcpStream, filter: &DomainFilter) -> io::Result<()> {
    conn.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    conn.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

    handle_greeting(&mut conn)?;
    handle_request(conn, filter)
}

fn handle_greeting(conn: &mut TcpStream) -> io::Result<()> {
    let mut header = [0u8; 2];
    conn.read_exact(&mut header)?;
    if header[0] != SOCKS5_VERSION {
        return Err(protocol_error(format!(
            "unsupported SOCKS version: {}",
            header[0]
        )));
    }

    let mut methods = vec![0u8; header[1] as usize];
    conn.read_exact(&mut methods)?;
    if !methods.contains(&AUTH_NONE) {
        let _ = conn.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPT]);
        return Err(protocol_error("no acceptable auth method".to_string()));
    }

    conn.write_all(&[SOCKS5_VERSION, AUTH_NONE])
}

fn handle_request(mut conn: TcpStream, filter: &DomainFilter) -> io::Result<()> {
    let mut header = [0u8; 4];
    conn.read_exact(&mut header)?;
    if header[0] != SOCKS5_VERSION {
        return Err(protocol_error(format!(
            "unsupported SOCKS version: {}",
            header[0]
        )));
    }
    if header[1] != CMD_CONNECT {
        send_reply(&mut conn, REP_CMD_NOT_SUPPORTED, None)?;
        return Err(protocol_error(format!("unsupported command: {}", header[1])));
    }

    let host = match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            conn.read_exact(&mut addr)?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len)?;
            let mut domain = vec![0u8; len[0] as usize];
            conn.read_exact(&mut domain)?;
            String::from_utf8_lossy(&domain).to_string()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            conn.read_exact(&mut addr)?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        other => {
            send_reply(&mut conn, REP_ADDR_NOT_SUPPORTED, None)?;
            return Err(protocol_error(format!("unsupported address type: {other}")));
        }
    };

    let mut port_bytes = [0u8; 2];
    conn.read_exact(&mut port_bytes)?;
    let port = u16::from_be_bytes(port_bytes);

    let host_with_port = format!("{host}:{port}");
    if !filter.is_allowed(&host_with_port) {
        tracing::debug!("socks5 blocked {host_with_port}");
        send_reply(&mut conn, REP_CONN_NOT_ALLOWED, None)?;
        return Err(protocol_error(format!("host not allowed: {host}")));
    }
    tracing::debug!("socks5 CONNECT {host_with_port}");

    let target = match dial(&host_with_port, DIAL_TIMEOUT) {
        Ok(target) => target,
        Err(err) => {
            send_reply(&mut conn, REP_HOST_UNREACHABLE, None)?;
            return Err(err);
        }
    };

    let local_addr = target.local_addr()?;
    send_reply(&mut conn, REP_SUCCESS, Some(local_addr))?;

    conn.set_read_timeout(None)?;
    conn.set_write_timeout(None)?;

    relay(conn, target);
    Ok(())
}

/// Relay both directions; each half-closes its write side when its copy
/// finishes, and both must complete before the sockets are dropped.
fn relay(conn: TcpStream, target: TcpStream) {
    let Ok(conn_reader) = conn.try_clone() else {
        return;
    };
    let Ok(target_reader) = target.try_clone() else {
        return;
    };

    let up = thread::spawn(move || {
        let mut reader = conn_reader;
        let mut writer = target;
        let _ = io::copy(&mut reader, &mut writer);
        let _ = writer.shutdown(Shutdown::Write);
    });
    let down = thread::spawn(move || {
        let mut reader = target_reader;
        let mut writer = conn;
        let _ = io::copy(&mut reader, &mut writer);
        let _ = writer.shutdown(Shutdown::Write);
    });
    let _ = up.join();
    let _ = down.join();
}

fn send_reply(conn: &mut TcpStream, rep: u8, addr: Option<SocketAddr>) -> io::Result<()> {
    let mut reply = [0u8; 10];
    reply[0] = SOCKS5_VERSION;
    reply[1] = rep;
    reply[2] = 0x00;
    reply[3] = ATYP_IPV4;
    if let Some(SocketAddr::V4(v4)) = addr {
        reply[4..8].copy_from_slice(&v4.ip().octets());
        reply[8..10].copy_from_slice(&v4.port().to_be_bytes());
    }
    conn.write_all(&reply)
}

fn protocol_error(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn start_proxy(hosts: &[&str]) -> Socks5Proxy {
        let mut filter = DomainFilter::new();
        for host in hosts {
            filter.add_allowed(host);
        }
        let mut proxy = Socks5Proxy::new(Arc::new(filter));
        proxy.start().expect("start socks5");
        proxy
    }

    fn connect_request(target: &str, port: u16) -> Vec<u8> {
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN];
        request.push(target.len() as u8);
        request.extend_from_slice(target.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        request
    }

    #[test]
    fn connect_relays_to_allowed_hosts() {
        let upstream = TcpListener::bind("127.0.0.1:0").expect("upstream");
        let upstream_port = upstream.local_addr().expect("addr").port();
        let echo = thread::spawn(move || {
            if let Ok((mut stream, _)) = upstream.accept() {
                let mut buf = [0u8; 64];
                if let Ok(n) = stream.read(&mut buf) {
                    let _ = stream.write_all(&buf[..n]);
                }
            }
        });

        let mut proxy = start_proxy(&["127.0.0.1"]);
        let mut client =
            TcpStream::connect(("127.0.0.1", proxy.port())).expect("connect to proxy");

        client
            .write_all(&[SOCKS5_VERSION, 1, AUTH_NONE])
            .expect("greeting");
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).expect("greeting reply");
        assert_eq!(greeting, [SOCKS5_VERSION, AUTH_NONE]);

        client
            .write_all(&connect_request("127.0.0.1", upstream_port))
            .expect("request");
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).expect("reply");
        assert_eq!(reply[0], SOCKS5_VERSION);
        assert_eq!(reply[1], REP_SUCCESS);

        client.write_all(b"ping").expect("payload");
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).expect("echo");
        assert_eq!(&echoed, b"ping");

        drop(client);
        echo.join().expect("echo thread");
        proxy.stop();
    }

    #[test]
    fn filtered_hosts_get_connection_not_allowed() {
        let mut proxy = start_proxy(&["allowed.example"]);
        let mut client =
            TcpStream::connect(("127.0.0.1", proxy.port())).expect("connect to proxy");

        client
            .write_all(&[SOCKS5_VERSION, 1, AUTH_NONE])
            .expect("greeting");
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).expect("greeting reply");

        client
            .write_all(&connect_request("denied.example", 443))
            .expect("request");
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).expect("reply");
        assert_eq!(reply[1], REP_CONN_NOT_ALLOWED);

        proxy.stop();
    }

    #[test]
    fn clients_without_no_auth_are_rejected() {
        let mut proxy = start_proxy(&[]);
        let mut client =
            TcpStream::connect(("127.0.0.1", proxy.port())).expect("connect to proxy");

        // Offer only username/password auth (0x02).
        client
            .write_all(&[SOCKS5_VERSION, 1, 0x02])
            .expect("greeting");
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).expect("reply");
        assert_eq!(reply, [SOCKS5_VERSION, AUTH_NO_ACCEPT]);

        proxy.stop();
    }

    #[test]
    fn unsupported_commands_get_the_proper_reply() {
        let mut proxy = start_proxy(&[]);
        let mut client =
            TcpStream::connect(("127.0.0.1", proxy.port())).expect("connect to proxy");

        client
            .write_all(&[SOCKS5_VERSION, 1, AUTH_NONE])
            .expect("greeting");
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).expect("greeting reply");

        // BIND (0x02) is not supported.
        let mut request = vec![SOCKS5_VERSION, 0x02, 0x00, ATYP_DOMAIN];
        request.push(4);
        request.extend_from_slice(b"host");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).expect("request");

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).expect("reply");
        assert_eq!(reply[1], REP_CMD_NOT_SUPPORTED);

        proxy.stop();
    }
}
