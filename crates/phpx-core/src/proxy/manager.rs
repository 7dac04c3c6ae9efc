//! Per-execution lifecycle of the proxy trio.
//!
//! Starts the HTTP proxy (fatal on failure), the SOCKS5 proxy (non-fatal,
//! non-HTTP traffic may fail without it), and on Linux an additional HTTP
//! proxy on a private Unix socket that sandbox backends bridge into the
//! confined child.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use super::filter::DomainFilter;
use super::http::HttpProxy;
use super::socks5::Socks5Proxy;

/// Fixed in-sandbox TCP port bridged to the proxy's Unix socket.
pub const SANDBOX_BRIDGE_PORT: u16 = 19850;

/// Configuration for the proxy manager.
#[derive(Debug, Default, Clone)]
pub struct ManagerConfig {
    /// Allowed hosts; an empty list disables filtering.
    pub allowed_hosts: Vec<String>,
}

/// Coordinates the HTTP and SOCKS5 proxy servers for one execution.
pub struct ProxyManager {
    http_proxy: HttpProxy,
    socks5_proxy: Option<Socks5Proxy>,
    socket_proxy: Option<HttpProxy>,
    socket_path: Option<PathBuf>,
}

impl ProxyManager {
    /// Create and start all necessary proxy servers.
    ///
    /// # Errors
    /// Returns an error when the HTTP proxy cannot be started; the SOCKS5 and
    /// Unix-socket proxies are best-effort.
    pub fn start(cfg: &ManagerConfig) -> Result<Self> {
        let mut filter = DomainFilter::new();
        if cfg.allowed_hosts.is_empty() {
            filter.allow_all();
        } else {
            for host in &cfg.allowed_hosts {
                filter.add_allowed(host);
            }
        }
        let filter = Arc::new(filter);

        let mut http_proxy = HttpProxy::new(Arc::clone(&filter));
        http_proxy.start().context("failed to start HTTP proxy")?;

        let mut socks5_proxy = Socks5Proxy::new(Arc::clone(&filter));
        let socks5_proxy = match socks5_proxy.start() {
            Ok(()) => Some(socks5_proxy),
            Err(err) => {
                tracing::warn!(
                    "SOCKS5 proxy failed to start: {err} (non-HTTP traffic may fail)"
                );
                None
            }
        };

        let (socket_proxy, socket_path) = start_socket_proxy(filter);
        Ok(Self {
            http_proxy,
            socks5_proxy,
            socket_proxy,
            socket_path,
        })
    }

    /// Shut down all proxy servers. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut proxy) = self.socket_proxy.take() {
            proxy.stop();
        }
        if let Some(mut proxy) = self.socks5_proxy.take() {
            proxy.stop();
        }
        self.http_proxy.stop();
    }

    #[must_use]
    pub fn http_port(&self) -> u16 {
        self.http_proxy.port()
    }

    #[must_use]
    pub fn socks5_port(&self) -> u16 {
        self.socks5_proxy.as_ref().map_or(0, Socks5Proxy::port)
    }

    #[must_use]
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// Environment hints published to children using the mediated network.
    #[must_use]
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let addr = format!("http://127.0.0.1:{}", self.http_port());
        let mut vars = vec![
            ("HTTP_PROXY".to_string(), addr.clone()),
            ("HTTPS_PROXY".to_string(), addr.clone()),
            ("http_proxy".to_string(), addr.clone()),
            ("https_proxy".to_string(), addr),
        ];
        if let Some(socks5) = &self.socks5_proxy {
            let socks_addr = format!("socks5://127.0.0.1:{}", socks5.port());
            vars.push(("ALL_PROXY".to_string(), socks_addr.clone()));
            vars.push(("all_proxy".to_string(), socks_addr));
        }
        vars
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// On Linux an extra HTTP proxy listens on a private Unix socket so sandbox
/// backends can bridge it into a network-namespaced child.
#[cfg(target_os = "linux")]
fn start_socket_proxy(filter: Arc<DomainFilter>) -> (Option<HttpProxy>, Option<PathBuf>) {
    let socket_path = std::env::temp_dir().join(format!("phpx-proxy-{}.sock", random_id(16)));
    let mut socket_proxy = HttpProxy::new(filter);
    match socket_proxy.start_unix(socket_path.clone()) {
        Ok(()) => (Some(socket_proxy), Some(socket_path)),
        Err(err) => {
            tracing::debug!("could not start Unix socket proxy: {err}");
            (None, None)
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn start_socket_proxy(_filter: Arc<DomainFilter>) -> (Option<HttpProxy>, Option<PathBuf>) {
    (None, None)
}

/// Cryptographically random suffix for per-execution socket names.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn random_id(len: usize) -> String {
    use rand::distributions::Alphanumeric;
    use rand::{thread_rng, Rng};

    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
