//! Shared configuration record consumed by every backend. Backends read this
//! record; none mutate it.

use std::path::PathBuf;
use std::time::Duration;

/// How the child's stdin is wired. An unset stdin means the child sees EOF
/// immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputMode {
    #[default]
    Closed,
    Inherit,
}

/// How a child output stream is wired. Buffered output is captured into the
/// execution result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    #[default]
    Buffered,
    Inherit,
}

/// Sandbox configuration shared by all backends.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    // Network settings
    /// Allow network access (via the proxy).
    pub network: bool,
    pub allowed_hosts: Vec<String>,
    /// Unix socket path of the proxy (Linux).
    pub proxy_socket_path: Option<PathBuf>,
    /// TCP port of the HTTP proxy.
    pub proxy_http_port: u16,
    /// TCP port of the SOCKS5 proxy.
    pub proxy_socks_port: u16,

    // Filesystem settings
    pub readable_paths: Vec<PathBuf>,
    pub writable_paths: Vec<PathBuf>,
    pub work_dir: PathBuf,

    // Resource limits
    pub memory_mb: u32,
    pub timeout: Duration,
    pub cpu_seconds: u32,

    // PHP settings
    pub php_binary: PathBuf,
    pub autoload_file: Option<PathBuf>,
    pub script_path: PathBuf,
    pub script_args: Vec<String>,

    // Environment
    /// Proxy variables published by the proxy manager.
    pub proxy_env: Vec<(String, String)>,
    /// Additional env vars to pass from the host (`--allow-env`).
    pub allowed_env_vars: Vec<String>,

    // I/O wiring
    pub stdin: InputMode,
    pub stdout: OutputMode,
    pub stderr: OutputMode,

    pub verbose: bool,
}
