//! Tool execution: like script execution, but rooted in the caller's working
//! directory with the tool installation readable and the working directory
//! writable.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::context::ExecContext;
use crate::proxy::{ManagerConfig, ProxyManager};
use crate::sandbox::{ExecResult, InputMode, OutputMode, Sandbox, SandboxConfig};

/// Options for running an installed tool.
#[derive(Debug, Clone, Default)]
pub struct ToolOptions {
    pub php_binary: PathBuf,
    /// Directory the tool was installed into.
    pub tool_dir: PathBuf,
    /// Name of the binary under `vendor/bin`.
    pub binary_name: String,

    pub network: bool,
    pub allowed_hosts: Vec<String>,
    pub allowed_env_vars: Vec<String>,
    pub read_paths: Vec<PathBuf>,
    pub write_paths: Vec<PathBuf>,
    pub memory_mb: u32,
    pub timeout: Duration,
    pub cpu_seconds: u32,

    pub args: Vec<String>,

    /// Working directory; defaults to the caller's current directory.
    pub work_dir: Option<PathBuf>,

    pub stdin: InputMode,
    pub stdout: OutputMode,
    pub stderr: OutputMode,

    pub verbose: bool,
}

/// Execute a tool binary under the given backend.
///
/// # Errors
/// Returns an error when the proxy cannot start or the backend fails to
/// launch the child. A non-zero child exit is reported in the result.
pub fn run_tool(sandbox: &dyn Sandbox, ctx: &ExecContext, opts: &ToolOptions) -> Result<ExecResult> {
    let binary_path = opts.tool_dir.join("vendor").join("bin").join(&opts.binary_name);

    let needs_proxy = sandbox.is_sandboxed() && opts.network;
    let mut proxy_manager = if needs_proxy {
        Some(
            ProxyManager::start(&ManagerConfig {
                allowed_hosts: opts.allowed_hosts.clone(),
            })
            .context("failed to start proxy")?,
        )
    } else {
        None
    };

    let work_dir = opts
        .work_dir
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));

    // Tools read their own installation and usually write into the project
    // they were invoked from.
    let mut read_paths = opts.read_paths.clone();
    read_paths.push(opts.tool_dir.clone());
    read_paths.push(work_dir.clone());
    let mut write_paths = opts.write_paths.clone();
    write_paths.push(work_dir.clone());

    let cfg = SandboxConfig {
        network: opts.network,
        allowed_hosts: opts.allowed_hosts.clone(),
        proxy_socket_path: proxy_manager
            .as_ref()
            .and_then(|manager| manager.socket_path().map(PathBuf::from)),
        proxy_http_port: proxy_manager.as_ref().map_or(0, ProxyManager::http_port),
        proxy_socks_port: proxy_manager.as_ref().map_or(0, ProxyManager::socks5_port),
        readable_paths: read_paths,
        writable_paths: write_paths,
        work_dir,
        memory_mb: opts.memory_mb,
        timeout: opts.timeout,
        cpu_seconds: opts.cpu_seconds,
        php_binary: opts.php_binary.clone(),
        // Tools carry their own autoloading.
        autoload_file: None,
        script_path: binary_path,
        script_args: opts.args.clone(),
        proxy_env: proxy_manager
            .as_ref()
            .map(ProxyManager::env_vars)
            .unwrap_or_default(),
        allowed_env_vars: opts.allowed_env_vars.clone(),
        stdin: opts.stdin,
        stdout: opts.stdout,
        stderr: opts.stderr,
        verbose: opts.verbose,
    };

    if sandbox.is_sandboxed() {
        tracing::debug!(backend = sandbox.name(), "using sandbox");
    }
    tracing::debug!(binary = %cfg.script_path.display(), "running tool");

    let exec_ctx = ctx.with_timeout(opts.timeout);
    let result = sandbox
        .execute(&exec_ctx, &cfg)
        .context("execution failed")?;

    if let Some(manager) = proxy_manager.as_mut() {
        manager.stop();
    }
    Ok(result)
}
