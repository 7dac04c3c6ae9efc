//! Script execution: proxy lifecycle, sandbox configuration, dispatch.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::context::ExecContext;
use crate::proxy::{ManagerConfig, ProxyManager};
use crate::sandbox::{ExecResult, InputMode, OutputMode, Sandbox, SandboxConfig};

/// Options for running a script.
#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    pub script_path: PathBuf,
    pub php_binary: PathBuf,
    pub autoload_file: Option<PathBuf>,

    pub network: bool,
    pub allowed_hosts: Vec<String>,
    pub allowed_env_vars: Vec<String>,
    pub read_paths: Vec<PathBuf>,
    pub write_paths: Vec<PathBuf>,
    pub memory_mb: u32,
    pub timeout: Duration,
    pub cpu_seconds: u32,

    pub args: Vec<String>,

    pub stdin: InputMode,
    pub stdout: OutputMode,
    pub stderr: OutputMode,

    pub verbose: bool,
}

/// Execute a script under the given backend.
///
/// A proxy manager is started only when the backend actually confines the
/// child and network access is requested; it is torn down when the run
/// completes.
///
/// # Errors
/// Returns an error when the proxy cannot start or the backend fails to
/// launch the child. A non-zero child exit is reported in the result.
pub fn run_script(
    sandbox: &dyn Sandbox,
    ctx: &ExecContext,
    opts: &ScriptOptions,
) -> Result<ExecResult> {
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

    let cfg = SandboxConfig {
        network: opts.network,
        allowed_hosts: opts.allowed_hosts.clone(),
        proxy_socket_path: proxy_manager
            .as_ref()
            .and_then(|manager| manager.socket_path().map(PathBuf::from)),
        proxy_http_port: proxy_manager.as_ref().map_or(0, ProxyManager::http_port),
        proxy_socks_port: proxy_manager.as_ref().map_or(0, ProxyManager::socks5_port),
        readable_paths: opts.read_paths.clone(),
        writable_paths: opts.write_paths.clone(),
        work_dir: opts
            .script_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default(),
        memory_mb: opts.memory_mb,
        timeout: opts.timeout,
        cpu_seconds: opts.cpu_seconds,
        php_binary: opts.php_binary.clone(),
        autoload_file: opts.autoload_file.clone(),
        script_path: opts.script_path.clone(),
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
    tracing::debug!(script = %opts.script_path.display(), "running script");

    let exec_ctx = ctx.with_timeout(opts.timeout);
    let result = sandbox
        .execute(&exec_ctx, &cfg)
        .context("execution failed")?;

    if let Some(manager) = proxy_manager.as_mut() {
        manager.stop();
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Passthrough;
    use std::fs;

    #[cfg(unix)]
    #[test]
    fn script_runs_in_its_own_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("script.sh");
        fs::write(&script, "basename \"$(pwd)\"\n").expect("write script");
        let canonical = temp.path().canonicalize().expect("canonical");

        let opts = ScriptOptions {
            script_path: canonical.join("script.sh"),
            php_binary: PathBuf::from("/bin/sh"),
            ..ScriptOptions::default()
        };
        let result = run_script(&Passthrough, &ExecContext::new(), &opts).expect("run");
        assert_eq!(result.exit_code, 0);
        let dir_name = canonical
            .file_name()
            .and_then(|name| name.to_str())
            .expect("dir name");
        assert_eq!(result.stdout.trim(), dir_name);
    }

    #[cfg(unix)]
    #[test]
    fn child_exit_code_is_propagated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("script.sh");
        fs::write(&script, "exit 42\n").expect("write script");

        let opts = ScriptOptions {
            script_path: script,
            php_binary: PathBuf::from("/bin/sh"),
            ..ScriptOptions::default()
        };
        let result = run_script(&Passthrough, &ExecContext::new(), &opts).expect("run");
        assert_eq!(result.exit_code, 42);
    }

    #[cfg(unix)]
    #[test]
    fn wall_timeout_kills_the_child() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("script.sh");
        fs::write(&script, "sleep 5\n").expect("write script");

        let opts = ScriptOptions {
            script_path: script,
            php_binary: PathBuf::from("/bin/sh"),
            timeout: Duration::from_millis(100),
            ..ScriptOptions::default()
        };
        let start = std::time::Instant::now();
        let result = run_script(&Passthrough, &ExecContext::new(), &opts).expect("run");
        assert_ne!(result.exit_code, 0);
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
