//! Namespace-based confinement via bubblewrap (`bwrap`).
//!
//! The network namespace is always unshared. When network access is needed,
//! the proxy's Unix socket is bound into the sandbox and a socat forwarder
//! bridges a reserved loopback port to it before the interpreter starts.

use std::env;
use std::path::Path;

use anyhow::Result;

use super::common::{
    bridge_proxy_env, build_php_args, build_php_command_line, build_socat_bridge_command,
    command_exists, has_socat, run_command, sandbox_env, ChildEnv,
};
use super::config::SandboxConfig;
use super::{ExecResult, Sandbox};
use crate::context::ExecContext;

const SANDBOX_SOCKET_PATH: &str = "/tmp/proxy.sock";

pub struct Bubblewrap;

impl Sandbox for Bubblewrap {
    fn name(&self) -> &'static str {
        "bubblewrap"
    }

    fn is_sandboxed(&self) -> bool {
        true
    }

    fn available(&self) -> bool {
        env::consts::OS == "linux" && command_exists("bwrap")
    }

    fn execute(&self, ctx: &ExecContext, cfg: &SandboxConfig) -> Result<ExecResult> {
        let args = build_args(cfg);
        let extra = if cfg.network && cfg.proxy_socket_path.is_some() && has_socat() {
            bridge_proxy_env()
        } else {
            Vec::new()
        };
        run_command(
            "bwrap",
            &args,
            ChildEnv::Pairs(sandbox_env(cfg, &extra)),
            ctx,
            cfg,
        )
    }
}

fn bind_ro(args: &mut Vec<String>, path: &str) {
    args.push("--ro-bind".to_string());
    args.push(path.to_string());
    args.push(path.to_string());
}

fn bind_rw(args: &mut Vec<String>, path: &str) {
    args.push("--bind".to_string());
    args.push(path.to_string());
    args.push(path.to_string());
}

/// Construct the bwrap argument vector: minimal mounts for a static PHP
/// binary.
fn build_args(cfg: &SandboxConfig) -> Vec<String> {
    let mut args = Vec::new();

    // Minimal device access.
    for dev in ["/dev/null", "/dev/urandom", "/dev/random"] {
        args.push("--dev-bind".to_string());
        args.push(dev.to_string());
        args.push(dev.to_string());
    }

    // Timezone data for date functions.
    for tz in ["/usr/share/zoneinfo", "/etc/localtime"] {
        if Path::new(tz).exists() {
            bind_ro(&mut args, tz);
        }
    }

    // DNS resolution, only when the network is reachable at all.
    if cfg.network {
        for dns in ["/etc/resolv.conf", "/etc/hosts", "/etc/nsswitch.conf"] {
            if Path::new(dns).exists() {
                bind_ro(&mut args, dns);
            }
        }
    }

    // Interpreter and script, exact files only.
    if !cfg.php_binary.as_os_str().is_empty() {
        bind_ro(&mut args, &cfg.php_binary.display().to_string());
    }
    if !cfg.script_path.as_os_str().is_empty() {
        bind_ro(&mut args, &cfg.script_path.display().to_string());
    }

    // Vendor directory holding the autoload entry point.
    if let Some(autoload) = &cfg.autoload_file {
        if let Some(vendor_dir) = autoload.parent() {
            bind_ro(&mut args, &vendor_dir.display().to_string());
        }
    }

    for path in &cfg.readable_paths {
        if path.exists() {
            bind_ro(&mut args, &path.display().to_string());
        }
    }
    for path in &cfg.writable_paths {
        if path.exists() {
            bind_rw(&mut args, &path.display().to_string());
        }
    }

    // Proxy socket, bound at a fixed in-sandbox path.
    let use_bridge = cfg.network && cfg.proxy_socket_path.is_some() && has_socat();
    if cfg.network {
        if let Some(socket) = &cfg.proxy_socket_path {
            args.push("--ro-bind".to_string());
            args.push(socket.display().to_string());
            args.push(SANDBOX_SOCKET_PATH.to_string());
        }
    }

    args.extend(
        [
            "--unshare-user",
            "--unshare-pid",
            "--unshare-uts",
            "--unshare-cgroup",
            "--unshare-net",
            "--die-with-parent",
            "--new-session",
        ]
        .map(str::to_string),
    );

    if !cfg.work_dir.as_os_str().is_empty() {
        args.push("--chdir".to_string());
        args.push(cfg.work_dir.display().to_string());
    }

    if use_bridge {
        let php_cmd = build_php_command_line(cfg);
        let shell_cmd = build_socat_bridge_command(SANDBOX_SOCKET_PATH, &php_cmd);
        args.extend(["--", "sh", "-c"].map(str::to_string));
        args.push(shell_cmd);
    } else {
        args.push("--".to_string());
        args.push(cfg.php_binary.display().to_string());
        args.extend(build_php_args(cfg));
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_config() -> SandboxConfig {
        SandboxConfig {
            php_binary: PathBuf::from("/cache/php/8.4.17-common/bin/php"),
            script_path: PathBuf::from("/work/script.php"),
            work_dir: PathBuf::from("/work"),
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn offline_config_always_unshares_the_network() {
        let args = build_args(&base_config());
        assert!(args.contains(&"--unshare-net".to_string()));
        assert!(args.contains(&"--die-with-parent".to_string()));
        assert!(args.contains(&"--new-session".to_string()));
        assert!(!args.iter().any(|arg| arg.contains("resolv.conf")));
    }

    #[test]
    fn network_config_binds_dns_files_that_exist() {
        let cfg = SandboxConfig {
            network: true,
            ..base_config()
        };
        let args = build_args(&cfg);
        // The network namespace stays unshared; traffic goes through the bridge.
        assert!(args.contains(&"--unshare-net".to_string()));
        if Path::new("/etc/resolv.conf").exists() {
            assert!(args.contains(&"/etc/resolv.conf".to_string()));
        }
    }

    #[test]
    fn proxy_socket_is_bound_at_the_fixed_path() {
        let cfg = SandboxConfig {
            network: true,
            proxy_socket_path: Some(PathBuf::from("/tmp/phpx-proxy-abc.sock")),
            ..base_config()
        };
        let args = build_args(&cfg);
        assert!(args.contains(&SANDBOX_SOCKET_PATH.to_string()));
    }

    #[test]
    fn interpreter_and_script_are_bound_read_only() {
        let args = build_args(&base_config());
        let ro_binds: Vec<usize> = args
            .iter()
            .enumerate()
            .filter(|(_, arg)| *arg == "--ro-bind")
            .map(|(idx, _)| idx)
            .collect();
        let bound: Vec<&String> = ro_binds.iter().map(|idx| &args[idx + 1]).collect();
        assert!(bound.contains(&&"/cache/php/8.4.17-common/bin/php".to_string()));
        assert!(bound.contains(&&"/work/script.php".to_string()));
    }

    #[test]
    fn command_follows_the_separator() {
        let args = build_args(&base_config());
        let sep = args.iter().position(|arg| arg == "--").expect("separator");
        assert_eq!(args[sep + 1], "/cache/php/8.4.17-common/bin/php");
        assert_eq!(args[sep + 2], "/work/script.php");
    }
}
