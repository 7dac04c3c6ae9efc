//! Lightweight network-only confinement on Linux using `unshare`.
//!
//! Unlike the full backends this leaves the filesystem open and only detaches
//! the network namespace. With an active proxy socket the socat bridge keeps
//! mediated traffic reachable; with network requested but no socket the child
//! runs without isolation and only receives proxy environment hints.

use std::env;

use anyhow::Result;

use super::common::{
    bridge_proxy_env, build_php_args, build_php_command_line, build_socat_bridge_command,
    command_exists, has_socat, run_command, sandbox_env, ChildEnv,
};
use super::config::SandboxConfig;
use super::{ExecResult, Sandbox};
use crate::context::ExecContext;

pub struct LinuxNetwork;

impl Sandbox for LinuxNetwork {
    fn name(&self) -> &'static str {
        "linux-network"
    }

    fn is_sandboxed(&self) -> bool {
        true
    }

    fn available(&self) -> bool {
        env::consts::OS == "linux" && command_exists("unshare")
    }

    fn execute(&self, ctx: &ExecContext, cfg: &SandboxConfig) -> Result<ExecResult> {
        let bridged = cfg.network && cfg.proxy_socket_path.is_some() && has_socat();
        let (program, args) = build_command(cfg, bridged);
        let extra = if bridged { bridge_proxy_env() } else { Vec::new() };
        run_command(
            &program,
            &args,
            ChildEnv::Pairs(sandbox_env(cfg, &extra)),
            ctx,
            cfg,
        )
    }
}

fn build_command(cfg: &SandboxConfig, bridged: bool) -> (String, Vec<String>) {
    if bridged {
        // Mediated network: unshare the namespace and bridge the proxy
        // socket from inside.
        let socket = cfg
            .proxy_socket_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        let shell_cmd = build_socat_bridge_command(&socket, &build_php_command_line(cfg));
        let args = vec![
            "--net".to_string(),
            "--map-root-user".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            shell_cmd,
        ];
        return ("unshare".to_string(), args);
    }

    if cfg.network {
        // Network requested but no proxy socket reachable from a detached
        // namespace. Run without isolation; the proxy variables remain hints.
        tracing::warn!(
            "network filtering degraded: no proxy socket available, running without network isolation"
        );
        return (cfg.php_binary.display().to_string(), build_php_args(cfg));
    }

    // Offline: full network namespace detachment.
    let mut args = vec![
        "--net".to_string(),
        "--map-root-user".to_string(),
        "--".to_string(),
        cfg.php_binary.display().to_string(),
    ];
    args.extend(build_php_args(cfg));
    ("unshare".to_string(), args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_config() -> SandboxConfig {
        SandboxConfig {
            php_binary: PathBuf::from("/cache/php/8.4.17-common/bin/php"),
            script_path: PathBuf::from("/work/script.php"),
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn offline_mode_detaches_the_network_namespace() {
        let (program, args) = build_command(&base_config(), false);
        assert_eq!(program, "unshare");
        assert_eq!(args[0], "--net");
        assert_eq!(args[1], "--map-root-user");
        assert!(args.contains(&"/cache/php/8.4.17-common/bin/php".to_string()));
    }

    #[test]
    fn bridged_mode_wraps_the_command_in_a_socat_shell() {
        let cfg = SandboxConfig {
            network: true,
            proxy_socket_path: Some(PathBuf::from("/tmp/phpx-proxy-abc.sock")),
            ..base_config()
        };
        let (program, args) = build_command(&cfg, true);
        assert_eq!(program, "unshare");
        let prefix: Vec<&str> = args[..4].iter().map(String::as_str).collect();
        assert_eq!(prefix, vec!["--net", "--map-root-user", "sh", "-c"]);
        assert!(args[4].contains("socat"));
        assert!(args[4].contains("phpx-proxy-abc.sock"));
    }

    #[test]
    fn degraded_mode_runs_the_interpreter_directly() {
        let cfg = SandboxConfig {
            network: true,
            ..base_config()
        };
        let (program, args) = build_command(&cfg, false);
        assert_eq!(program, "/cache/php/8.4.17-common/bin/php");
        assert_eq!(args.last().expect("script"), "/work/script.php");
    }
}
