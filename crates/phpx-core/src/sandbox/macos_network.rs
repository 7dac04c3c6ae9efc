//! Network-only confinement on macOS: an allow-default Seatbelt profile that
//! denies networking except the proxy endpoints.

use std::env;
use std::fmt::Write as _;
use std::io::Write as _;

use anyhow::{Context, Result};

use super::common::{build_php_args, command_exists, run_command, sandbox_env, ChildEnv};
use super::config::SandboxConfig;
use super::{ExecResult, Sandbox};
use crate::context::ExecContext;

pub struct MacOsNetwork;

impl Sandbox for MacOsNetwork {
    fn name(&self) -> &'static str {
        "macos-network"
    }

    fn is_sandboxed(&self) -> bool {
        true
    }

    fn available(&self) -> bool {
        env::consts::OS == "macos" && command_exists("sandbox-exec")
    }

    fn execute(&self, ctx: &ExecContext, cfg: &SandboxConfig) -> Result<ExecResult> {
        let profile = generate_profile(cfg);
        let mut file = tempfile::Builder::new()
            .prefix("phpx-network-")
            .suffix(".sb")
            .tempfile()
            .context("failed to create sandbox profile")?;
        file.write_all(profile.as_bytes())
            .context("failed to write sandbox profile")?;
        let profile_path = file.into_temp_path();

        let mut args = vec![
            "-f".to_string(),
            profile_path.display().to_string(),
            cfg.php_binary.display().to_string(),
        ];
        args.extend(build_php_args(cfg));

        run_command(
            "sandbox-exec",
            &args,
            ChildEnv::Pairs(sandbox_env(cfg, &[])),
            ctx,
            cfg,
        )
    }
}

/// Allow everything except networking; re-admit only the proxy endpoints
/// when the mediated network is in use.
fn generate_profile(cfg: &SandboxConfig) -> String {
    let mut profile = String::new();
    profile.push_str("(version 1)\n(allow default)\n\n");
    profile.push_str(";; Block all network except proxy\n");
    profile.push_str("(deny network*)\n\n");

    if cfg.network {
        profile.push_str(";; Allow connections to proxy only\n");
        if cfg.proxy_http_port > 0 {
            let _ = writeln!(
                profile,
                "(allow network-outbound (remote ip \"localhost:{}\"))",
                cfg.proxy_http_port
            );
        }
        profile.push_str("(allow network-outbound (remote unix-socket))\n");
    }

    profile
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_profile_blocks_all_network() {
        let profile = generate_profile(&SandboxConfig::default());
        assert!(profile.contains("(allow default)"));
        assert!(profile.contains("(deny network*)"));
        assert!(!profile.contains("network-outbound"));
    }

    #[test]
    fn network_profile_readmits_the_proxy() {
        let cfg = SandboxConfig {
            network: true,
            proxy_http_port: 5555,
            ..SandboxConfig::default()
        };
        let profile = generate_profile(&cfg);
        assert!(profile.contains("(allow network-outbound (remote ip \"localhost:5555\"))"));
        assert!(profile.contains("(allow network-outbound (remote unix-socket))"));
    }
}
