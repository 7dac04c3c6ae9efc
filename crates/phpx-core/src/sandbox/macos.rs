//! Full confinement on macOS via `sandbox-exec` and a generated Seatbelt
//! profile.
//!
//! Seatbelt subpath rules do not follow symlinks, so every user-controlled
//! path is resolved eagerly before it is written into the profile (the
//! resolved paths are logged at debug level). Embedded backslashes and double
//! quotes are escaped to keep malicious paths from breaking out of the
//! policy document.

use std::env;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::common::{build_php_args, command_exists, run_command, sandbox_env, ChildEnv};
use super::config::SandboxConfig;
use super::{ExecResult, Sandbox};
use crate::context::ExecContext;

pub struct MacOs;

impl Sandbox for MacOs {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn is_sandboxed(&self) -> bool {
        true
    }

    fn available(&self) -> bool {
        env::consts::OS == "macos" && command_exists("sandbox-exec")
    }

    fn execute(&self, ctx: &ExecContext, cfg: &SandboxConfig) -> Result<ExecResult> {
        let profile = generate_profile(cfg);
        let profile_path = write_profile(&profile)?;

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

/// Write the profile to a temporary file kept alive for the duration of the
/// run (the file is removed when the returned path guard drops).
fn write_profile(profile: &str) -> Result<tempfile::TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("phpx-sandbox-")
        .suffix(".sb")
        .tempfile()
        .context("failed to create sandbox profile")?;
    file.write_all(profile.as_bytes())
        .context("failed to write sandbox profile")?;
    Ok(file.into_temp_path())
}

/// Resolve symlinks for Seatbelt compatibility. Paths that do not exist yet
/// are passed through unchanged.
fn resolve_path(path: &Path) -> PathBuf {
    match std::fs::canonicalize(path) {
        Ok(resolved) => {
            if resolved != path {
                tracing::debug!(
                    original = %path.display(),
                    resolved = %resolved.display(),
                    "resolved symlinks for sandbox profile"
                );
            }
            resolved
        }
        Err(_) => path.to_path_buf(),
    }
}

/// Escape a path for inclusion in a Seatbelt profile string literal.
fn seatbelt_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn escaped(path: &Path) -> String {
    seatbelt_escape(&resolve_path(path).display().to_string())
}

/// Generate a deny-default Seatbelt profile admitting only what a static PHP
/// binary needs.
fn generate_profile(cfg: &SandboxConfig) -> String {
    let mut profile = String::new();
    profile.push_str("(version 1)\n(deny default)\n\n");

    profile.push_str(";; Process operations\n");
    profile.push_str("(allow process*)\n");
    profile.push_str("(allow sysctl-read)\n");
    profile.push_str("(allow mach-lookup)\n");
    profile.push_str("(allow signal (target self))\n\n");

    profile.push_str(";; Minimal device access\n");
    for dev in ["/dev/null", "/dev/urandom", "/dev/random"] {
        let _ = writeln!(profile, "(allow file-read* (literal \"{dev}\"))");
    }
    profile.push('\n');

    profile.push_str(";; Timezone data\n");
    profile.push_str("(allow file-read* (subpath \"/usr/share/zoneinfo\"))\n");
    profile.push_str("(allow file-read* (subpath \"/var/db/timezone\"))\n");
    profile.push_str("(allow file-read* (literal \"/etc/localtime\"))\n");
    profile.push_str("(allow file-read* (literal \"/private/etc/localtime\"))\n\n");

    if cfg.network {
        profile.push_str(";; DNS resolution\n");
        for dns in [
            "/etc/resolv.conf",
            "/private/etc/resolv.conf",
            "/etc/hosts",
            "/private/etc/hosts",
        ] {
            let _ = writeln!(profile, "(allow file-read* (literal \"{dns}\"))");
        }
        profile.push('\n');
    }

    if !cfg.php_binary.as_os_str().is_empty() {
        profile.push_str(";; PHP binary\n");
        let _ = writeln!(
            profile,
            "(allow file-read* (literal \"{}\"))\n",
            escaped(&cfg.php_binary)
        );
    }

    if !cfg.script_path.as_os_str().is_empty() {
        profile.push_str(";; Script file\n");
        let _ = writeln!(
            profile,
            "(allow file-read* (literal \"{}\"))\n",
            escaped(&cfg.script_path)
        );
    }

    if let Some(autoload) = &cfg.autoload_file {
        if let Some(vendor_dir) = autoload.parent() {
            profile.push_str(";; Vendor directory\n");
            let _ = writeln!(
                profile,
                "(allow file-read* (subpath \"{}\"))\n",
                escaped(vendor_dir)
            );
        }
    }

    if !cfg.readable_paths.is_empty() {
        profile.push_str(";; Additional readable paths\n");
        for path in &cfg.readable_paths {
            let _ = writeln!(profile, "(allow file-read* (subpath \"{}\"))", escaped(path));
        }
        profile.push('\n');
    }

    profile.push_str(";; Minimal write access\n");
    profile.push_str("(allow file-write* (literal \"/dev/null\"))\n\n");

    if !cfg.writable_paths.is_empty() {
        profile.push_str(";; Additional writable paths\n");
        for path in &cfg.writable_paths {
            let escaped = escaped(path);
            let _ = writeln!(profile, "(allow file-write* (subpath \"{escaped}\"))");
            let _ = writeln!(profile, "(allow file-read* (subpath \"{escaped}\"))");
        }
        profile.push('\n');
    }

    if cfg.network {
        profile.push_str(";; Network: proxy connections only\n");
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

    fn base_config() -> SandboxConfig {
        SandboxConfig {
            php_binary: PathBuf::from("/cache/php/8.4.17-common/bin/php"),
            script_path: PathBuf::from("/work/script.php"),
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn profile_denies_by_default() {
        let profile = generate_profile(&base_config());
        assert!(profile.starts_with("(version 1)\n(deny default)"));
        assert!(profile.contains("(allow process*)"));
        assert!(profile.contains("(allow signal (target self))"));
        assert!(profile.contains("(allow file-write* (literal \"/dev/null\"))"));
    }

    #[test]
    fn offline_profile_grants_no_network() {
        let profile = generate_profile(&base_config());
        assert!(!profile.contains("network-outbound"));
        assert!(!profile.contains("resolv.conf"));
    }

    #[test]
    fn network_profile_admits_only_the_proxy() {
        let cfg = SandboxConfig {
            network: true,
            proxy_http_port: 12345,
            ..base_config()
        };
        let profile = generate_profile(&cfg);
        assert!(profile.contains("(allow network-outbound (remote ip \"localhost:12345\"))"));
        assert!(profile.contains("(allow network-outbound (remote unix-socket))"));
        assert!(profile.contains("(allow file-read* (literal \"/etc/resolv.conf\"))"));
    }

    #[test]
    fn writable_paths_also_get_read_access() {
        let cfg = SandboxConfig {
            writable_paths: vec![PathBuf::from("/work/output")],
            ..base_config()
        };
        let profile = generate_profile(&cfg);
        assert!(profile.contains("(allow file-write* (subpath \"/work/output\"))"));
        assert!(profile.contains("(allow file-read* (subpath \"/work/output\"))"));
    }

    #[test]
    fn quotes_and_backslashes_are_escaped() {
        assert_eq!(seatbelt_escape(r#"/tmp/a"b"#), r#"/tmp/a\"b"#);
        assert_eq!(seatbelt_escape(r"/tmp/a\b"), r"/tmp/a\\b");
    }
}
