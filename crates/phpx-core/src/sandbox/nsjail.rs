//! Seccomp-based confinement via nsjail, configured entirely through
//! command-line flags with the same mount set as the namespace backend.

use std::env;

use anyhow::Result;

use super::common::{build_php_args, command_exists, run_command, sandbox_env, ChildEnv};
use super::config::SandboxConfig;
use super::{ExecResult, Sandbox};
use crate::context::ExecContext;

pub struct Nsjail;

impl Sandbox for Nsjail {
    fn name(&self) -> &'static str {
        "nsjail"
    }

    fn is_sandboxed(&self) -> bool {
        true
    }

    fn available(&self) -> bool {
        env::consts::OS == "linux" && command_exists("nsjail")
    }

    fn execute(&self, ctx: &ExecContext, cfg: &SandboxConfig) -> Result<ExecResult> {
        let args = build_args(cfg);
        run_command(
            "nsjail",
            &args,
            ChildEnv::Pairs(sandbox_env(cfg, &[])),
            ctx,
            cfg,
        )
    }
}

fn bindmount_ro(args: &mut Vec<String>, path: &str) {
    args.push("--bindmount_ro".to_string());
    args.push(format!("{path}:{path}"));
}

fn bindmount_rw(args: &mut Vec<String>, path: &str) {
    args.push("--bindmount".to_string());
    args.push(format!("{path}:{path}"));
}

fn build_args(cfg: &SandboxConfig) -> Vec<String> {
    let mut args = vec![
        "--mode".to_string(),
        "o".to_string(),
        "--user".to_string(),
        "65534".to_string(),
        "--group".to_string(),
        "65534".to_string(),
        "--quiet".to_string(),
    ];

    // Resource limits.
    if !cfg.timeout.is_zero() {
        args.push("--time_limit".to_string());
        args.push(cfg.timeout.as_secs().to_string());
    }
    if cfg.memory_mb > 0 {
        args.push("--rlimit_as".to_string());
        args.push(cfg.memory_mb.to_string());
    }
    if cfg.cpu_seconds > 0 {
        args.push("--rlimit_cpu".to_string());
        args.push(cfg.cpu_seconds.to_string());
    }
    args.extend(
        [
            "--rlimit_fsize",
            "50",
            "--rlimit_nofile",
            "128",
            "--rlimit_nproc",
            "10",
        ]
        .map(str::to_string),
    );

    // nsjail isolates the network namespace by default; keep it reachable
    // only when the proxied network is in use.
    if cfg.network {
        args.push("--disable_clone_newnet".to_string());
    }

    for dev in ["/dev/null", "/dev/urandom", "/dev/random"] {
        bindmount_ro(&mut args, dev);
    }
    bindmount_ro(&mut args, "/usr/share/zoneinfo");
    bindmount_ro(&mut args, "/etc/localtime");

    if cfg.network {
        for dns in ["/etc/resolv.conf", "/etc/hosts", "/etc/nsswitch.conf"] {
            bindmount_ro(&mut args, dns);
        }
    }

    if !cfg.php_binary.as_os_str().is_empty() {
        bindmount_ro(&mut args, &cfg.php_binary.display().to_string());
    }
    if !cfg.script_path.as_os_str().is_empty() {
        bindmount_ro(&mut args, &cfg.script_path.display().to_string());
    }
    if let Some(autoload) = &cfg.autoload_file {
        if let Some(vendor_dir) = autoload.parent() {
            bindmount_ro(&mut args, &vendor_dir.display().to_string());
        }
    }
    for path in &cfg.readable_paths {
        bindmount_ro(&mut args, &path.display().to_string());
    }
    for path in &cfg.writable_paths {
        bindmount_rw(&mut args, &path.display().to_string());
    }

    if !cfg.work_dir.as_os_str().is_empty() {
        args.push("--cwd".to_string());
        args.push(cfg.work_dir.display().to_string());
    }

    args.push("--".to_string());
    args.push(cfg.php_binary.display().to_string());
    args.extend(build_php_args(cfg));
    args
}
