//! Shared command construction and child execution for the backends.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use super::config::{InputMode, OutputMode, SandboxConfig};
use super::ExecResult;
use crate::context::ExecContext;
use crate::env_filter::filter_env;
use crate::proxy::SANDBOX_BRIDGE_PORT;

/// Exit code surfaced when the wall-clock deadline kills the child.
pub(crate) const EXIT_DEADLINE_EXCEEDED: i32 = 124;

pub(crate) fn command_exists(name: &str) -> bool {
    which::which(name).is_ok()
}

pub(crate) fn has_socat() -> bool {
    command_exists("socat")
}

/// Escape a string for safe use in shell commands: single quotes with
/// embedded quotes broken out.
#[must_use]
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Construct the interpreter's argument vector (excluding the binary itself):
/// `-d` limits, the autoload prepend, the script, and its arguments.
pub(crate) fn build_php_args(cfg: &SandboxConfig) -> Vec<String> {
    let mut args = Vec::new();
    if cfg.memory_mb > 0 {
        args.push("-d".to_string());
        args.push(format!("memory_limit={}M", cfg.memory_mb));
    }
    if cfg.cpu_seconds > 0 {
        args.push("-d".to_string());
        args.push(format!("max_execution_time={}", cfg.cpu_seconds));
    }
    if let Some(autoload) = &cfg.autoload_file {
        args.push("-d".to_string());
        args.push(format!("auto_prepend_file={}", autoload.display()));
    }
    args.push(cfg.script_path.display().to_string());
    args.extend(cfg.script_args.iter().cloned());
    args
}

/// Construct a fully escaped interpreter command line for backends that run
/// through a subshell.
pub(crate) fn build_php_command_line(cfg: &SandboxConfig) -> String {
    let mut command = shell_escape(&cfg.php_binary.display().to_string());
    for arg in build_php_args(cfg) {
        command.push(' ');
        command.push_str(&shell_escape(&arg));
    }
    command
}

/// Shell fragment that starts a socat forwarder from the reserved loopback
/// port to the proxy's Unix socket, waits for it with a retry loop (not a
/// sleep), runs the interpreter, and exits with its code.
pub(crate) fn build_socat_bridge_command(socket_path: &str, php_cmd: &str) -> String {
    format!(
        "socat TCP-LISTEN:{port},fork,reuseaddr UNIX-CONNECT:{socket} &\n\
         SOCAT_PID=$!\n\
         for i in 1 2 3 4 5 6 7 8 9 10; do\n\
         \x20 if nc -z 127.0.0.1 {port} 2>/dev/null; then break; fi\n\
         \x20 sleep 0.05\n\
         done\n\
         {php_cmd}\n\
         EXIT_CODE=$?\n\
         kill $SOCAT_PID 2>/dev/null\n\
         exit $EXIT_CODE",
        port = SANDBOX_BRIDGE_PORT,
        socket = shell_escape(socket_path),
        php_cmd = php_cmd,
    )
}

/// Proxy environment hints pointing at the in-sandbox bridge port.
pub(crate) fn bridge_proxy_env() -> Vec<(String, String)> {
    let addr = format!("http://127.0.0.1:{SANDBOX_BRIDGE_PORT}");
    vec![
        ("HTTP_PROXY".to_string(), addr.clone()),
        ("HTTPS_PROXY".to_string(), addr.clone()),
        ("http_proxy".to_string(), addr.clone()),
        ("https_proxy".to_string(), addr.clone()),
        ("ALL_PROXY".to_string(), addr),
    ]
}

/// Environment handed to the confined child.
pub(crate) enum ChildEnv {
    /// Inherit the parent environment unchanged (passthrough backend only).
    Inherit,
    /// Replace the environment with the given variables.
    Pairs(Vec<(String, String)>),
}

/// Safelisted environment plus proxy variables and backend extras.
pub(crate) fn sandbox_env(cfg: &SandboxConfig, extra: &[(String, String)]) -> Vec<(String, String)> {
    let mut env = filter_env(&cfg.allowed_env_vars);
    env.extend(cfg.proxy_env.iter().cloned());
    env.extend(extra.iter().cloned());
    env
}

/// Spawn a child with the configured I/O wiring, wait for it under the
/// context's deadline, and collect the result.
///
/// On deadline expiry or cancellation the child is killed and the exit code
/// is surfaced as 124 with a diagnostic.
pub(crate) fn run_command(
    program: &str,
    args: &[String],
    env: ChildEnv,
    ctx: &ExecContext,
    cfg: &SandboxConfig,
) -> Result<ExecResult> {
    let mut command = Command::new(program);
    command.args(args);
    if !cfg.work_dir.as_os_str().is_empty() {
        command.current_dir(&cfg.work_dir);
    }
    match env {
        ChildEnv::Inherit => {}
        ChildEnv::Pairs(pairs) => {
            command.env_clear();
            command.envs(pairs);
        }
    }
    command.stdin(match cfg.stdin {
        InputMode::Closed => Stdio::null(),
        InputMode::Inherit => Stdio::inherit(),
    });
    command.stdout(match cfg.stdout {
        OutputMode::Buffered => Stdio::piped(),
        OutputMode::Inherit => Stdio::inherit(),
    });
    command.stderr(match cfg.stderr {
        OutputMode::Buffered => Stdio::piped(),
        OutputMode::Inherit => Stdio::inherit(),
    });

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;

    let stdout_reader = child.stdout.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });

    let mut killed = false;
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed to wait for {program}"))?
        {
            break status;
        }
        if ctx.should_stop() {
            if ctx.deadline_exceeded() {
                tracing::warn!("execution deadline exceeded; killing child");
            } else {
                tracing::warn!("execution cancelled; killing child");
            }
            killed = true;
            let _ = child.kill();
            break child
                .wait()
                .with_context(|| format!("failed to reap {program}"))?;
        }
        thread::sleep(Duration::from_millis(50));
    };

    let stdout = stdout_reader
        .map(|handle| handle.join().unwrap_or_default())
        .unwrap_or_default();
    let stderr = stderr_reader
        .map(|handle| handle.join().unwrap_or_default())
        .unwrap_or_default();

    let exit_code = if killed {
        EXIT_DEADLINE_EXCEEDED
    } else {
        status.code().unwrap_or(-1)
    };

    Ok(ExecResult {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn shell_escape_wraps_and_breaks_out_quotes() {
        assert_eq!(shell_escape("plain"), "'plain'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn php_args_include_limits_and_autoload() {
        let cfg = SandboxConfig {
            memory_mb: 128,
            cpu_seconds: 30,
            autoload_file: Some(PathBuf::from("/cache/deps/abc/vendor/autoload.php")),
            script_path: PathBuf::from("/work/script.php"),
            script_args: vec!["--flag".to_string()],
            ..SandboxConfig::default()
        };
        let args = build_php_args(&cfg);
        assert_eq!(
            args,
            vec![
                "-d",
                "memory_limit=128M",
                "-d",
                "max_execution_time=30",
                "-d",
                "auto_prepend_file=/cache/deps/abc/vendor/autoload.php",
                "/work/script.php",
                "--flag",
            ]
        );
    }

    #[test]
    fn php_args_omit_unset_limits() {
        let cfg = SandboxConfig {
            script_path: PathBuf::from("/work/script.php"),
            ..SandboxConfig::default()
        };
        assert_eq!(build_php_args(&cfg), vec!["/work/script.php"]);
    }

    #[test]
    fn socat_bridge_polls_instead_of_sleeping() {
        let bridge = build_socat_bridge_command("/tmp/proxy.sock", "'php' 'script.php'");
        assert!(bridge.contains(&format!("TCP-LISTEN:{SANDBOX_BRIDGE_PORT}")));
        assert!(bridge.contains("UNIX-CONNECT:'/tmp/proxy.sock'"));
        assert!(bridge.contains(&format!("nc -z 127.0.0.1 {SANDBOX_BRIDGE_PORT}")));
        assert!(bridge.contains("kill $SOCAT_PID"));
        assert!(bridge.contains("exit $EXIT_CODE"));
    }

    #[cfg(unix)]
    #[test]
    fn run_command_captures_output_and_exit_code() {
        let cfg = SandboxConfig::default();
        let ctx = ExecContext::new();
        let result = run_command(
            "/bin/sh",
            &[
                "-c".to_string(),
                "printf out && printf err >&2; exit 7".to_string(),
            ],
            ChildEnv::Inherit,
            &ctx,
            &cfg,
        )
        .expect("run");
        assert_eq!(result.exit_code, 7);
        assert_eq!(result.stdout, "out");
        assert_eq!(result.stderr, "err");
    }

    #[cfg(unix)]
    #[test]
    fn run_command_kills_the_child_on_deadline() {
        let cfg = SandboxConfig::default();
        let ctx = ExecContext::new().with_timeout(Duration::from_millis(100));
        let start = std::time::Instant::now();
        let result = run_command(
            "/bin/sh",
            &["-c".to_string(), "sleep 5".to_string()],
            ChildEnv::Inherit,
            &ctx,
            &cfg,
        )
        .expect("run");
        assert_eq!(result.exit_code, EXIT_DEADLINE_EXCEEDED);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn run_command_replaces_the_environment_for_confined_children() {
        let cfg = SandboxConfig::default();
        let ctx = ExecContext::new();
        let result = run_command(
            "/bin/sh",
            &["-c".to_string(), "printf \"%s\" \"$PHPX_MARKER\"".to_string()],
            ChildEnv::Pairs(vec![("PHPX_MARKER".to_string(), "set".to_string())]),
            &ctx,
            &cfg,
        )
        .expect("run");
        assert_eq!(result.stdout, "set");
    }

    #[cfg(unix)]
    #[test]
    fn run_command_reports_spawn_failures() {
        let cfg = SandboxConfig::default();
        let ctx = ExecContext::new();
        let err = run_command(
            "/nonexistent/phpx-test-binary",
            &[],
            ChildEnv::Inherit,
            &ctx,
            &cfg,
        )
        .expect_err("spawn must fail");
        assert!(err.to_string().contains("failed to start"));
    }
}
