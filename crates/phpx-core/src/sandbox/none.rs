//! Passthrough execution without confinement. The single backend that
//! inherits the full parent environment unchanged.

use anyhow::Result;

use super::common::{build_php_args, run_command, ChildEnv};
use super::config::SandboxConfig;
use super::{ExecResult, Sandbox};
use crate::context::ExecContext;

pub struct Passthrough;

impl Sandbox for Passthrough {
    fn name(&self) -> &'static str {
        "none"
    }

    fn is_sandboxed(&self) -> bool {
        false
    }

    fn available(&self) -> bool {
        true
    }

    fn execute(&self, ctx: &ExecContext, cfg: &SandboxConfig) -> Result<ExecResult> {
        let args = build_php_args(cfg);
        run_command(
            &cfg.php_binary.display().to_string(),
            &args,
            ChildEnv::Inherit,
            ctx,
            cfg,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    // The passthrough backend treats the configured interpreter as an opaque
    // program, so a shell stands in for PHP here.
    #[cfg(unix)]
    #[test]
    fn runs_the_script_and_propagates_the_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("script.sh");
        fs::write(&script, "echo hi\nexit 42\n").expect("write script");

        let cfg = SandboxConfig {
            php_binary: PathBuf::from("/bin/sh"),
            script_path: script,
            work_dir: temp.path().to_path_buf(),
            ..SandboxConfig::default()
        };
        let result = Passthrough
            .execute(&ExecContext::new(), &cfg)
            .expect("execute");
        assert_eq!(result.exit_code, 42);
        assert_eq!(result.stdout, "hi\n");
    }

    #[cfg(unix)]
    #[test]
    fn script_arguments_are_forwarded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("script.sh");
        fs::write(&script, "printf \"%s\" \"$1\"\n").expect("write script");

        let cfg = SandboxConfig {
            php_binary: PathBuf::from("/bin/sh"),
            script_path: script,
            script_args: vec!["first".to_string()],
            work_dir: temp.path().to_path_buf(),
            ..SandboxConfig::default()
        };
        let result = Passthrough
            .execute(&ExecContext::new(), &cfg)
            .expect("execute");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "first");
    }
}
