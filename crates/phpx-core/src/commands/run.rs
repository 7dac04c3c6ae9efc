//! The `run` orchestrator: metadata, resolution, provisioning, sandbox
//! selection, execution.

use std::env;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cache;
use crate::context::ExecContext;
use crate::executor::{run_script, ScriptOptions};
use crate::index::{download_composer, Index, IndexSources};
use crate::installer;
use crate::metadata;
use crate::net::build_http_client;
use crate::php_build;
use crate::sandbox::{self, InputMode, OutputMode};

use super::split_csv;

/// Parameters of a `phpx run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Script path, or `-` to read the script from stdin.
    pub script: String,
    pub args: Vec<String>,

    pub php: String,
    pub packages: String,
    pub extensions: String,

    pub sandbox: bool,
    pub offline: bool,
    pub allow_host: String,
    pub allow_read: String,
    pub allow_write: String,
    pub allow_env: String,
    pub memory_mb: u32,
    pub timeout_secs: u64,
    pub cpu_seconds: u32,

    pub verbose: bool,
    pub quiet: bool,
}

/// Run a script end to end, returning the exit code to propagate.
///
/// # Errors
/// Returns an error for any runner failure before or during launch; a child
/// that starts and exits non-zero is not an error.
pub fn run_script_command(req: &RunRequest) -> Result<i32> {
    // Stdin scripts are spooled to a temp file that lives for the whole run.
    let mut stdin_guard = None;
    let script_path = if req.script == "-" {
        let mut content = Vec::new();
        std::io::stdin()
            .read_to_end(&mut content)
            .context("failed to read stdin")?;
        let mut file = tempfile::Builder::new()
            .prefix("phpx-")
            .suffix(".php")
            .tempfile()
            .context("failed to create temp file")?;
        std::io::Write::write_all(&mut file, &content).context("failed to write temp file")?;
        let path = file.path().to_path_buf();
        stdin_guard = Some(file);
        path
    } else {
        let path = PathBuf::from(&req.script);
        if !path.exists() {
            bail!("script not found: {}", req.script);
        }
        if path.is_absolute() {
            path
        } else {
            env::current_dir()
                .context("failed to resolve working directory")?
                .join(path)
        }
    };

    let content = fs::read_to_string(&script_path).context("failed to read script")?;
    let meta = metadata::parse(&content).context("failed to parse metadata")?;

    // CLI flags extend or override the inline manifest.
    let php_constraint = if req.php.is_empty() {
        meta.php.clone()
    } else {
        req.php.clone()
    };
    let mut packages = meta.packages.clone();
    packages.extend(split_csv(&req.packages));
    let mut extensions = meta.extensions.clone();
    extensions.extend(split_csv(&req.extensions));

    let client = build_http_client()?;
    let sources = IndexSources::from_env();

    tracing::debug!("loading index");
    let idx = Index::load(&client, &sources).context("failed to load index")?;

    if php_constraint.is_empty() {
        tracing::debug!("resolving latest PHP version");
    } else {
        tracing::debug!(constraint = %php_constraint, "resolving PHP version");
    }
    let res = php_build::resolve(&idx, &php_constraint, &extensions).with_context(|| {
        if php_constraint.is_empty() {
            "failed to resolve PHP".to_string()
        } else {
            format!("failed to resolve PHP for constraint {php_constraint:?}")
        }
    })?;
    tracing::debug!(version = %res.version, tier = %res.tier, "matched PHP");

    let show_progress = !req.quiet && !req.verbose;
    php_build::ensure_php(&client, &sources.mirror, &res, show_progress)?;
    if !res.cached {
        tracing::debug!(path = %res.path.display(), "PHP binary downloaded");
    }

    // Materialize the dependency set if the script declares one.
    let mut autoload_path = None;
    if !packages.is_empty() {
        let hash = cache::deps_hash(&packages);
        let deps_path = cache::deps_path(&hash)?;
        let autoload = deps_path.join("vendor").join("autoload.php");

        if cache::exists(&autoload) {
            tracing::debug!("dependencies cached");
        } else {
            tracing::debug!(path = %deps_path.display(), "installing dependencies");
            let release = idx.select_composer(&res.version)?;
            let composer_path = download_composer(&client, &sources.composer, release)
                .context("failed to download Composer")?;
            tracing::debug!(version = %release.version, "using Composer");
            installer::install_deps(&res.path, &composer_path, &packages, &deps_path, req.verbose)?;
        }
        autoload_path = Some(autoload);
    }

    // Pick the confinement backend.
    let backend: Box<dyn sandbox::Sandbox> = if req.sandbox {
        let backend = sandbox::detect();
        if !backend.is_sandboxed() {
            bail!("--sandbox requested but no sandbox is available on this system");
        }
        backend
    } else if req.offline || !req.allow_host.is_empty() {
        let backend = sandbox::detect_network_only();
        if !backend.is_sandboxed() {
            bail!("--offline/--allow-host requires network sandboxing, but no sandbox is available on this system");
        }
        backend
    } else {
        Box::new(sandbox::Passthrough)
    };

    let opts = ScriptOptions {
        script_path: script_path.clone(),
        php_binary: res.path.clone(),
        autoload_file: autoload_path,
        network: !req.offline,
        allowed_hosts: split_csv(&req.allow_host),
        allowed_env_vars: split_csv(&req.allow_env),
        read_paths: split_csv(&req.allow_read).into_iter().map(PathBuf::from).collect(),
        write_paths: split_csv(&req.allow_write).into_iter().map(PathBuf::from).collect(),
        memory_mb: req.memory_mb,
        timeout: Duration::from_secs(req.timeout_secs),
        cpu_seconds: req.cpu_seconds,
        args: req.args.clone(),
        stdin: if req.script == "-" {
            InputMode::Closed
        } else {
            InputMode::Inherit
        },
        stdout: OutputMode::Inherit,
        stderr: OutputMode::Inherit,
        verbose: req.verbose,
    };

    let result = run_script(backend.as_ref(), &ExecContext::new(), &opts)?;
    tracing::debug!(code = result.exit_code, "script finished");

    drop(stdin_guard);
    Ok(result.exit_code)
}
