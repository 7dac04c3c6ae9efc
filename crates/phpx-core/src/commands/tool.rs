//! The `tool` orchestrator: registry lookup, interpreter resolution, cached
//! installation, execution from the caller's working directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cache;
use crate::context::ExecContext;
use crate::executor::{run_tool, ToolOptions};
use crate::index::{download_composer, Index, IndexSources};
use crate::installer;
use crate::net::{build_http_client, Source};
use crate::packagist::{
    self, fetch_package, infer_binary, parse_tool_arg, resolve_alias, resolve_version,
};
use crate::php_build;
use crate::sandbox::{self, InputMode, OutputMode};

use super::split_csv;

/// Parameters of a `phpx tool` invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolRequest {
    /// Tool spec: `name`, `name@version`, or `name:constraint`.
    pub tool: String,
    pub args: Vec<String>,

    pub php: String,
    pub extensions: String,
    /// Explicit binary name when it differs from the package short name.
    pub from: String,

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

/// Resolve the package registry source from the environment.
#[must_use]
pub fn registry_source() -> Source {
    Source::from_env("PHPX_PACKAGIST_URL", packagist::DEFAULT_PACKAGIST_URL)
}

/// Run a Composer tool end to end, returning the exit code to propagate.
///
/// # Errors
/// Returns an error for any runner failure before or during launch; a child
/// that starts and exits non-zero is not an error.
pub fn run_tool_command(req: &ToolRequest) -> Result<i32> {
    let (raw_name, version_constraint) = parse_tool_arg(&req.tool);
    let pkg_name = resolve_alias(raw_name);
    tracing::debug!(package = pkg_name, constraint = version_constraint, "tool requested");

    let client = build_http_client()?;
    let registry = registry_source();

    tracing::debug!("fetching package metadata");
    let pkg_info = fetch_package(&client, &registry, pkg_name)?;
    let version = resolve_version(&pkg_info, version_constraint)?;
    tracing::debug!(version = %version.version, "resolved tool version");

    let binary = infer_binary(pkg_name, &version.bin, &req.from)?;
    tracing::debug!(binary = %binary, "inferred tool binary");

    let extensions = split_csv(&req.extensions);

    let sources = IndexSources::from_env();
    tracing::debug!("loading index");
    let idx = Index::load(&client, &sources).context("failed to load index")?;

    // Prefer an explicit constraint, then the package's own PHP requirement.
    let php_constraint = if !req.php.is_empty() {
        req.php.clone()
    } else {
        version.require.get("php").cloned().unwrap_or_default()
    };

    let res = php_build::resolve(&idx, &php_constraint, &extensions)?;
    tracing::debug!(version = %res.version, tier = %res.tier, "matched PHP");

    let show_progress = !req.quiet && !req.verbose;
    php_build::ensure_php(&client, &sources.mirror, &res, show_progress)?;

    let tool_path = cache::tool_path(pkg_name, &version.version)?;
    let binary_path = tool_path.join("vendor").join("bin").join(&binary);

    if cache::exists(&binary_path) {
        tracing::debug!("tool cached");
    } else {
        tracing::debug!(path = %tool_path.display(), "installing tool");
        let release = idx.select_composer(&res.version)?;
        let composer_path = download_composer(&client, &sources.composer, release)
            .context("failed to download Composer")?;
        tracing::debug!(version = %release.version, "using Composer");
        installer::install_tool(
            &res.path,
            &composer_path,
            pkg_name,
            &version.version,
            &tool_path,
            req.verbose,
        )?;
    }

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

    let opts = ToolOptions {
        php_binary: res.path.clone(),
        tool_dir: tool_path,
        binary_name: binary,
        network: !req.offline,
        allowed_hosts: split_csv(&req.allow_host),
        allowed_env_vars: split_csv(&req.allow_env),
        read_paths: split_csv(&req.allow_read).into_iter().map(PathBuf::from).collect(),
        write_paths: split_csv(&req.allow_write).into_iter().map(PathBuf::from).collect(),
        memory_mb: req.memory_mb,
        timeout: Duration::from_secs(req.timeout_secs),
        cpu_seconds: req.cpu_seconds,
        args: req.args.clone(),
        work_dir: None,
        stdin: InputMode::Inherit,
        stdout: OutputMode::Inherit,
        stderr: OutputMode::Inherit,
        verbose: req.verbose,
    };

    let result = run_tool(backend.as_ref(), &ExecContext::new(), &opts)?;
    tracing::debug!(code = result.exit_code, "tool finished");
    Ok(result.exit_code)
}
