//! Dependency and tool installation through the bootstrap Composer phar.
//!
//! A `composer.json` is generated into the destination directory and the
//! interpreter is invoked with the phar to materialize `vendor/`. Package
//! install scripts run with the sanitized environment so host secrets never
//! leak into them.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::cache;
use crate::env_filter::filter_env;

#[derive(Serialize)]
struct ComposerManifest {
    require: BTreeMap<String, String>,
    config: ComposerConfig,
}

#[derive(Serialize)]
struct ComposerConfig {
    #[serde(rename = "allow-plugins")]
    allow_plugins: bool,
    #[serde(rename = "optimize-autoloader")]
    optimize_autoloader: bool,
}

/// Install a set of `name[:constraint]` requirements into `dest/vendor`.
///
/// # Errors
/// Returns an error when the manifest cannot be written or Composer fails.
pub fn install_deps(
    php_path: &Path,
    composer_path: &Path,
    packages: &[String],
    dest: &Path,
    verbose: bool,
) -> Result<()> {
    let mut require = BTreeMap::new();
    for pkg in packages {
        let (name, constraint) = split_requirement(pkg);
        let constraint = if constraint.is_empty() { "*" } else { constraint };
        require.insert(name.to_string(), constraint.to_string());
    }
    write_manifest(dest, require)?;
    run_composer_install(php_path, composer_path, dest, verbose)
        .with_context(|| format!("failed to install packages {packages:?}"))
}

/// Install a single tool package at an exact version into `dest/vendor`.
///
/// # Errors
/// Returns an error when the manifest cannot be written or Composer fails.
pub fn install_tool(
    php_path: &Path,
    composer_path: &Path,
    pkg: &str,
    version: &str,
    dest: &Path,
    verbose: bool,
) -> Result<()> {
    let constraint = if version.is_empty() { "*" } else { version };
    let mut require = BTreeMap::new();
    require.insert(pkg.to_string(), constraint.to_string());
    write_manifest(dest, require)?;
    run_composer_install(php_path, composer_path, dest, verbose)
        .with_context(|| format!("failed to install tool {pkg}@{version}"))
}

fn write_manifest(dest: &Path, require: BTreeMap<String, String>) -> Result<()> {
    cache::ensure_dir(dest)?;
    let manifest = ComposerManifest {
        require,
        config: ComposerConfig {
            allow_plugins: false,
            optimize_autoloader: true,
        },
    };
    let path = dest.join("composer.json");
    let mut data = serde_json::to_vec_pretty(&manifest).context("failed to serialize composer.json")?;
    data.push(b'\n');
    fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))
}

fn run_composer_install(
    php_path: &Path,
    composer_path: &Path,
    dest: &Path,
    verbose: bool,
) -> Result<()> {
    let mut command = Command::new(php_path);
    command
        .arg(composer_path)
        .args([
            "install",
            "--no-dev",
            "--no-interaction",
            "--no-scripts",
            "--prefer-dist",
            "--optimize-autoloader",
        ])
        .current_dir(dest)
        .env_clear()
        .envs(filter_env(&[]))
        .env("COMPOSER_HOME", dest.join(".composer"));
    if !verbose {
        command.arg("--quiet");
    }

    if verbose {
        let status = command
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("failed to start {}", php_path.display()))?;
        if !status.success() {
            bail!("composer install exited with {}", status.code().unwrap_or(-1));
        }
    } else {
        let output = command
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to start {}", php_path.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "composer install exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
    }
    Ok(())
}

/// Split `vendor/package:constraint` on the last colon.
fn split_requirement(pkg: &str) -> (&str, &str) {
    match pkg.rfind(':') {
        Some(idx) => (&pkg[..idx], &pkg[idx + 1..]),
        None => (pkg, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_requirement_uses_last_colon() {
        assert_eq!(
            split_requirement("vendor/pkg:^1.0"),
            ("vendor/pkg", "^1.0")
        );
        assert_eq!(split_requirement("vendor/pkg"), ("vendor/pkg", ""));
        assert_eq!(
            split_requirement("vendor/pkg:>=1.0 <2.0"),
            ("vendor/pkg", ">=1.0 <2.0")
        );
    }

    #[test]
    fn manifest_pins_install_policy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut require = BTreeMap::new();
        require.insert("vendor/pkg".to_string(), "^1.0".to_string());
        require.insert("vendor/other".to_string(), "*".to_string());
        write_manifest(temp.path(), require).expect("write manifest");

        let raw = fs::read_to_string(temp.path().join("composer.json")).expect("read");
        let parsed: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(parsed["require"]["vendor/pkg"], "^1.0");
        assert_eq!(parsed["require"]["vendor/other"], "*");
        assert_eq!(parsed["config"]["allow-plugins"], false);
        assert_eq!(parsed["config"]["optimize-autoloader"], true);
    }
}
