//! On-disk cache layout under `~/.phpx`.
//!
//! Every leaf is content-addressed: PHP binaries by `(version, tier)`, tool
//! installations by `(package, version)`, dependency sets by a SHA-256 over
//! the normalized requirement list. A leaf is considered populated only when
//! its terminal marker file exists (the interpreter executable, the autoload
//! entry point, the tool binary); anything else is treated as a cache miss
//! and re-populated.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use dirs_next::home_dir;
use sha2::{Digest, Sha256};

/// Resolve the base cache directory.
///
/// Honors `PHPX_CACHE_PATH` when set, otherwise defaults to `~/.phpx`.
///
/// # Errors
/// Returns an error if no home directory can be determined.
pub fn cache_dir() -> Result<PathBuf> {
    if let Some(override_path) = env::var_os("PHPX_CACHE_PATH") {
        return absolutize(PathBuf::from(override_path));
    }
    let home = home_dir().ok_or_else(|| anyhow!("home directory not found"))?;
    Ok(home.join(".phpx"))
}

pub fn index_dir() -> Result<PathBuf> {
    Ok(cache_dir()?.join("index"))
}

pub fn php_dir() -> Result<PathBuf> {
    Ok(cache_dir()?.join("php"))
}

/// Path to a specific PHP binary, e.g. `php/8.4.17-common/bin/php`.
pub fn php_path(version: &str, tier: &str) -> Result<PathBuf> {
    Ok(php_dir()?
        .join(format!("{version}-{tier}"))
        .join("bin")
        .join("php"))
}

pub fn deps_dir() -> Result<PathBuf> {
    Ok(cache_dir()?.join("deps"))
}

pub fn deps_path(hash: &str) -> Result<PathBuf> {
    Ok(deps_dir()?.join(hash))
}

pub fn tools_dir() -> Result<PathBuf> {
    Ok(cache_dir()?.join("tools"))
}

/// Path to a specific tool installation. Slashes in the package name are
/// replaced with dashes to produce a single directory component.
pub fn tool_path(pkg: &str, version: &str) -> Result<PathBuf> {
    let safe_pkg = pkg.replace('/', "-");
    Ok(tools_dir()?.join(format!("{safe_pkg}-{version}")))
}

pub fn composer_dir() -> Result<PathBuf> {
    Ok(cache_dir()?.join("composer"))
}

pub fn composer_path(version: &str) -> Result<PathBuf> {
    Ok(composer_dir()?.join(version).join("composer.phar"))
}

/// Compute the dependency-set cache key.
///
/// Requirement strings are lowercased, sorted, and joined with newlines
/// before hashing, so any two requirement lists that are equal as multisets
/// modulo case map to the same cache leaf.
#[must_use]
pub fn deps_hash(packages: &[String]) -> String {
    let mut normalized: Vec<String> = packages.iter().map(|pkg| pkg.to_lowercase()).collect();
    normalized.sort();
    let mut hasher = Sha256::new();
    hasher.update(normalized.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

#[must_use]
pub fn exists(path: &Path) -> bool {
    path.exists()
}

/// Create a directory (and parents) if it does not exist yet.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

/// Remove cache entries for the given target.
///
/// Valid targets: `php`, `deps`, `tools`, `index`, `composer`, `all`.
///
/// # Errors
/// Returns an error for an unknown target or when removal fails.
pub fn clean(target: &str) -> Result<()> {
    let base = cache_dir()?;
    let path = match target {
        "php" | "deps" | "tools" | "index" | "composer" => base.join(target),
        "all" => base,
        other => bail!("unknown cache target '{other}' (expected php, deps, tools, index, composer, or all)"),
    };
    if path.exists() {
        fs::remove_dir_all(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

fn absolutize(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(env::current_dir()
            .context("failed to resolve PHPX_CACHE_PATH")?
            .join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deps_hash_normalizes_case_and_order() {
        let a = vec![
            "Guzzlehttp/Guzzle:^7.0".to_string(),
            "monolog/monolog:^3.0".to_string(),
        ];
        let b = vec![
            "monolog/monolog:^3.0".to_string(),
            "guzzlehttp/guzzle:^7.0".to_string(),
        ];
        assert_eq!(deps_hash(&a), deps_hash(&b));
    }

    #[test]
    fn deps_hash_distinguishes_different_sets() {
        let a = vec!["vendor/a:^1.0".to_string()];
        let b = vec!["vendor/b:^1.0".to_string()];
        assert_ne!(deps_hash(&a), deps_hash(&b));
    }

    #[test]
    fn deps_hash_of_empty_set_is_stable() {
        assert_eq!(deps_hash(&[]), deps_hash(&[]));
    }

    #[test]
    fn tool_path_replaces_slashes() {
        let path = tool_path("phpstan/phpstan", "1.10.0").expect("tool path");
        let leaf = path.file_name().and_then(|n| n.to_str()).expect("leaf");
        assert_eq!(leaf, "phpstan-phpstan-1.10.0");
    }

    #[test]
    fn clean_rejects_unknown_target() {
        assert!(clean("vendor").is_err());
    }
}
