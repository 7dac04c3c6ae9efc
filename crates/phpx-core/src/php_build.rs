//! PHP interpreter resolution and acquisition.
//!
//! Archives are downloaded from the static-build mirror, extracted into a
//! staging directory next to their final location, and promoted with a
//! rename. Every archive entry is checked against path traversal before it
//! is written; symlinks whose resolved target would leave the destination
//! are rejected.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use semver::Version;
use tar::{Archive, EntryType};
use tempfile::NamedTempFile;

use crate::cache;
use crate::index::{archive_filename, Index, Tier};
use crate::net::Source;

/// Result of resolving a PHP requirement against the index.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub version: Version,
    pub tier: Tier,
    pub path: PathBuf,
    pub cached: bool,
}

/// Determine the PHP version and tier needed for a constraint and extension
/// set.
///
/// # Errors
/// Returns an error when an extension is unavailable in every tier or no
/// indexed version satisfies the constraint.
pub fn resolve(idx: &Index, constraint: &str, extensions: &[String]) -> Result<Resolution> {
    let tier = idx.required_tier(extensions)?;

    let version = if constraint.is_empty() {
        idx.latest_version(tier)
            .cloned()
            .ok_or_else(|| anyhow!("no PHP versions available"))?
    } else {
        idx.matching_version(tier, constraint)?
    };

    let path = cache::php_path(&version.to_string(), tier.as_str())?;
    let cached = cache::exists(&path);
    Ok(Resolution {
        version,
        tier,
        path,
        cached,
    })
}

/// Ensure the resolved PHP binary is present in the cache, downloading and
/// extracting the archive if necessary.
///
/// # Errors
/// Returns an error on download or extraction failure; a partial extraction
/// is never promoted into the cache.
pub fn ensure_php(
    client: &Client,
    mirror: &Source,
    res: &Resolution,
    progress: bool,
) -> Result<()> {
    if res.cached {
        return Ok(());
    }
    download(client, mirror, &res.version, res.tier, &res.path, progress)
}

fn download(
    client: &Client,
    mirror: &Source,
    version: &Version,
    tier: Tier,
    dest_path: &Path,
    progress: bool,
) -> Result<()> {
    let filename = archive_filename(version);
    if progress {
        eprintln!("Downloading PHP {version} ({tier} tier)...");
    }
    tracing::debug!(%version, %tier, "downloading {filename}");

    let bytes = mirror
        .fetch(client, &format!("{tier}/{filename}"))
        .context("failed to download PHP")?;

    // dest_path is <cache>/php/<version>-<tier>/bin/php; the install root is
    // the <version>-<tier> directory.
    let install_root = dest_path
        .parent()
        .and_then(Path::parent)
        .ok_or_else(|| anyhow!("invalid PHP cache path {}", dest_path.display()))?;
    let php_root = install_root
        .parent()
        .ok_or_else(|| anyhow!("invalid PHP cache path {}", dest_path.display()))?;
    cache::ensure_dir(php_root)?;

    let mut archive_file = NamedTempFile::new().context("failed to create temporary archive")?;
    std::io::Write::write_all(&mut archive_file, &bytes)
        .context("failed to write temporary archive")?;

    let stage = tempfile::tempdir_in(php_root)
        .with_context(|| format!("failed to create staging directory in {}", php_root.display()))?;
    let file = File::open(archive_file.path()).context("failed to reopen archive")?;
    extract_tar_gz(file, stage.path()).context("failed to extract PHP")?;

    let staged_binary = stage.path().join("bin").join("php");
    if !staged_binary.exists() {
        bail!("PHP binary not found after extraction");
    }

    let stage_path = stage.keep();
    if install_root.exists() {
        fs::remove_dir_all(install_root).with_context(|| {
            format!("failed to remove previous install at {}", install_root.display())
        })?;
    }
    if let Err(err) = fs::rename(&stage_path, install_root) {
        // Clean the staging directory on failure for predictable retries.
        let _ = fs::remove_dir_all(&stage_path);
        return Err(err).with_context(|| {
            format!("failed to move PHP into place at {}", install_root.display())
        });
    }
    Ok(())
}

/// True when `target` stays inside `base` after normalizing `.`/`..`
/// components. Absolute entries and any traversal above `base` are rejected.
fn is_path_within_dir(target: &Path, base: &Path) -> bool {
    let Ok(rel) = target.strip_prefix(base) else {
        return false;
    };
    let mut depth: i64 = 0;
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

fn extract_tar_gz<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);

    for entry in archive.entries().context("failed to read archive")? {
        let mut entry = entry.context("failed to read archive entry")?;
        let rel = entry.path().context("invalid archive entry path")?.into_owned();
        let target = dest.join(&rel);

        if !is_path_within_dir(&target, dest) {
            bail!("invalid tar entry path: {}", rel.display());
        }

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)
                    .with_context(|| format!("failed to create {}", target.display()))?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                entry
                    .unpack(&target)
                    .with_context(|| format!("failed to extract {}", target.display()))?;
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .context("invalid symlink entry")?
                    .ok_or_else(|| anyhow!("symlink entry without target"))?
                    .into_owned();
                let resolved = target.parent().unwrap_or(dest).join(&link);
                if !is_path_within_dir(&resolved, dest) {
                    bail!(
                        "invalid symlink target: {} -> {}",
                        rel.display(),
                        link.display()
                    );
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                entry
                    .unpack(&target)
                    .with_context(|| format!("failed to extract {}", target.display()))?;
            }
            _ => {}
        }
    }
    Ok(())
}
