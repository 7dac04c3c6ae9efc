//! Remote index of available PHP builds, per-tier extensions, and Composer
//! releases.
//!
//! The index is fetched from the static-build mirror and getcomposer.org,
//! persisted as individual JSON files under the cache's `index/` directory,
//! and refreshed when the recorded timestamp is older than 24 hours. The
//! timestamp file is written last so a partial refresh never leaves a usable
//! cache behind.

use std::env;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client;
use semver::Version;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use crate::cache;
use crate::net::Source;
use crate::version::matching_version;

pub const DEFAULT_MIRROR_URL: &str = "https://dl.static-php.dev/static-php-cli";
pub const DEFAULT_COMPOSER_URL: &str = "https://getcomposer.org";

const CACHE_TTL: Duration = Duration::hours(24);
const FETCHED_AT_FILE: &str = "fetched_at";

/// Build tier of the static PHP archives: a smaller and a larger extension set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Common,
    Bulk,
}

impl Tier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Common => "common",
            Tier::Bulk => "bulk",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Composer release as published by getcomposer.org.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposerRelease {
    pub path: String,
    pub version: String,
    #[serde(rename = "min-php")]
    pub min_php: u64,
}

/// Remote endpoints feeding the index.
#[derive(Debug, Clone)]
pub struct IndexSources {
    pub mirror: Source,
    pub composer: Source,
}

impl IndexSources {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            mirror: Source::from_env("PHPX_MIRROR_URL", DEFAULT_MIRROR_URL),
            composer: Source::from_env("PHPX_COMPOSER_URL", DEFAULT_COMPOSER_URL),
        }
    }
}

/// Cached version and extension catalogue.
#[derive(Debug, Default)]
pub struct Index {
    pub common_versions: Vec<Version>,
    pub bulk_versions: Vec<Version>,
    pub common_extensions: Vec<String>,
    pub bulk_extensions: Vec<String>,
    pub composer_versions: Vec<ComposerRelease>,
    pub fetched_at: Option<OffsetDateTime>,
}

#[derive(Deserialize)]
struct FileEntry {
    name: String,
}

#[derive(Deserialize)]
struct ComposerVersionsResponse {
    #[serde(default)]
    stable: Vec<ComposerRelease>,
}

/// OS segment of the mirror archive names (`darwin` publishes as `macos`).
#[must_use]
pub fn os_name() -> &'static str {
    match env::consts::OS {
        "macos" => "macos",
        other => other,
    }
}

/// Architecture segment of the mirror archive names.
#[must_use]
pub fn arch_name() -> &'static str {
    match env::consts::ARCH {
        "x86_64" => "x86_64",
        "aarch64" => "aarch64",
        other => other,
    }
}

pub(crate) fn archive_filename(version: &Version) -> String {
    format!("php-{version}-cli-{}-{}.tar.gz", os_name(), arch_name())
}

impl Index {
    /// Retrieve the index, using the cache if fresh or fetching otherwise.
    ///
    /// # Errors
    /// Returns an error if both the cache and a refresh are unusable.
    pub fn load(client: &Client, sources: &IndexSources) -> Result<Index> {
        let index_dir = cache::index_dir()?;
        if let Some(fetched_at) = read_fetched_at(&index_dir) {
            if OffsetDateTime::now_utc() - fetched_at < CACHE_TTL {
                return Self::load_from_cache(&index_dir);
            }
        }
        Self::refresh(client, sources)
    }

    /// Fetch fresh index data from the remote sources and persist it.
    ///
    /// # Errors
    /// Returns an error on any endpoint failure; the cached timestamp is left
    /// untouched in that case.
    pub fn refresh(client: &Client, sources: &IndexSources) -> Result<Index> {
        let index_dir = cache::index_dir()?;
        cache::ensure_dir(&index_dir)?;

        let idx = Index {
            common_versions: fetch_versions(client, &sources.mirror, Tier::Common)
                .context("failed to fetch common versions")?,
            bulk_versions: fetch_versions(client, &sources.mirror, Tier::Bulk)
                .context("failed to fetch bulk versions")?,
            common_extensions: fetch_extensions(client, &sources.mirror, Tier::Common)
                .context("failed to fetch common extensions")?,
            bulk_extensions: fetch_extensions(client, &sources.mirror, Tier::Bulk)
                .context("failed to fetch bulk extensions")?,
            composer_versions: fetch_composer_versions(client, &sources.composer)
                .context("failed to fetch composer versions")?,
            fetched_at: Some(OffsetDateTime::now_utc()),
        };

        idx.save_to_cache(&index_dir)
            .context("failed to save index cache")?;
        Ok(idx)
    }

    fn load_from_cache(index_dir: &Path) -> Result<Index> {
        let common: Vec<String> = read_json(&index_dir.join("common-versions.json"))?;
        let bulk: Vec<String> = read_json(&index_dir.join("bulk-versions.json"))?;
        Ok(Index {
            common_versions: parse_versions(&common),
            bulk_versions: parse_versions(&bulk),
            common_extensions: read_json(&index_dir.join("common-extensions.json"))?,
            bulk_extensions: read_json(&index_dir.join("bulk-extensions.json"))?,
            composer_versions: read_json(&index_dir.join("composer-versions.json"))?,
            fetched_at: read_fetched_at(index_dir),
        })
    }

    fn save_to_cache(&self, index_dir: &Path) -> Result<()> {
        let common: Vec<String> = self.common_versions.iter().map(Version::to_string).collect();
        let bulk: Vec<String> = self.bulk_versions.iter().map(Version::to_string).collect();
        write_json(&index_dir.join("common-versions.json"), &common)?;
        write_json(&index_dir.join("bulk-versions.json"), &bulk)?;
        write_json(&index_dir.join("common-extensions.json"), &self.common_extensions)?;
        write_json(&index_dir.join("bulk-extensions.json"), &self.bulk_extensions)?;
        write_json(&index_dir.join("composer-versions.json"), &self.composer_versions)?;

        // The timestamp goes last: its presence marks the cache as complete.
        let fetched_at = self
            .fetched_at
            .unwrap_or_else(OffsetDateTime::now_utc)
            .format(&Rfc3339)
            .context("failed to format index timestamp")?;
        write_atomic(&index_dir.join(FETCHED_AT_FILE), fetched_at.as_bytes())
    }

    #[must_use]
    pub fn versions_for(&self, tier: Tier) -> &[Version] {
        match tier {
            Tier::Common => &self.common_versions,
            Tier::Bulk => &self.bulk_versions,
        }
    }

    #[must_use]
    pub fn has_extension(&self, ext: &str, tier: Tier) -> bool {
        let extensions = match tier {
            Tier::Common => &self.common_extensions,
            Tier::Bulk => &self.bulk_extensions,
        };
        extensions.iter().any(|known| known == ext)
    }

    /// Determine which tier is needed for the given extensions.
    ///
    /// # Errors
    /// Returns an error naming the first extension missing from both tiers.
    pub fn required_tier(&self, extensions: &[String]) -> Result<Tier> {
        let mut needs_bulk = false;
        for ext in extensions {
            if self.has_extension(ext, Tier::Common) {
                continue;
            }
            if self.has_extension(ext, Tier::Bulk) {
                needs_bulk = true;
                continue;
            }
            bail!("extension '{ext}' not available in static PHP builds");
        }
        Ok(if needs_bulk { Tier::Bulk } else { Tier::Common })
    }

    /// Return the highest Composer release compatible with a PHP version.
    ///
    /// # Errors
    /// Returns an error when no stable release supports the interpreter.
    pub fn select_composer(&self, php_version: &Version) -> Result<&ComposerRelease> {
        let php_int =
            php_version.major * 10000 + php_version.minor * 100 + php_version.patch;
        self.composer_versions
            .iter()
            .find(|release| release.min_php <= php_int)
            .ok_or_else(|| anyhow!("no Composer version compatible with PHP {php_version}"))
    }

    /// Resolve an interpreter constraint against a tier's version list.
    ///
    /// # Errors
    /// Returns an error when no indexed version satisfies the constraint.
    pub fn matching_version(&self, tier: Tier, constraint: &str) -> Result<Version> {
        matching_version(self.versions_for(tier), constraint).map(Version::clone)
    }

    #[must_use]
    pub fn latest_version(&self, tier: Tier) -> Option<&Version> {
        self.versions_for(tier).first()
    }
}

/// Download a Composer phar into the cache, returning its path.
///
/// # Errors
/// Returns an error on download failure; a partially written phar is never
/// left at the cache path.
pub fn download_composer(
    client: &Client,
    source: &Source,
    release: &ComposerRelease,
) -> Result<PathBuf> {
    let cache_path = cache::composer_path(&release.version)?;
    if cache::exists(&cache_path) {
        return Ok(cache_path);
    }
    let parent = cache_path
        .parent()
        .ok_or_else(|| anyhow!("composer cache path has no parent"))?;
    cache::ensure_dir(parent)?;

    let rel = release.path.trim_start_matches('/');
    let bytes = source
        .fetch(client, rel)
        .with_context(|| format!("failed to download Composer {}", release.version))?;
    write_atomic(&cache_path, &bytes)?;
    Ok(cache_path)
}

fn fetch_versions(client: &Client, mirror: &Source, tier: Tier) -> Result<Vec<Version>> {
    let rel = match mirror {
        Source::Http(_) => format!("{tier}/?format=json"),
        Source::Dir(_) => format!("{tier}/files.json"),
    };
    let bytes = mirror.fetch(client, &rel)?;
    let entries: Vec<FileEntry> =
        serde_json::from_slice(&bytes).context("invalid mirror file listing")?;

    let suffix = format!("-cli-{}-{}.tar.gz", os_name(), arch_name());
    let mut versions: Vec<Version> = entries
        .iter()
        .filter_map(|entry| {
            let rest = entry.name.strip_prefix("php-")?;
            let version = rest.strip_suffix(suffix.as_str())?;
            Version::parse(version).ok()
        })
        .collect();
    versions.sort_by(|a, b| b.cmp(a));
    versions.dedup();
    Ok(versions)
}

fn fetch_extensions(client: &Client, mirror: &Source, tier: Tier) -> Result<Vec<String>> {
    let bytes = mirror.fetch(client, &format!("{tier}/build-extensions.json"))?;
    serde_json::from_slice(&bytes).context("invalid extension catalogue")
}

fn fetch_composer_versions(client: &Client, composer: &Source) -> Result<Vec<ComposerRelease>> {
    let bytes = composer.fetch(client, "versions")?;
    let response: ComposerVersionsResponse =
        serde_json::from_slice(&bytes).context("invalid composer release catalogue")?;
    Ok(response.stable)
}

fn parse_versions(raw: &[String]) -> Vec<Version> {
    raw.iter()
        .filter_map(|entry| Version::parse(entry).ok())
        .collect()
}

fn read_fetched_at(index_dir: &Path) -> Option<OffsetDateTime> {
    let raw = std::fs::read_to_string(index_dir.join(FETCHED_AT_FILE)).ok()?;
    OffsetDateTime::parse(raw.trim(), &Rfc3339).ok()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value).context("failed to serialize index data")?;
    write_atomic(path, &bytes)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path {} has no parent", path.display()))?;
    let mut file = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temporary file in {}", parent.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.persist(path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn sample_index() -> Index {
        Index {
            common_versions: vec![
                Version::parse("8.4.17").expect("version"),
                Version::parse("8.3.20").expect("version"),
            ],
            bulk_versions: vec![Version::parse("8.4.17").expect("version")],
            common_extensions: vec!["curl".into(), "mbstring".into()],
            bulk_extensions: vec!["curl".into(), "mbstring".into(), "intl".into()],
            composer_versions: vec![
                ComposerRelease {
                    path: "/download/2.8.0/composer.phar".into(),
                    version: "2.8.0".into(),
                    min_php: 70205,
                },
                ComposerRelease {
                    path: "/download/2.2.25/composer.phar".into(),
                    version: "2.2.25".into(),
                    min_php: 50300,
                },
            ],
            fetched_at: Some(OffsetDateTime::now_utc()),
        }
    }

    #[test]
    fn required_tier_defaults_to_common() {
        let idx = sample_index();
        assert_eq!(idx.required_tier(&[]).expect("tier"), Tier::Common);
        assert_eq!(
            idx.required_tier(&["curl".into()]).expect("tier"),
            Tier::Common
        );
    }

    #[test]
    fn required_tier_upgrades_for_bulk_only_extensions() {
        let idx = sample_index();
        let tier = idx
            .required_tier(&["curl".into(), "intl".into()])
            .expect("tier");
        assert_eq!(tier, Tier::Bulk);
    }

    #[test]
    fn required_tier_rejects_unknown_extensions() {
        let idx = sample_index();
        let err = idx.required_tier(&["oci8".into()]).expect_err("error");
        assert!(err
            .to_string()
            .contains("extension 'oci8' not available in static PHP builds"));
    }

    #[test]
    fn select_composer_uses_integer_encoding() {
        let idx = sample_index();
        let release = idx
            .select_composer(&Version::parse("8.4.17").expect("version"))
            .expect("release");
        assert_eq!(release.version, "2.8.0");

        let release = idx
            .select_composer(&Version::parse("5.6.40").expect("version"))
            .expect("release");
        assert_eq!(release.version, "2.2.25");
    }

    #[test]
    fn select_composer_errors_below_all_minimums() {
        let idx = sample_index();
        assert!(idx
            .select_composer(&Version::parse("5.2.0").expect("version"))
            .is_err());
    }

    fn seed_mirror(dir: &Path) {
        for tier in ["common", "bulk"] {
            let tier_dir = dir.join(tier);
            fs::create_dir_all(&tier_dir).expect("mirror dir");
            let listing = serde_json::json!([
                { "name": format!("php-8.4.17-cli-{}-{}.tar.gz", os_name(), arch_name()) },
                { "name": format!("php-8.3.20-cli-{}-{}.tar.gz", os_name(), arch_name()) },
                { "name": "php-8.9.9-cli-other-os.tar.gz" },
            ]);
            fs::write(
                tier_dir.join("files.json"),
                serde_json::to_vec(&listing).expect("listing"),
            )
            .expect("write listing");
            let extensions = if tier == "bulk" {
                serde_json::json!(["curl", "intl"])
            } else {
                serde_json::json!(["curl"])
            };
            fs::write(
                tier_dir.join("build-extensions.json"),
                serde_json::to_vec(&extensions).expect("extensions"),
            )
            .expect("write extensions");
        }
    }

    fn seed_composer(dir: &Path) {
        let releases = serde_json::json!({
            "stable": [
                { "path": "/download/2.8.0/composer.phar", "version": "2.8.0", "min-php": 70205 }
            ]
        });
        fs::write(
            dir.join("versions"),
            serde_json::to_vec(&releases).expect("releases"),
        )
        .expect("write versions");
    }

    #[test]
    #[serial]
    fn refresh_persists_and_reload_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mirror_dir = temp.path().join("mirror");
        let composer_dir = temp.path().join("composer");
        fs::create_dir_all(&composer_dir).expect("composer dir");
        seed_mirror(&mirror_dir);
        seed_composer(&composer_dir);

        let cache_root = temp.path().join("cache");
        env::set_var("PHPX_CACHE_PATH", &cache_root);

        let sources = IndexSources {
            mirror: Source::Dir(mirror_dir),
            composer: Source::Dir(composer_dir),
        };
        let client = crate::net::build_http_client().expect("client");

        let idx = Index::refresh(&client, &sources).expect("refresh");
        assert_eq!(idx.common_versions.len(), 2);
        assert_eq!(idx.common_versions[0].to_string(), "8.4.17");
        assert_eq!(idx.bulk_extensions, vec!["curl", "intl"]);
        assert_eq!(idx.composer_versions.len(), 1);

        let reloaded = Index::load_from_cache(&cache_root.join("index")).expect("reload");
        assert_eq!(reloaded.common_versions, idx.common_versions);
        assert_eq!(reloaded.bulk_versions, idx.bulk_versions);
        assert_eq!(reloaded.common_extensions, idx.common_extensions);
        assert_eq!(reloaded.bulk_extensions, idx.bulk_extensions);
        assert_eq!(reloaded.composer_versions.len(), idx.composer_versions.len());
        assert!(reloaded.fetched_at.is_some());

        // A fresh cache must satisfy load() without touching the sources.
        let dead_sources = IndexSources {
            mirror: Source::Dir(temp.path().join("missing")),
            composer: Source::Dir(temp.path().join("missing")),
        };
        let warm = Index::load(&client, &dead_sources).expect("warm load");
        assert_eq!(warm.common_versions, idx.common_versions);

        env::remove_var("PHPX_CACHE_PATH");
    }
}
