//! Packagist metadata client, version selection, and binary inference for
//! Composer tools.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;

use crate::net::Source;
use crate::version::{parse_version, Constraint};

pub const DEFAULT_PACKAGIST_URL: &str = "https://repo.packagist.org";

/// Common tool names mapped to their full package identifiers.
const ALIASES: &[(&str, &str)] = &[
    ("phpstan", "phpstan/phpstan"),
    ("psalm", "vimeo/psalm"),
    ("php-cs-fixer", "friendsofphp/php-cs-fixer"),
    ("pint", "laravel/pint"),
    ("phpunit", "phpunit/phpunit"),
    ("pest", "pestphp/pest"),
    ("rector", "rector/rector"),
    ("phpcs", "squizlabs/php_codesniffer"),
    ("laravel", "laravel/installer"),
    ("psysh", "psy/psysh"),
];

/// Information about a Composer package.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub name: String,
    pub versions: Vec<PackageVersion>,
}

/// A single published version of a package.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageVersion {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub version_normalized: String,
    #[serde(default)]
    pub require: BTreeMap<String, String>,
    #[serde(default)]
    pub bin: Vec<String>,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Deserialize)]
struct P2Response {
    #[serde(default)]
    packages: BTreeMap<String, Vec<PackageVersion>>,
}

#[derive(Deserialize)]
struct PackagesResponse {
    package: PackagesPackage,
}

#[derive(Deserialize)]
struct PackagesPackage {
    #[serde(default)]
    name: String,
    #[serde(default)]
    versions: BTreeMap<String, PackageVersion>,
}

/// Expand a tool name alias to its full `vendor/package` identifier.
/// Non-alias names are returned unchanged.
#[must_use]
pub fn resolve_alias(name: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map_or(name, |(_, full)| full)
}

/// Parse a tool argument like `phpstan@1.10.0` or `phpstan:^1.10` into a
/// package name and version constraint. `@` takes precedence over `:`.
#[must_use]
pub fn parse_tool_arg(arg: &str) -> (&str, &str) {
    if let Some(idx) = arg.find('@') {
        return (&arg[..idx], &arg[idx + 1..]);
    }
    if let Some(idx) = arg.find(':') {
        return (&arg[..idx], &arg[idx + 1..]);
    }
    (arg, "")
}

/// Fetch package metadata from the registry.
///
/// The `p2` metadata endpoint is preferred; the legacy `packages` endpoint
/// is accepted as a fallback.
///
/// # Errors
/// Returns an error when the package is unknown or the response is invalid.
pub fn fetch_package(client: &Client, source: &Source, name: &str) -> Result<PackageInfo> {
    if let Some(bytes) = source.fetch_optional(client, &format!("p2/{name}.json"))? {
        let response: P2Response =
            serde_json::from_slice(&bytes).context("failed to parse registry response")?;
        let versions = response
            .packages
            .into_iter()
            .find(|(pkg, _)| pkg == name)
            .map(|(_, versions)| versions)
            .ok_or_else(|| anyhow!("package not found: {name}"))?;
        return Ok(PackageInfo {
            name: name.to_string(),
            versions,
        });
    }

    let bytes = source
        .fetch_optional(client, &format!("packages/{name}.json"))?
        .ok_or_else(|| anyhow!("package not found: {name}"))?;
    let response: PackagesResponse =
        serde_json::from_slice(&bytes).context("failed to parse registry response")?;
    if response.package.name.is_empty() {
        bail!("package not found: {name}");
    }
    Ok(PackageInfo {
        name: name.to_string(),
        versions: response.package.versions.into_values().collect(),
    })
}

/// Find the best matching version for a constraint. An empty constraint
/// selects the latest stable version.
///
/// # Errors
/// Returns an error when no version satisfies the constraint.
pub fn resolve_version<'a>(
    pkg: &'a PackageInfo,
    constraint: &str,
) -> Result<&'a PackageVersion> {
    if constraint.is_empty() {
        return latest_stable(&pkg.versions);
    }

    let parsed = Constraint::parse(constraint)?;
    let candidates: Vec<&PackageVersion> = pkg
        .versions
        .iter()
        .filter(|entry| !is_prerelease(&entry.version))
        .filter(|entry| {
            parse_version(&entry.version)
                .map(|version| parsed.matches(&version))
                .unwrap_or(false)
        })
        .collect();

    if candidates.is_empty() {
        bail!("no version satisfies constraint {constraint:?}");
    }
    highest_version(&candidates)
}

fn latest_stable(versions: &[PackageVersion]) -> Result<&PackageVersion> {
    let stable: Vec<&PackageVersion> = versions
        .iter()
        .filter(|entry| !is_prerelease(&entry.version) && !is_dev(&entry.version))
        .filter(|entry| parse_version(&entry.version).is_ok())
        .collect();
    if stable.is_empty() {
        bail!("no stable version found");
    }
    highest_version(&stable)
}

fn highest_version<'a>(versions: &[&'a PackageVersion]) -> Result<&'a PackageVersion> {
    versions
        .iter()
        .filter_map(|entry| {
            parse_version(&entry.version)
                .ok()
                .map(|version| (version, *entry))
        })
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, entry)| entry)
        .ok_or_else(|| anyhow!("no versions provided"))
}

fn is_prerelease(version: &str) -> bool {
    let lower = version.to_lowercase();
    lower.contains("-alpha")
        || lower.contains("-beta")
        || lower.contains("-rc")
        || lower.contains("-dev")
}

fn is_dev(version: &str) -> bool {
    version.to_lowercase().starts_with("dev-")
}

/// Determine the binary to execute for a package.
///
/// Priority: explicit override, single declared binary, basename matching the
/// package short name (with a trailing `.phar` stripped), first entry.
///
/// # Errors
/// Returns an error when the package declares no binaries at all.
pub fn infer_binary(pkg: &str, bins: &[String], from_flag: &str) -> Result<String> {
    if !from_flag.is_empty() {
        return Ok(from_flag.to_string());
    }
    if bins.is_empty() {
        bail!("binary not found in package: {pkg}");
    }
    if bins.len() == 1 {
        return Ok(basename(&bins[0]).to_string());
    }

    let short_name = package_short_name(pkg);
    for bin in bins {
        let base = basename(bin);
        if base.strip_suffix(".phar").unwrap_or(base) == short_name {
            return Ok(base.to_string());
        }
    }
    Ok(basename(&bins[0]).to_string())
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// The segment after the vendor slash, e.g. `phpstan/phpstan` -> `phpstan`.
fn package_short_name(pkg: &str) -> &str {
    pkg.split_once('/').map_or(pkg, |(_, short)| short)
}
