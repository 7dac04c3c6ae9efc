//! Composer-flavored version constraint handling.
//!
//! Composer uses a single pipe for disjunction where semver expects `||`,
//! and space-separated comparators where `semver::VersionReq` expects commas.
//! Constraints are normalized once and matched as any-of a list of
//! alternatives.

use anyhow::{anyhow, Context, Result};
use semver::{Version, VersionReq};

/// Convert a Composer-style constraint to semver-compatible form.
///
/// Existing `||` separators are preserved; any remaining single `|` becomes
/// ` || `. Normalization is idempotent.
#[must_use]
pub fn normalize_constraint(constraint: &str) -> String {
    constraint
        .split("||")
        .map(|part| part.replace('|', " || "))
        .collect::<Vec<_>>()
        .join(" || ")
}

/// A parsed constraint: a disjunction of comparator sets.
#[derive(Debug, Clone)]
pub struct Constraint {
    alternatives: Vec<VersionReq>,
}

impl Constraint {
    /// Parse a constraint string.
    ///
    /// # Errors
    /// Returns an error if no alternative parses as a version requirement.
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = normalize_constraint(raw);
        let mut alternatives = Vec::new();
        for part in normalized.split("||") {
            let comparators: Vec<&str> = part
                .split(|ch: char| ch == ',' || ch.is_whitespace())
                .filter(|piece| !piece.is_empty())
                .collect();
            if comparators.is_empty() {
                continue;
            }
            let req = VersionReq::parse(&comparators.join(", "))
                .with_context(|| format!("invalid constraint {raw:?}"))?;
            alternatives.push(req);
        }
        if alternatives.is_empty() {
            return Err(anyhow!("invalid constraint {raw:?}"));
        }
        Ok(Self { alternatives })
    }

    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}

/// Parse a version string, tolerating a leading `v`/`V` as Composer tags use.
///
/// # Errors
/// Returns an error if the remainder is not a semantic version.
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    Version::parse(stripped).with_context(|| format!("invalid version {raw:?}"))
}

/// Return the first version in a descending list satisfying the constraint.
///
/// # Errors
/// Returns an error if the constraint is invalid or nothing matches.
pub fn matching_version<'a>(versions: &'a [Version], constraint: &str) -> Result<&'a Version> {
    let parsed = Constraint::parse(constraint)?;
    versions
        .iter()
        .find(|version| parsed.matches(version))
        .ok_or_else(|| anyhow!("no PHP version satisfies '{constraint}'"))
}
