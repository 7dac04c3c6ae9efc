//! Environment variable safelist for confined children.
//!
//! Only a fixed set of names and prefixes passes through to sandboxed
//! processes. Callers may extend the set per invocation: a bare name inherits
//! the current value, a `KEY=VALUE` literal is injected verbatim when no
//! variable of that name is present already.

use std::env;

/// Prefixes that are safe to pass through.
pub const SAFE_ENV_PREFIXES: &[&str] = &["LC_", "XDG_"];

/// Specific variables that are safe to pass through.
pub const SAFE_ENV_VARS: &[&str] = &[
    // System essentials
    "PATH", "HOME", "USER", "SHELL", "LANG", "TERM", "TZ", "TMPDIR", "TEMP", "TMP",
    // User info
    "LOGNAME", "UID",
    // Locale
    "LANGUAGE", "LC_ALL", "LC_COLLATE", "LC_CTYPE", "LC_MESSAGES", "LC_MONETARY", "LC_NUMERIC",
    "LC_TIME",
    // Terminal
    "COLORTERM", "COLUMNS", "LINES",
    // Editor (non-sensitive)
    "EDITOR", "VISUAL", "PAGER",
];

/// Build the filtered environment for a child process.
///
/// `allow` entries are either bare names or `KEY=VALUE` literals.
#[must_use]
pub fn filter_env(allow: &[String]) -> Vec<(String, String)> {
    let explicit_names: Vec<&str> = allow
        .iter()
        .map(|entry| entry.split_once('=').map_or(entry.as_str(), |(name, _)| name))
        .collect();

    let mut filtered: Vec<(String, String)> = Vec::new();
    for (name, value) in env::vars() {
        if explicit_names.contains(&name.as_str()) || is_safe(&name) {
            filtered.push((name, value));
        }
    }

    // Inject KEY=VALUE literals that did not resolve from the environment.
    for entry in allow {
        if let Some((name, value)) = entry.split_once('=') {
            if !filtered.iter().any(|(existing, _)| existing == name) {
                filtered.push((name.to_string(), value.to_string()));
            }
        }
    }

    filtered
}

fn is_safe(name: &str) -> bool {
    SAFE_ENV_VARS.contains(&name)
        || SAFE_ENV_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}
