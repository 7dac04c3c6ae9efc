//! Inline `// phpx` manifest parsing.
//!
//! A script may carry a comment prologue of the form:
//!
//! ```text
//! // phpx
//! // php = ">=8.2"
//! // packages = ["vendor/package:^1.0"]
//! // extensions = ["redis"]
//! ```
//!
//! Collection stops at the first non-comment line. A missing block yields the
//! empty record; a malformed body is a hard error.

use anyhow::{bail, Context, Result};
use toml_edit::{DocumentMut, Item, Value};

const MARKER: &str = "// phpx";

/// Parsed inline manifest. Absent fields behave as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub php: String,
    pub packages: Vec<String>,
    pub extensions: Vec<String>,
}

/// Extract metadata from a script's comment prologue.
///
/// # Errors
/// Returns an error when the collected block is not valid TOML or a key has
/// the wrong type.
pub fn parse(content: &str) -> Result<Metadata> {
    let mut lines = content.lines();

    let mut found = false;
    for line in lines.by_ref() {
        if line.trim() == MARKER {
            found = true;
            break;
        }
    }
    if !found {
        return Ok(Metadata::default());
    }

    let mut body = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if !trimmed.starts_with("//") {
            break;
        }
        let rest = trimmed.strip_prefix("//").unwrap_or(trimmed);
        let rest = rest.strip_prefix(' ').unwrap_or(rest);
        body.push(rest);
    }
    if body.is_empty() {
        return Ok(Metadata::default());
    }

    let doc: DocumentMut = body
        .join("\n")
        .parse()
        .context("invalid phpx metadata block")?;

    Ok(Metadata {
        php: string_key(&doc, "php")?.unwrap_or_default(),
        packages: string_array_key(&doc, "packages")?.unwrap_or_default(),
        extensions: string_array_key(&doc, "extensions")?.unwrap_or_default(),
    })
}

fn string_key(doc: &DocumentMut, key: &str) -> Result<Option<String>> {
    match doc.get(key) {
        None => Ok(None),
        Some(item) => match item.as_str() {
            Some(value) => Ok(Some(value.to_string())),
            None => bail!("metadata key '{key}' must be a string"),
        },
    }
}

fn string_array_key(doc: &DocumentMut, key: &str) -> Result<Option<Vec<String>>> {
    let Some(item) = doc.get(key) else {
        return Ok(None);
    };
    let array = match item {
        Item::Value(Value::Array(array)) => array,
        _ => bail!("metadata key '{key}' must be an array of strings"),
    };
    let mut out = Vec::with_capacity(array.len());
    for value in array.iter() {
        match value.as_str() {
            Some(entry) => out.push(entry.to_string()),
            None => bail!("metadata key '{key}' must be an array of strings"),
        }
    }
    Ok(Some(out))
}
