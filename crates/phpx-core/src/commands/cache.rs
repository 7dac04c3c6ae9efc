//! Cache maintenance entry points.

use anyhow::Result;

use crate::cache;

/// Print the cache root directory.
///
/// # Errors
/// Returns an error when the cache root cannot be resolved.
pub fn cache_dir_command() -> Result<()> {
    println!("{}", cache::cache_dir()?.display());
    Ok(())
}

/// Remove cache entries for the given target.
///
/// # Errors
/// Returns an error for an unknown target or when removal fails.
pub fn cache_clean_command(target: &str) -> Result<()> {
    cache::clean(target)?;
    tracing::debug!("cache cleaned: {target}");
    Ok(())
}
