//! Shared HTTP plumbing for the provisioning pipeline.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;

/// Decide whether phpx should honor standard proxy environment variables.
///
/// Behavior:
/// - `PHPX_KEEP_PROXIES=1/true/yes/on` forces proxies on.
/// - `PHPX_KEEP_PROXIES=0/false/no/off/""` forces proxies off.
/// - If unset, proxies are enabled only when at least one proxy env var is set.
pub(crate) fn keep_proxies() -> bool {
    match env::var("PHPX_KEEP_PROXIES") {
        Ok(raw) => {
            let value = raw.trim().to_ascii_lowercase();
            !matches!(value.as_str(), "" | "0" | "false" | "no" | "off")
        }
        Err(_) => {
            const PROXY_KEYS: &[&str] = &[
                "HTTP_PROXY",
                "http_proxy",
                "HTTPS_PROXY",
                "https_proxy",
                "ALL_PROXY",
                "all_proxy",
                "NO_PROXY",
                "no_proxy",
            ];
            PROXY_KEYS.iter().any(|key| {
                env::var(key)
                    .ok()
                    .map(|value| !value.trim().is_empty())
                    .unwrap_or(false)
            })
        }
    }
}

/// Build the blocking HTTP client shared by the index, the registry client,
/// and the downloaders.
///
/// # Errors
/// Returns an error if the client cannot be constructed.
pub fn build_http_client() -> Result<Client> {
    let builder = Client::builder()
        .user_agent(format!("phpx/{}", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30));
    let builder = if keep_proxies() {
        builder
    } else {
        builder.no_proxy()
    };
    builder.build().context("failed to build HTTP client")
}

/// A remote endpoint root: a real HTTP base URL, or a local directory
/// standing in for it (used by tests and air-gapped setups).
#[derive(Debug, Clone)]
pub enum Source {
    Http(String),
    Dir(PathBuf),
}

impl Source {
    /// Resolve a source from an environment override, falling back to the
    /// given default URL. Values that do not look like URLs are treated as
    /// directory paths.
    #[must_use]
    pub fn from_env(var: &str, default_url: &str) -> Self {
        match env::var(var) {
            Ok(value) if !value.trim().is_empty() => {
                let value = value.trim().trim_end_matches('/').to_string();
                if value.starts_with("http://") || value.starts_with("https://") {
                    Self::Http(value)
                } else {
                    Self::Dir(PathBuf::from(value))
                }
            }
            _ => Self::Http(default_url.trim_end_matches('/').to_string()),
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Dir(_))
    }

    /// Fetch the body at `rel` (slash-separated, no leading slash).
    ///
    /// # Errors
    /// Returns an error on any transport failure or non-2xx status.
    pub fn fetch(&self, client: &Client, rel: &str) -> Result<Vec<u8>> {
        self.fetch_optional(client, rel)?
            .with_context(|| format!("{} not found", self.describe(rel)))
    }

    /// Fetch the body at `rel`, mapping 404 (or a missing file) to `None`.
    ///
    /// # Errors
    /// Returns an error on transport failures or other non-2xx statuses.
    pub fn fetch_optional(&self, client: &Client, rel: &str) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Http(base) => {
                let url = format!("{base}/{rel}");
                let response = client
                    .get(&url)
                    .send()
                    .with_context(|| format!("failed to fetch {url}"))?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let response = response
                    .error_for_status()
                    .with_context(|| format!("request failed ({url})"))?;
                let bytes = response
                    .bytes()
                    .with_context(|| format!("failed to read body from {url}"))?;
                Ok(Some(bytes.to_vec()))
            }
            Self::Dir(dir) => {
                let path = join_rel(dir, rel);
                if !path.exists() {
                    return Ok(None);
                }
                std::fs::read(&path)
                    .map(Some)
                    .with_context(|| format!("failed to read {}", path.display()))
            }
        }
    }

    fn describe(&self, rel: &str) -> String {
        match self {
            Self::Http(base) => format!("{base}/{rel}"),
            Self::Dir(dir) => join_rel(dir, rel).display().to_string(),
        }
    }
}

fn join_rel(dir: &Path, rel: &str) -> PathBuf {
    let mut path = dir.to_path_buf();
    for segment in rel.split('/').filter(|segment| !segment.is_empty()) {
        path.push(segment);
    }
    path
}
