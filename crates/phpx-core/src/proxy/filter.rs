//! Host allowlisting shared by both proxies.

use std::collections::BTreeSet;

/// Domain allowlist with exact and wildcard entries.
///
/// Immutable once handed to the proxies: entries are added during
/// construction only.
#[derive(Debug, Default)]
pub struct DomainFilter {
    exact: BTreeSet<String>,
    wildcard_suffixes: Vec<String>,
    allow_all: bool,
}

impl DomainFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable filtering entirely.
    pub fn allow_all(&mut self) {
        self.allow_all = true;
    }

    /// Add a domain to the allowlist. Entries starting with `*.` match any
    /// host ending in the remainder (including the dot).
    pub fn add_allowed(&mut self, domain: &str) {
        let domain = domain.trim().to_lowercase();
        if domain.is_empty() {
            return;
        }
        if let Some(suffix) = domain.strip_prefix("*.") {
            self.wildcard_suffixes.push(format!(".{suffix}"));
        } else {
            self.exact.insert(domain);
        }
    }

    /// Check whether a host (optionally `host:port`) is allowed.
    #[must_use]
    pub fn is_allowed(&self, host: &str) -> bool {
        let host = match host.rfind(':') {
            Some(idx) => &host[..idx],
            None => host,
        };
        let host = host.to_lowercase();

        if self.allow_all {
            return true;
        }
        if self.exact.contains(&host) {
            return true;
        }
        self.wildcard_suffixes
            .iter()
            .any(|suffix| host.ends_with(suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_case_insensitive_and_port_stripped() {
        let mut filter = DomainFilter::new();
        filter.add_allowed("API.Example.com");
        assert!(filter.is_allowed("api.example.com"));
        assert!(filter.is_allowed("api.example.com:443"));
        assert!(filter.is_allowed("API.EXAMPLE.COM:8080"));
        assert!(!filter.is_allowed("example.com"));
    }

    #[test]
    fn wildcard_matches_subdomains_but_not_the_apex() {
        let mut filter = DomainFilter::new();
        filter.add_allowed("*.example.com");
        assert!(filter.is_allowed("api.example.com"));
        assert!(filter.is_allowed("deep.api.example.com:443"));
        assert!(!filter.is_allowed("example.com"));
        assert!(!filter.is_allowed("evilexample.com"));
    }

    #[test]
    fn allow_all_short_circuits() {
        let mut filter = DomainFilter::new();
        filter.allow_all();
        assert!(filter.is_allowed("anything.example"));
    }

    #[test]
    fn empty_filter_denies_everything() {
        let filter = DomainFilter::new();
        assert!(!filter.is_allowed("example.com"));
    }

    #[test]
    fn blank_entries_are_ignored() {
        let mut filter = DomainFilter::new();
        filter.add_allowed("  ");
        assert!(!filter.is_allowed(""));
    }
}
