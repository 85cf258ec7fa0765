//! Path prefix → domain lookup.

use contextsync_shared::{DomainId, DomainMapEntry, Result};

/// Result of mapping a path to a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMatch {
    pub domain: DomainId,
    /// The `/`-separated prefix that matched, without a trailing slash.
    pub prefix: String,
}

/// Maps source paths (relative, `/`-separated) to domains.
pub trait DomainMap: Send + Sync {
    /// Domain owning `path`, or `None` if the path belongs to no domain.
    fn lookup(&self, path: &str) -> Option<DomainMatch>;

    /// Every domain the map can produce for configured prefixes.
    fn known_domains(&self) -> Vec<DomainId>;
}

/// Longest-prefix table with a top-level-directory fallback.
///
/// A path with no configured prefix maps to its first directory segment
/// (`Analysis/Fractal/X.cs` → `Analysis`). Files at the source root map to
/// nothing.
#[derive(Debug, Clone, Default)]
pub struct PrefixDomainMap {
    /// Sorted by prefix length, longest first.
    entries: Vec<(String, DomainId)>,
}

impl PrefixDomainMap {
    pub fn new(entries: impl IntoIterator<Item = (String, DomainId)>) -> Self {
        let mut entries: Vec<_> = entries
            .into_iter()
            .map(|(prefix, domain)| (normalize_path(&prefix), domain))
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { entries }
    }

    /// Build from `[[domains]]` config entries.
    pub fn from_config(entries: &[DomainMapEntry]) -> Result<Self> {
        let parsed = entries
            .iter()
            .map(|e| Ok((e.prefix.clone(), DomainId::new(e.domain.as_str())?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(parsed))
    }
}

impl DomainMap for PrefixDomainMap {
    fn lookup(&self, path: &str) -> Option<DomainMatch> {
        let path = normalize_path(path);

        for (prefix, domain) in &self.entries {
            let matches = prefix.is_empty()
                || path == *prefix
                || (path.starts_with(prefix.as_str())
                    && path.as_bytes().get(prefix.len()) == Some(&b'/'));
            if matches {
                return Some(DomainMatch {
                    domain: domain.clone(),
                    prefix: prefix.clone(),
                });
            }
        }

        let (top, _) = path.split_once('/')?;
        let domain = DomainId::from_segments([top]).ok()?;
        Some(DomainMatch {
            domain,
            prefix: top.to_string(),
        })
    }

    fn known_domains(&self) -> Vec<DomainId> {
        let mut domains: Vec<_> = self.entries.iter().map(|(_, d)| d.clone()).collect();
        domains.sort();
        domains.dedup();
        domains
    }
}

/// Normalize separators and strip `./` and surrounding slashes.
pub fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut path = path.as_str();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.trim_matches('/').to_string()
}
