//! Local answer overrides.
//!
//! Maps lookup keys to IPv4 literals taken from the config. A key matches a
//! query when it appears anywhere inside the lowercased query name, so
//! `example` overrides `www.example.com.` as well as `example.org.`.

use rustc_hash::FxHashMap;

/// Override table built once from the config.
pub struct OverrideTable {
    /// Longest key first, so the first hit is the most specific one.
    entries: Vec<(String, String)>,
}

impl OverrideTable {
    /// Build the table from `key -> address` pairs. Keys are lowercased and
    /// empty keys dropped since they would match every name.
    pub fn new(domains: &FxHashMap<String, String>) -> Self {
        let mut entries: Vec<(String, String)> = domains
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_lowercase(), value.clone()))
            .collect();

        entries.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        Self { entries }
    }

    /// Find the configured value whose key is contained in `name`.
    ///
    /// Returns the matching key and its (unvalidated) value.
    pub fn lookup(&self, name: &str) -> Option<(&str, &str)> {
        let name = name.to_lowercase();

        self.entries
            .iter()
            .find(|(key, _)| name.contains(key.as_str()))
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Returns the number of override entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
