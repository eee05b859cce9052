//! Upward search for the worker runtime's config file.

use std::path::{Path, PathBuf};

use dashmap::DashMap;

/// Checked in order within each directory.
pub const DEFAULT_CONFIG_NAMES: &[&str] = &["deno.json", "deno.jsonc"];

/// Finds the nearest runtime config file above a script.
///
/// Results, misses included, are cached per script directory for the
/// lifetime of the locator, so sibling scripts share one lookup. Share one
/// locator between supervisors with `Arc` to share the cache.
#[derive(Debug)]
pub struct ConfigLocator {
    names: Vec<String>,
    cache: DashMap<PathBuf, Option<PathBuf>>,
}

impl Default for ConfigLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLocator {
    pub fn new() -> Self {
        Self::with_names(DEFAULT_CONFIG_NAMES.iter().copied())
    }

    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            cache: DashMap::new(),
        }
    }

    /// Walk from the script's directory to the filesystem root and return
    /// the first config file found.
    pub fn locate(&self, script: &Path) -> Option<PathBuf> {
        let start = script.parent()?;
        if let Some(hit) = self.cache.get(start) {
            return hit.value().clone();
        }

        let found = start.ancestors().find_map(|dir| {
            self.names
                .iter()
                .map(|name| dir.join(name))
                .find(|candidate| candidate.is_file())
        });

        tracing::debug!(
            dir = %start.display(),
            config = ?found,
            "Runtime config lookup"
        );
        self.cache.insert(start.to_path_buf(), found.clone());
        found
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}
