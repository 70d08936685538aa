//! Input unit discovery.
//!
//! Patterns are resolved once per run; each matched file gets its
//! [`Identity`] here and nowhere else.

use super::identity::Identity;
use crate::config::InputConfig;
use crate::context::Namespace;
use crate::error::PreconditionError;
use crate::io::CacheStore;
use futures::stream::{self, StreamExt, TryStreamExt};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Suffixes removed from a file name when no identity pattern is configured.
const STRIPPED_SUFFIXES: [&str; 4] = [".vcf.gz", ".vcf.bgz", ".vcf", ".gz"];

fn is_bcf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("bcf"))
}

const CACHE_LOOKUP_CONCURRENCY: usize = 16;

/// One logical input file.
#[derive(Debug, Clone, PartialEq)]
pub struct InputUnit {
    pub identity: Identity,
    pub source_path: PathBuf,
    /// A complete, well-formed cache entry exists for this identity
    pub is_cached: bool,
    /// The cache entry was built from a unit with failed chunks
    pub provisional: bool,
}

/// Resolves input patterns to units and looks each one up in the cache.
#[derive(Debug)]
pub struct InputDiscoverer {
    patterns: Vec<String>,
    identity_pattern: Option<Regex>,
}

impl InputDiscoverer {
    pub fn new(config: &InputConfig) -> Result<Self, PreconditionError> {
        let identity_pattern = match &config.identity_pattern {
            Some(p) => Some(Regex::new(p).map_err(|e| PreconditionError::InvalidPattern {
                pattern: p.clone(),
                message: e.to_string(),
            })?),
            None => None,
        };
        Ok(Self {
            patterns: config.patterns.clone(),
            identity_pattern,
        })
    }

    /// Derive the identity of one input file.
    pub fn identity_for(&self, path: &Path) -> Result<Identity, PreconditionError> {
        let invalid = |message: String| PreconditionError::InvalidIdentity {
            path: path.to_path_buf(),
            message,
        };
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid("file name is not valid UTF-8".to_string()))?;

        let raw = match &self.identity_pattern {
            Some(re) => {
                let caps = re
                    .captures(name)
                    .ok_or_else(|| invalid(format!("identity pattern '{}' does not match", re)))?;
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str())
                    .unwrap_or_default()
            }
            None => STRIPPED_SUFFIXES
                .iter()
                .find_map(|suffix| name.strip_suffix(suffix))
                .unwrap_or(name),
        };

        Identity::new(raw).map_err(invalid)
    }

    /// Resolve the patterns to `(identity, path)` pairs in canonical order.
    ///
    /// Zero matches and two files claiming one identity are both fatal.
    pub fn resolve(&self) -> Result<Vec<(Identity, PathBuf)>, PreconditionError> {
        let mut paths = BTreeSet::new();
        for pattern in &self.patterns {
            let entries = glob::glob(pattern).map_err(|e| PreconditionError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            for entry in entries {
                match entry {
                    Ok(path) if path.is_file() => {
                        paths.insert(path);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Skipping unreadable input path: {}", e),
                }
            }
        }

        if paths.is_empty() {
            return Err(PreconditionError::NoInputUnits {
                patterns: self.patterns.clone(),
            });
        }

        let mut units: BTreeMap<Identity, PathBuf> = BTreeMap::new();
        for path in paths {
            if is_bcf(&path) {
                return Err(PreconditionError::UnsupportedFormat { path, format: "BCF" });
            }
            let identity = self.identity_for(&path)?;
            if let Some(first) = units.get(&identity) {
                return Err(PreconditionError::DuplicateIdentity {
                    identity: identity.to_string(),
                    first: first.clone(),
                    second: path,
                });
            }
            units.insert(identity, path);
        }

        Ok(units.into_iter().collect())
    }

    /// Resolve units and mark the ones already present in the cache.
    pub async fn discover(
        &self,
        cache: &dyn CacheStore,
        namespace: &Namespace,
    ) -> anyhow::Result<Vec<InputUnit>> {
        let resolved = self.resolve()?;

        let units: Vec<InputUnit> = stream::iter(resolved)
            .map(|(identity, source_path)| async move {
                let entry = cache.entry(namespace, &identity).await?;
                Ok::<_, anyhow::Error>(InputUnit {
                    is_cached: entry.is_some(),
                    provisional: entry.map(|e| !e.complete).unwrap_or(false),
                    identity,
                    source_path,
                })
            })
            .buffered(CACHE_LOOKUP_CONCURRENCY)
            .try_collect()
            .await?;

        let cached = units.iter().filter(|u| u.is_cached).count();
        tracing::info!(
            "Discovered {} input units ({} cached, {} to process)",
            units.len(),
            cached,
            units.len() - cached
        );
        for unit in units.iter().filter(|u| u.provisional) {
            tracing::warn!(
                "Reusing provisional cache entry for {} (built with failed chunks)",
                unit.identity
            );
        }

        Ok(units)
    }
}
