//! Attribute-value mapping tables.
//!
//! A mapping directory holds one JSON object per attribute, translating source
//! values into target values. Mapping is opt-in: an attribute without a table,
//! or a value missing from its table, is simply "not mapped".
//!
//! The reader is scoped to one run. It is initialized exactly once and is a
//! plain read-only value afterwards, so lookups from worker threads never lock.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Seam between the normalizer and wherever mapped values come from.
pub trait AttributeLookup: Sync {
    /// Target value for `source_value` of `attribute`, or `None` when unmapped.
    fn lookup(&self, attribute: &str, source_value: &str) -> Option<&str>;
}

/// Lookup that maps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMapping;

impl AttributeLookup for NoMapping {
    fn lookup(&self, _attribute: &str, _source_value: &str) -> Option<&str> {
        None
    }
}

/// In-memory tables keyed by attribute name, then source value.
impl AttributeLookup for BTreeMap<String, BTreeMap<String, String>> {
    fn lookup(&self, attribute: &str, source_value: &str) -> Option<&str> {
        self.get(attribute)?.get(source_value).map(String::as_str)
    }
}

/// Optional manifest naming non-default mapping files.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingManifest {
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

#[derive(Debug)]
struct LoadedMappings {
    config_path: PathBuf,
    mapping_dir: PathBuf,
    tables: BTreeMap<String, BTreeMap<String, String>>,
}

/// Run-scoped mapping reader.
#[derive(Debug, Default)]
pub struct MappingConfig {
    loaded: OnceLock<LoadedMappings>,
}

impl MappingConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            loaded: OnceLock::new(),
        }
    }

    /// Load the manifest at `config_path` and every table under `mapping_dir`.
    ///
    /// Calling again with the same paths is a no-op. Calling again with
    /// different paths is a configuration error: a run has exactly one
    /// mapping source.
    pub fn init_once(&self, config_path: &Path, mapping_dir: &Path) -> Result<()> {
        if let Some(existing) = self.loaded.get() {
            return existing.ensure_same_source(config_path, mapping_dir);
        }

        let loaded = load_mappings(config_path, mapping_dir)?;
        tracing::info!(
            mapping_dir = %mapping_dir.display(),
            tables = loaded.tables.len(),
            "loaded attribute mappings"
        );

        if let Err(loaded) = self.loaded.set(loaded) {
            // Lost a concurrent initialization; the winner must agree with us.
            let existing = self.loaded.get().unwrap_or(&loaded);
            return existing.ensure_same_source(config_path, mapping_dir);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Names of attributes that have a mapping table, in name order.
    pub fn mapped_attributes(&self) -> impl Iterator<Item = &str> {
        self.loaded
            .get()
            .into_iter()
            .flat_map(|loaded| loaded.tables.keys().map(String::as_str))
    }
}

impl AttributeLookup for MappingConfig {
    fn lookup(&self, attribute: &str, source_value: &str) -> Option<&str> {
        self.loaded.get()?.tables.lookup(attribute, source_value)
    }
}

impl LoadedMappings {
    fn ensure_same_source(&self, config_path: &Path, mapping_dir: &Path) -> Result<()> {
        if self.config_path == config_path && self.mapping_dir == mapping_dir {
            return Ok(());
        }
        Err(Error::config(format!(
            "Mapping configuration already loaded from {} ({}); refusing to reload from {} ({})",
            self.config_path.display(),
            self.mapping_dir.display(),
            config_path.display(),
            mapping_dir.display()
        )))
    }
}

fn load_mappings(config_path: &Path, mapping_dir: &Path) -> Result<LoadedMappings> {
    let manifest = read_manifest(config_path)?;
    let mut tables = BTreeMap::new();

    if !mapping_dir.is_dir() {
        if !manifest.attributes.is_empty() {
            return Err(Error::config(format!(
                "Mapping config {} names mapping files but directory {} does not exist",
                config_path.display(),
                mapping_dir.display()
            )));
        }
        tracing::debug!(
            mapping_dir = %mapping_dir.display(),
            "mapping directory absent; no attribute values will be mapped"
        );
        return Ok(LoadedMappings {
            config_path: config_path.to_path_buf(),
            mapping_dir: mapping_dir.to_path_buf(),
            tables,
        });
    }

    // Files claimed by the manifest are not also loaded under their stem.
    let mut claimed = BTreeMap::new();
    for (attribute, file_name) in &manifest.attributes {
        let path = mapping_dir.join(file_name);
        if !path.is_file() {
            return Err(Error::MappingFile {
                path,
                message: format!("mapping file for attribute {attribute:?} does not exist"),
            });
        }
        tables.insert(attribute.clone(), read_table(&path)?);
        claimed.insert(path, attribute.clone());
    }

    let mut entries = std::fs::read_dir(mapping_dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    entries.sort();

    for path in entries {
        if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        if claimed.contains_key(&path) {
            continue;
        }
        let Some(attribute) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if tables.contains_key(attribute) {
            continue;
        }
        tables.insert(attribute.to_string(), read_table(&path)?);
    }

    Ok(LoadedMappings {
        config_path: config_path.to_path_buf(),
        mapping_dir: mapping_dir.to_path_buf(),
        tables,
    })
}

fn read_manifest(config_path: &Path) -> Result<MappingManifest> {
    let content = std::fs::read_to_string(config_path).map_err(|err| {
        Error::config(format!(
            "Failed to read mapping config {}: {err}",
            config_path.display()
        ))
    })?;
    if content.trim().is_empty() {
        return Ok(MappingManifest::default());
    }
    serde_json::from_str(&content).map_err(|err| Error::MappingFile {
        path: config_path.to_path_buf(),
        message: err.to_string(),
    })
}

fn read_table(path: &Path) -> Result<BTreeMap<String, String>> {
    let malformed = |message: String| Error::MappingFile {
        path: path.to_path_buf(),
        message,
    };
    let content = std::fs::read_to_string(path).map_err(|err| malformed(err.to_string()))?;
    serde_json::from_str(&content).map_err(|err| malformed(err.to_string()))
}
