//! Run configuration.
//!
//! Loaded from a JSON file; relative paths inside it resolve against the
//! file's own directory. `CASEMERGE_WORKERS` overrides the worker count.

use crate::error::{Error, Result};
use crate::model::RequiredModel;
use crate::normalize::DEFAULT_MAX_TAG_LENGTH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const WORKERS_ENV: &str = "CASEMERGE_WORKERS";
const MAX_DEFAULT_WORKERS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSettings {
    pub config_path: PathBuf,
    pub mapping_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConfig {
    pub fragments_dir: PathBuf,
    pub output_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_tag_length")]
    pub max_tag_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<MappingSettings>,
    #[serde(default)]
    pub required_model: RequiredModel,
}

fn default_workers() -> usize {
    std::env::var(WORKERS_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map_or(1, std::num::NonZeroUsize::get)
                .min(MAX_DEFAULT_WORKERS)
        })
}

const fn default_max_tag_length() -> usize {
    DEFAULT_MAX_TAG_LENGTH
}

impl MergeConfig {
    /// Config with defaults for everything but the two required paths.
    #[must_use]
    pub fn new(fragments_dir: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            fragments_dir: fragments_dir.into(),
            output_path: output_path.into(),
            report_path: None,
            workers: default_workers(),
            max_tag_length: DEFAULT_MAX_TAG_LENGTH,
            mapping: None,
            required_model: RequiredModel::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::config(format!("Failed to read config {}: {err}", path.display()))
        })?;
        let mut config: Self = serde_json::from_str(&content).map_err(|err| {
            Error::config(format!("Failed to parse config {}: {err}", path.display()))
        })?;

        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.max_tag_length == 0 {
            return Err(Error::config("maxTagLength must be at least 1"));
        }
        if let Some(owners) = &self.required_model.owners_attribute {
            if owners.name.trim().is_empty() {
                return Err(Error::config("requiredModel.ownersAttribute.name is empty"));
            }
        }
        Ok(())
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.fragments_dir);
        resolve(&mut self.output_path);
        if let Some(report) = self.report_path.as_mut() {
            resolve(report);
        }
        if let Some(mapping) = self.mapping.as_mut() {
            resolve(&mut mapping.config_path);
            resolve(&mut mapping.mapping_dir);
        }
    }
}
