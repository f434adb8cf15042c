//! Error types for the merge pipeline.
//!
//! Fatal kinds abort a run before anything is written. Fragment-scoped and
//! test-case-scoped kinds are recovered by the merge processor and surface in
//! the run report instead.

use crate::model::AttributeType;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed mapping file {}: {message}", path.display())]
    MappingFile { path: PathBuf, message: String },

    #[error("Duplicate section id {id}")]
    DuplicateSection { id: i64 },

    #[error("Section {id} references unknown parent section {parent_id}")]
    OrphanSection { id: i64, parent_id: i64 },

    #[error("Section {id} is part of a parent cycle")]
    SectionCycle { id: i64 },

    #[error("Fragment {} is corrupt: {message}", path.display())]
    FragmentCorrupt { path: PathBuf, message: String },

    #[error("Unknown section id {id}")]
    UnknownSection { id: i64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Attribute {name:?} declared as both {first} and {second}")]
    MergeConflict {
        name: String,
        first: AttributeType,
        second: AttributeType,
    },

    #[error("Merge cancelled before the bundle was written")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn fragment_corrupt(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::FragmentCorrupt {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error must abort the whole run.
    ///
    /// Corrupt fragments and unknown sections only ever affect a single
    /// fragment or test case; everything else leaves the bundle in a state
    /// that cannot be trusted.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::FragmentCorrupt { .. } | Self::UnknownSection { .. }
        )
    }
}
