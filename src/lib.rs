//! casemerge - consolidate partial test-management exports into one bundle
//!
//! Export workers write numbered fragments, each holding a slice of the
//! section tree, the attribute schema, and the test cases. This crate merges
//! them into a single referentially-intact bundle for the target importer:
//! - section ids are remapped to stable target ids
//! - status, priority, tags, and iterations are normalized
//! - attribute values are remapped through per-attribute mapping tables
//! - test cases that cannot be imported are rejected with a reason, not dropped
//!
//! The bundle bytes depend only on the fragment set, never on scheduling.

#![forbid(unsafe_code)]

pub mod bundle;
pub mod cli;
pub mod config;
pub mod error;
pub mod fragment;
pub mod mapping;
pub mod merge;
pub mod model;
pub mod normalize;
pub mod section;

pub use bundle::Bundle;
pub use config::MergeConfig;
pub use error::{Error, Result};
pub use merge::{CancellationToken, MergeOutcome, MergeProcessor, MergeReport, run_merge};
