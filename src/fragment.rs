//! Fragment and bundle file I/O.
//!
//! Every write goes through a temporary file in the destination directory and
//! is renamed into place, so readers see either the previous file or the
//! complete new one. Temporary names never look like fragments, so leftovers
//! from a crashed run are ignored by discovery.

use crate::bundle::{self, Bundle};
use crate::error::{Error, Result};
use crate::model::{AttributeSchema, Section, TestCase};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const FRAGMENT_PREFIX: &str = "fragment-";
const FRAGMENT_EXTENSION: &str = "json";

/// One partial export written by a single export worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub sequence_number: u64,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub attributes: Vec<AttributeSchema>,
}

/// A discovered fragment file, not yet read.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FragmentFile {
    pub sequence_number: u64,
    pub path: PathBuf,
}

#[must_use]
pub fn fragment_file_name(sequence_number: u64) -> String {
    format!("{FRAGMENT_PREFIX}{sequence_number:06}.{FRAGMENT_EXTENSION}")
}

/// Sequence number embedded in a fragment file name.
///
/// `None` when the name is not shaped like a fragment at all; an error when it
/// is, but the digits do not fit a sequence number.
#[must_use]
pub fn parse_fragment_file_name(name: &str) -> Option<std::result::Result<u64, ParseIntError>> {
    let stem = name
        .strip_prefix(FRAGMENT_PREFIX)?
        .strip_suffix(FRAGMENT_EXTENSION)?
        .strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(stem.parse())
}

/// Result of scanning a fragment directory.
#[derive(Debug, Default)]
pub struct FragmentListing {
    /// Ordered by sequence number, then file name.
    pub fragments: Vec<FragmentFile>,
    /// Files named like fragments whose sequence number is unusable, by path.
    pub invalid: Vec<(PathBuf, Error)>,
}

/// List the fragments of a run.
pub fn discover_fragments(dir: &Path) -> Result<FragmentListing> {
    if !dir.is_dir() {
        return Err(Error::config(format!(
            "Fragment directory {} does not exist",
            dir.display()
        )));
    }

    let mut listing = FragmentListing::default();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        match path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_fragment_file_name)
        {
            None => {}
            Some(Ok(sequence_number)) => listing.fragments.push(FragmentFile {
                sequence_number,
                path,
            }),
            Some(Err(err)) => {
                let err = Error::fragment_corrupt(
                    &path,
                    format!("sequence number in file name is unusable: {err}"),
                );
                listing.invalid.push((path, err));
            }
        }
    }

    listing.fragments.sort();
    listing.invalid.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(listing)
}

/// Read one fragment. Anything unreadable is reported as a corrupt fragment.
pub fn read_fragment(path: &Path) -> Result<Fragment> {
    let content =
        std::fs::read_to_string(path).map_err(|err| Error::fragment_corrupt(path, err))?;
    let fragment: Fragment =
        serde_json::from_str(&content).map_err(|err| Error::fragment_corrupt(path, err))?;

    if let Some(Ok(expected)) = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(parse_fragment_file_name)
    {
        if expected != fragment.sequence_number {
            return Err(Error::fragment_corrupt(
                path,
                format!(
                    "file name says sequence {expected} but body says {}",
                    fragment.sequence_number
                ),
            ));
        }
    }

    Ok(fragment)
}

/// Write a fragment into `dir` under its canonical name.
pub fn write_fragment(dir: &Path, fragment: &Fragment) -> Result<PathBuf> {
    let path = dir.join(fragment_file_name(fragment.sequence_number));
    let encoded = serde_json::to_string_pretty(fragment)?;
    write_atomic(&path, encoded.as_bytes())?;
    Ok(path)
}

pub fn read_bundle(path: &Path) -> Result<Bundle> {
    let content = std::fs::read_to_string(path)?;
    bundle::from_json(&content)
}

/// Serialize and write the bundle. Returns the bytes written.
pub fn write_bundle(path: &Path, bundle: &Bundle) -> Result<Vec<u8>> {
    let encoded = bundle::to_canonical_json(bundle)?.into_bytes();
    write_atomic(path, &encoded)?;
    Ok(encoded)
}

/// Replace `path` with `bytes` in one rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        Some(_) => Path::new("."),
        None => {
            return Err(Error::config(format!(
                "Invalid output path: {}",
                path.display()
            )));
        }
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map(|_| ()).map_err(|e| Error::Io(e.error))
}
