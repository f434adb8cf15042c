//! The consolidated import bundle and its canonical JSON form.
//!
//! Canonical means: fields in declaration order, maps ordered by key, two-space
//! indentation, trailing newline. Equal bundles therefore serialize to equal
//! bytes.

use crate::error::{Error, Result};
use crate::model::{AttributeSchema, AttributeValue, Iteration, Priority, Status};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSection {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleTestCase {
    pub id: Uuid,
    pub external_id: String,
    pub name: String,
    pub section_id: Uuid,
    pub state: Status,
    pub priority: Priority,
    #[serde(default)]
    pub iterations: Vec<Iteration>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub sections: Vec<BundleSection>,
    pub attributes: Vec<AttributeSchema>,
    pub test_cases: Vec<BundleTestCase>,
}

impl Bundle {
    /// Every parent and every test-case section must be a bundle section.
    pub fn check_integrity(&self) -> Result<()> {
        let ids = self
            .sections
            .iter()
            .map(|section| section.id)
            .collect::<HashSet<_>>();
        if ids.len() != self.sections.len() {
            return Err(Error::validation("bundle contains duplicate section ids"));
        }

        for section in &self.sections {
            if let Some(parent) = section.parent_id {
                if !ids.contains(&parent) {
                    return Err(Error::validation(format!(
                        "section {} ({:?}) references missing parent {parent}",
                        section.id, section.name
                    )));
                }
            }
        }

        for test_case in &self.test_cases {
            if !ids.contains(&test_case.section_id) {
                return Err(Error::validation(format!(
                    "test case {:?} references missing section {}",
                    test_case.external_id, test_case.section_id
                )));
            }
        }

        Ok(())
    }
}

pub fn to_canonical_json(bundle: &Bundle) -> Result<String> {
    let mut encoded = serde_json::to_string_pretty(bundle)?;
    encoded.push('\n');
    Ok(encoded)
}

/// Parse a bundle and reject it unless it is referentially intact.
pub fn from_json(text: &str) -> Result<Bundle> {
    let bundle: Bundle = serde_json::from_str(text)?;
    bundle.check_integrity()?;
    Ok(bundle)
}
