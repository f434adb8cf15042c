//! Shared fixtures for merge integration tests.

#![allow(dead_code)]

use casemerge::MergeConfig;
use casemerge::fragment::{Fragment, write_fragment};
use casemerge::model::{AttributeSchema, AttributeType, AttributeValue, Section, TestCase};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A scratch run directory with `fragments/` and an output location.
pub struct RunDir {
    pub dir: TempDir,
}

impl RunDir {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        std::fs::create_dir_all(dir.path().join("fragments")).expect("create fragments dir");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn fragments_dir(&self) -> PathBuf {
        self.root().join("fragments")
    }

    pub fn output_path(&self) -> PathBuf {
        self.root().join("out").join("bundle.json")
    }

    pub fn config(&self) -> MergeConfig {
        let mut config = MergeConfig::new(self.fragments_dir(), self.output_path());
        config.workers = 2;
        config
    }

    pub fn write(&self, fragment: &Fragment) -> PathBuf {
        write_fragment(&self.fragments_dir(), fragment).expect("write fragment")
    }

    pub fn write_raw(&self, name: &str, content: &str) -> PathBuf {
        let path = self.fragments_dir().join(name);
        std::fs::write(&path, content).expect("write raw fragment");
        path
    }
}

pub fn fragment(sequence_number: u64) -> Fragment {
    Fragment {
        sequence_number,
        ..Fragment::default()
    }
}

pub fn root_sections() -> Vec<Section> {
    vec![
        Section::new(1, "Root", None),
        Section::new(2, "Auth", Some(1)),
        Section::new(3, "Billing", Some(1)),
    ]
}

pub fn case(external_id: &str, section_id: i64) -> TestCase {
    let mut tc = TestCase::new(external_id, format!("Case {external_id}"), section_id);
    tc.status = Some("Ready".to_string());
    tc.priority = Some("High".to_string());
    tc
}

pub fn with_attr(mut tc: TestCase, name: &str, value: &str) -> TestCase {
    tc.attributes
        .insert(name.to_string(), AttributeValue::from(value));
    tc
}

pub fn schema(name: &str, attribute_type: AttributeType, options: &[&str]) -> AttributeSchema {
    let mut schema = AttributeSchema::new(name, attribute_type);
    schema.options = options.iter().map(|o| (*o).to_string()).collect();
    schema
}
