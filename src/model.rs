//! Domain types shared by fragments, the normalizer, and the bundle.
//!
//! Pre-normalization shapes (`TestCase`, `Section`) are what source connectors
//! emit into fragments. Post-normalization shapes (`NormalizedTestCase`) carry
//! closed target enums and sanitized collections.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// Sections
// ============================================================================

/// A section (folder/suite) as exported from the source system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
}

impl Section {
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>, parent_id: Option<i64>) -> Self {
        Self {
            id,
            name: name.into(),
            parent_id,
        }
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// Kind of a custom attribute in the target schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeType {
    String,
    Datetime,
    Options,
    User,
    MultipleOptions,
    Checkbox,
}

impl AttributeType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Datetime => "datetime",
            Self::Options => "options",
            Self::User => "user",
            Self::MultipleOptions => "multipleOptions",
            Self::Checkbox => "checkbox",
        }
    }

    /// Whether option values of this attribute are subject to value mapping.
    #[must_use]
    pub const fn has_options(self) -> bool {
        matches!(self, Self::Options | Self::MultipleOptions)
    }
}

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn default_true() -> bool {
    true
}

/// One custom attribute declaration.
///
/// In fragments `id` is whatever the source system used; in the bundle it is
/// the derived target id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeSchema {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub is_required: bool,
    #[serde(rename = "type")]
    pub attribute_type: AttributeType,
    #[serde(default)]
    pub is_global: bool,
    #[serde(default)]
    pub options: Vec<String>,
}

impl AttributeSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            is_enabled: true,
            is_required: false,
            attribute_type,
            is_global: false,
            options: Vec::new(),
        }
    }
}

/// Value of a custom attribute on a test case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Flag(bool),
    Text(String),
    List(Vec<String>),
}

impl AttributeValue {
    /// Blank text and lists without a non-blank element count as empty.
    /// Checkbox flags are never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Flag(_) => false,
            Self::Text(text) => text.trim().is_empty(),
            Self::List(items) => items.iter().all(|item| item.trim().is_empty()),
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

// ============================================================================
// Test cases
// ============================================================================

/// One parameterized run of a test case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Iteration {
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_result: Option<String>,
}

impl Iteration {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
            && self
                .expected_result
                .as_deref()
                .is_none_or(|text| text.trim().is_empty())
    }
}

/// A test case in the shape source connectors emit.
///
/// Best-effort fields are read leniently: a value of the wrong shape is
/// dropped or coerced on its own instead of failing the whole fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub external_id: String,
    pub name: String,
    pub section_id: i64,
    #[serde(default, deserialize_with = "lenient::text")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub priority: Option<String>,
    #[serde(default, deserialize_with = "lenient::iterations")]
    pub iterations: Vec<Option<Iteration>>,
    #[serde(default, deserialize_with = "lenient::texts")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "lenient::attributes")]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl TestCase {
    #[must_use]
    pub fn new(external_id: impl Into<String>, name: impl Into<String>, section_id: i64) -> Self {
        Self {
            external_id: external_id.into(),
            name: name.into(),
            section_id,
            status: None,
            priority: None,
            iterations: Vec::new(),
            tags: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }
}

mod lenient {
    use super::{AttributeValue, Iteration};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use std::collections::BTreeMap;

    /// Strings pass through, numbers and booleans are spelled out, and
    /// everything else is dropped.
    fn scalar_text(value: Value) -> Option<String> {
        match value {
            Value::String(text) => Some(text),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(flag) => Some(flag.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(Option::<Value>::deserialize(deserializer)?.and_then(scalar_text))
    }

    /// A list of scalars; a lone scalar counts as a one-element list.
    pub fn texts<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::Array(items)) => items.into_iter().filter_map(scalar_text).collect(),
            Some(other) => scalar_text(other).into_iter().collect(),
            None => Vec::new(),
        })
    }

    /// Iterations that do not parse become `None` and are dropped later with
    /// the null ones.
    pub fn iterations<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Option<Iteration>>, D::Error> {
        Ok(Option::<Vec<Value>>::deserialize(deserializer)?
            .unwrap_or_default()
            .into_iter()
            .map(|item| serde_json::from_value::<Option<Iteration>>(item).ok().flatten())
            .collect())
    }

    /// Null and object values are dropped, so a required attribute holding
    /// one is reported missing for that test case alone.
    pub fn attributes<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, AttributeValue>, D::Error> {
        Ok(Option::<BTreeMap<String, Value>>::deserialize(deserializer)?
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(name, value)| {
                let value = match value {
                    Value::Bool(flag) => AttributeValue::Flag(flag),
                    Value::Array(items) => {
                        AttributeValue::List(items.into_iter().filter_map(scalar_text).collect())
                    }
                    other => AttributeValue::Text(scalar_text(other)?),
                };
                Some((name, value))
            })
            .collect())
    }
}

/// Target priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Target work-item state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Status {
    #[default]
    NotReady,
    Ready,
    NeedsWork,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NotReady => "NotReady",
            Self::Ready => "Ready",
            Self::NeedsWork => "NeedsWork",
        })
    }
}

/// A test case after normalization, still referencing its source section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTestCase {
    pub external_id: String,
    pub name: String,
    pub section_id: i64,
    pub state: Status,
    pub priority: Priority,
    pub iterations: Vec<Iteration>,
    pub tags: Vec<String>,
    pub attributes: BTreeMap<String, AttributeValue>,
}

// ============================================================================
// Validation contract
// ============================================================================

/// Attribute holding the test case owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnersAttribute {
    pub name: String,
    /// Accepted owner values after mapping. Empty accepts any non-blank value.
    #[serde(default)]
    pub known_values: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    /// Importable states. Empty means every state is importable.
    #[serde(default)]
    pub allowed: Vec<Status>,
}

/// What the target importer requires of every test case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredModel {
    #[serde(default)]
    pub owners_attribute: Option<OwnersAttribute>,
    #[serde(default)]
    pub status_data: StatusData,
    #[serde(default)]
    pub required_attribute_names: Vec<String>,
}
