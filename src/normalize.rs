//! Per-test-case normalization.
//!
//! Everything here is a pure function of its input plus an injected mapping
//! lookup. Conversions of best-effort metadata (status, priority) are total:
//! unrecognized input maps to a default instead of failing the test case.

use crate::mapping::AttributeLookup;
use crate::model::{AttributeValue, Iteration, NormalizedTestCase, Priority, Status, TestCase};
use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;

/// Default maximum tag length, in characters, accepted by the target system.
pub const DEFAULT_MAX_TAG_LENGTH: usize = 255;

/// Knobs for [`normalize_test_case`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizePolicy {
    pub max_tag_length: usize,
}

impl Default for NormalizePolicy {
    fn default() -> Self {
        Self {
            max_tag_length: DEFAULT_MAX_TAG_LENGTH,
        }
    }
}

/// Stable dedup by full-value equality. First occurrence wins.
pub fn exclude_duplicates<T, I>(items: I) -> Vec<T>
where
    T: Eq + Hash + Clone,
    I: IntoIterator<Item = T>,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Drop null and empty iterations, then collapse repeated
/// (parameters, expected result) pairs keeping the first.
#[must_use]
pub fn sanitize_iterations(iterations: &[Option<Iteration>]) -> Vec<Iteration> {
    exclude_duplicates(
        iterations
            .iter()
            .flatten()
            .filter(|iteration| !iteration.is_empty())
            .cloned(),
    )
}

/// Lowercase, trim, and fold `_`/`-` into spaces so "Needs_Work" and
/// "needs work" compare equal.
fn fold(source: &str) -> String {
    source
        .trim()
        .to_lowercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Map a source priority onto the target scale. Unknown or empty input is
/// `Medium`.
#[must_use]
pub fn convert_priority(source: &str) -> Priority {
    match fold(source).as_str() {
        "lowest" | "trivial" | "minor" | "low" | "p4" | "p5" | "4" | "5" => Priority::Low,
        "high" | "major" | "p2" | "2" => Priority::High,
        "critical" | "blocker" | "highest" | "urgent" | "p1" | "p0" | "1" | "0" => {
            Priority::Critical
        }
        _ => Priority::Medium,
    }
}

/// Map a source workflow status onto the target states. Unknown or empty
/// input is `NotReady`.
#[must_use]
pub fn convert_status(source: &str) -> Status {
    match fold(source).as_str() {
        "ready" | "approved" | "active" | "actual" | "done" | "final" => Status::Ready,
        "needs work" | "needs update" | "rework" | "outdated" | "deprecated" | "review" => {
            Status::NeedsWork
        }
        _ => Status::NotReady,
    }
}

/// Trim tags, drop blank ones, and remove repeats.
#[must_use]
pub fn sanitize_tags(tags: &[String]) -> Vec<String> {
    exclude_duplicates(
        tags.iter()
            .map(|tag| tag.trim())
            .filter(|tag| !tag.is_empty())
            .map(str::to_string),
    )
}

/// Drop tags longer than `max_len` characters from the test case.
///
/// Over-length tags are removed, never truncated: a truncated tag could
/// collide with an unrelated shorter one. Returns what was dropped.
pub fn exclude_long_tags(test_case: &mut TestCase, max_len: usize) -> Vec<String> {
    let (kept, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut test_case.tags)
        .into_iter()
        .partition(|tag| tag.chars().count() <= max_len);
    test_case.tags = kept;
    dropped
}

/// Rewrite text values and list elements through the mapping tables.
#[must_use]
pub fn map_attributes(
    attributes: &BTreeMap<String, AttributeValue>,
    lookup: &dyn AttributeLookup,
) -> BTreeMap<String, AttributeValue> {
    attributes
        .iter()
        .map(|(name, value)| (name.clone(), map_value(name, value, lookup)))
        .collect()
}

fn map_value(name: &str, value: &AttributeValue, lookup: &dyn AttributeLookup) -> AttributeValue {
    let map_one = |text: &str| lookup.lookup(name, text).unwrap_or(text).to_string();
    match value {
        AttributeValue::Flag(flag) => AttributeValue::Flag(*flag),
        AttributeValue::Text(text) => AttributeValue::Text(map_one(text)),
        AttributeValue::List(items) => {
            AttributeValue::List(exclude_duplicates(items.iter().map(|item| map_one(item))))
        }
    }
}

/// Full per-case pipeline.
pub fn normalize_test_case(
    mut raw: TestCase,
    lookup: &dyn AttributeLookup,
    policy: NormalizePolicy,
) -> NormalizedTestCase {
    raw.tags = sanitize_tags(&raw.tags);
    let dropped = exclude_long_tags(&mut raw, policy.max_tag_length);
    if !dropped.is_empty() {
        tracing::warn!(
            external_id = %raw.external_id,
            dropped = dropped.len(),
            max_len = policy.max_tag_length,
            "dropped over-length tags"
        );
    }

    NormalizedTestCase {
        state: convert_status(raw.status.as_deref().unwrap_or_default()),
        priority: convert_priority(raw.priority.as_deref().unwrap_or_default()),
        iterations: sanitize_iterations(&raw.iterations),
        attributes: map_attributes(&raw.attributes, lookup),
        tags: raw.tags,
        external_id: raw.external_id,
        name: raw.name.trim().to_string(),
        section_id: raw.section_id,
    }
}
