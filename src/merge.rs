//! Merge processor: fragments in, one bundle out.
//!
//! Phases:
//! 1. discover fragments and load them on the worker pool (corrupt ones are
//!    skipped and reported)
//! 2. build the section registry from every loaded section
//! 3. normalize, resolve, and validate test cases on the worker pool, one
//!    partial bundle per fragment
//! 4. reduce partial bundles sequentially in sequence order
//! 5. write the bundle atomically
//!
//! Workers never share an accumulator. Each returns its partial result and
//! the reduce step sees them in fragment order, so the bundle bytes do not
//! depend on scheduling.

use crate::bundle::{Bundle, BundleTestCase};
use crate::config::MergeConfig;
use crate::error::{Error, Result};
use crate::fragment::{self, Fragment, FragmentFile, FragmentListing};
use crate::mapping::{AttributeLookup, MappingConfig};
use crate::model::{
    AttributeSchema, AttributeValue, NormalizedTestCase, RequiredModel, Status, TestCase,
};
use crate::normalize::{NormalizePolicy, exclude_duplicates, normalize_test_case};
use crate::section::{SectionRegistry, derive_id, prune_unrooted};
use chrono::Utc;
use crossbeam_queue::SegQueue;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation flag checked between fragment tasks.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Report types
// ============================================================================

/// Why a test case was left out of the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RejectionReason {
    UnknownSection {
        section_id: i64,
    },
    MissingAttribute {
        attribute: String,
    },
    UnknownOwner {
        attribute: String,
        value: Option<String>,
    },
    StatusNotAllowed {
        status: Status,
    },
    DuplicateTestCase {
        first_sequence: u64,
    },
}

impl RejectionReason {
    /// Failed the required model, as opposed to a reference or identity problem.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingAttribute { .. }
                | Self::UnknownOwner { .. }
                | Self::StatusNotAllowed { .. }
        )
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSection { section_id } => write!(f, "unknown section id {section_id}"),
            Self::MissingAttribute { attribute } => {
                write!(f, "required attribute {attribute:?} is missing or empty")
            }
            Self::UnknownOwner {
                attribute,
                value: None,
            } => write!(f, "owner attribute {attribute:?} is missing or empty"),
            Self::UnknownOwner {
                attribute,
                value: Some(value),
            } => write!(f, "owner {value:?} in attribute {attribute:?} is not a known value"),
            Self::StatusNotAllowed { status } => write!(f, "state {status} is not importable"),
            Self::DuplicateTestCase { first_sequence } => write!(
                f,
                "external id already taken by fragment {first_sequence}"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub fragment_sequence: u64,
    pub external_id: String,
    pub reason: RejectionReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedFragment {
    pub path: PathBuf,
    pub reason: String,
}

/// Everything an operator needs to know about what did not make it in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub accepted_count: usize,
    pub rejected_count: usize,
    pub rejections: Vec<Rejection>,
    pub skipped_fragments: Vec<SkippedFragment>,
    /// Sections dropped because an ancestor lived only in a skipped fragment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pruned_sections: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub bundle: Bundle,
    pub report: MergeReport,
}

// ============================================================================
// Validation
// ============================================================================

/// Check a normalized test case against the importer's required model.
pub fn validate(
    test_case: &NormalizedTestCase,
    model: &RequiredModel,
) -> std::result::Result<(), RejectionReason> {
    for name in &model.required_attribute_names {
        if test_case
            .attributes
            .get(name)
            .is_none_or(AttributeValue::is_empty)
        {
            return Err(RejectionReason::MissingAttribute {
                attribute: name.clone(),
            });
        }
    }

    if let Some(owners) = &model.owners_attribute {
        let value = test_case
            .attributes
            .get(&owners.name)
            .and_then(AttributeValue::as_text)
            .map(str::trim)
            .filter(|value| !value.is_empty());
        match value {
            None => {
                return Err(RejectionReason::UnknownOwner {
                    attribute: owners.name.clone(),
                    value: None,
                });
            }
            Some(value)
                if !owners.known_values.is_empty() && !owners.known_values.contains(value) =>
            {
                return Err(RejectionReason::UnknownOwner {
                    attribute: owners.name.clone(),
                    value: Some(value.to_string()),
                });
            }
            Some(_) => {}
        }
    }

    let allowed = &model.status_data.allowed;
    if !allowed.is_empty() && !allowed.contains(&test_case.state) {
        return Err(RejectionReason::StatusNotAllowed {
            status: test_case.state,
        });
    }

    Ok(())
}

// ============================================================================
// Worker pool
// ============================================================================

/// Run `task` over `items` on at most `workers` scoped threads.
///
/// Results come back in input order. Workers stop taking new items once
/// `cancel` trips, in which case the whole call reports `Cancelled`.
fn run_pool<T, R, F>(
    items: &[T],
    workers: usize,
    cancel: &CancellationToken,
    task: F,
) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let queue = SegQueue::new();
    for index in 0..items.len() {
        queue.push(index);
    }
    let workers = workers.clamp(1, items.len().max(1));
    let queue = &queue;
    let task = &task;

    let finished = std::thread::scope(|scope| {
        let handles = (0..workers)
            .map(move |_| {
                scope.spawn(move || {
                    let mut done = Vec::new();
                    while !cancel.is_cancelled() {
                        let Some(index) = queue.pop() else {
                            break;
                        };
                        done.push((index, task(&items[index])));
                    }
                    done
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<std::result::Result<Vec<_>, _>>()
    })
    .map_err(|_| Error::Internal("merge worker panicked".to_string()))?;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut slots = items.iter().map(|_| None).collect::<Vec<Option<R>>>();
    for (index, result) in finished.into_iter().flatten() {
        slots[index] = Some(result);
    }
    slots
        .into_iter()
        .map(|slot| {
            slot.ok_or_else(|| Error::Internal("merge task produced no result".to_string()))
        })
        .collect()
}

// ============================================================================
// Merge processor
// ============================================================================

struct LoadedFragment {
    file: FragmentFile,
    fragment: Fragment,
}

/// Per-fragment output of the normalize phase.
#[derive(Debug, Default)]
struct PartialBundle {
    sequence_number: u64,
    accepted: Vec<BundleTestCase>,
    rejections: Vec<Rejection>,
    attributes: Vec<AttributeSchema>,
}

pub struct MergeProcessor<'a> {
    config: &'a MergeConfig,
    mappings: &'a dyn AttributeLookup,
    policy: NormalizePolicy,
}

impl<'a> MergeProcessor<'a> {
    #[must_use]
    pub fn new(config: &'a MergeConfig, mappings: &'a dyn AttributeLookup) -> Self {
        Self {
            config,
            mappings,
            policy: NormalizePolicy {
                max_tag_length: config.max_tag_length,
            },
        }
    }

    /// Assemble the bundle and write it, together with the report when a
    /// report path is configured.
    pub fn run(&self, cancel: &CancellationToken) -> Result<MergeOutcome> {
        let MergeOutcome { bundle, mut report } = self.assemble(cancel)?;

        // Last point at which the run may stop; the write below always finishes.
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let written = fragment::write_bundle(&self.config.output_path, &bundle)?;
        report.bundle_sha256 = Some(sha256_hex(&written));
        report.finished_at = Some(Utc::now().to_rfc3339());
        tracing::info!(
            path = %self.config.output_path.display(),
            bytes = written.len(),
            accepted = report.accepted_count,
            rejected = report.rejected_count,
            "wrote bundle"
        );

        if let Some(report_path) = &self.config.report_path {
            let encoded = serde_json::to_string_pretty(&report)?;
            fragment::write_atomic(report_path, encoded.as_bytes())?;
        }

        Ok(MergeOutcome { bundle, report })
    }

    /// Build the bundle in memory without writing anything.
    pub fn assemble(&self, cancel: &CancellationToken) -> Result<MergeOutcome> {
        let listing = fragment::discover_fragments(&self.config.fragments_dir)?;
        tracing::info!(
            fragments = listing.fragments.len(),
            workers = self.config.workers,
            "discovered fragments"
        );

        let mut report = MergeReport::default();
        let loaded = self.load_fragments(listing, cancel, &mut report)?;

        let mut sections = exclude_duplicates(
            loaded
                .iter()
                .flat_map(|loaded| loaded.fragment.sections.iter().cloned()),
        );
        // A skipped fragment may have held the only copy of some ancestors.
        if !report.skipped_fragments.is_empty() {
            let (kept, pruned) = prune_unrooted(sections);
            if !pruned.is_empty() {
                tracing::warn!(
                    pruned = pruned.len(),
                    "dropped sections whose ancestors are missing"
                );
            }
            sections = kept;
            report.pruned_sections = pruned;
        }
        let registry = SectionRegistry::build(sections)?;
        tracing::info!(sections = registry.len(), "section registry ready");

        let partials = run_pool(&loaded, self.config.workers, cancel, |loaded| {
            self.process_fragment(loaded, &registry)
        })?;

        let bundle = reduce(partials, &registry, &mut report)?;
        bundle.check_integrity()?;
        Ok(MergeOutcome { bundle, report })
    }

    fn load_fragments(
        &self,
        listing: FragmentListing,
        cancel: &CancellationToken,
        report: &mut MergeReport,
    ) -> Result<Vec<LoadedFragment>> {
        for (path, err) in listing.invalid {
            tracing::warn!("skipping fragment: {err}");
            report.skipped_fragments.push(SkippedFragment {
                path,
                reason: err.to_string(),
            });
        }

        let files = listing.fragments;
        let results = run_pool(&files, self.config.workers, cancel, |file| {
            fragment::read_fragment(&file.path)
        })?;

        let mut loaded = Vec::with_capacity(files.len());
        for (file, result) in files.into_iter().zip(results) {
            match result {
                Ok(fragment) => {
                    tracing::debug!(
                        sequence = file.sequence_number,
                        test_cases = fragment.test_cases.len(),
                        "loaded fragment"
                    );
                    loaded.push(LoadedFragment { file, fragment });
                }
                Err(err) if !err.is_fatal() => {
                    tracing::warn!("skipping fragment: {err}");
                    report.skipped_fragments.push(SkippedFragment {
                        path: file.path,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(loaded)
    }

    fn process_fragment(
        &self,
        loaded: &LoadedFragment,
        registry: &SectionRegistry,
    ) -> PartialBundle {
        let sequence_number = loaded.file.sequence_number;
        let mut partial = PartialBundle {
            sequence_number,
            ..PartialBundle::default()
        };

        for raw in &loaded.fragment.test_cases {
            match self.process_test_case(raw, registry) {
                Ok(test_case) => partial.accepted.push(test_case),
                Err(reason) => {
                    tracing::debug!(
                        sequence = sequence_number,
                        external_id = %raw.external_id,
                        "rejected test case: {reason}"
                    );
                    partial.rejections.push(Rejection {
                        fragment_sequence: sequence_number,
                        external_id: raw.external_id.clone(),
                        reason,
                    });
                }
            }
        }

        partial.attributes = loaded
            .fragment
            .attributes
            .iter()
            .map(|schema| self.map_schema(schema))
            .collect();
        partial
    }

    fn process_test_case(
        &self,
        raw: &TestCase,
        registry: &SectionRegistry,
    ) -> std::result::Result<BundleTestCase, RejectionReason> {
        let normalized = normalize_test_case(raw.clone(), self.mappings, self.policy);
        let section_id = registry
            .resolve(normalized.section_id)
            .map_err(|_| RejectionReason::UnknownSection {
                section_id: normalized.section_id,
            })?;
        validate(&normalized, &self.config.required_model)?;

        Ok(BundleTestCase {
            id: derive_id("test-case", &normalized.external_id),
            external_id: normalized.external_id,
            name: normalized.name,
            section_id,
            state: normalized.state,
            priority: normalized.priority,
            iterations: normalized.iterations,
            tags: normalized.tags,
            attributes: normalized.attributes,
        })
    }

    /// Target id plus option values run through the attribute's mapping table.
    fn map_schema(&self, schema: &AttributeSchema) -> AttributeSchema {
        let options = if schema.attribute_type.has_options() {
            exclude_duplicates(schema.options.iter().map(|option| {
                self.mappings
                    .lookup(&schema.name, option)
                    .unwrap_or(option)
                    .to_string()
            }))
        } else {
            schema.options.clone()
        };
        AttributeSchema {
            id: derive_id("attribute", &schema.name).to_string(),
            options,
            ..schema.clone()
        }
    }
}

/// Fold partial bundles, in fragment order, into the final bundle.
fn reduce(
    partials: Vec<PartialBundle>,
    registry: &SectionRegistry,
    report: &mut MergeReport,
) -> Result<Bundle> {
    let mut attributes: BTreeMap<String, AttributeSchema> = BTreeMap::new();
    let mut accepted: BTreeMap<String, (u64, BundleTestCase)> = BTreeMap::new();

    for partial in partials {
        for schema in partial.attributes {
            merge_attribute(&mut attributes, schema)?;
        }
        report.rejections.extend(partial.rejections);

        for test_case in partial.accepted {
            match accepted.entry(test_case.external_id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert((partial.sequence_number, test_case));
                }
                Entry::Occupied(first) => {
                    tracing::warn!(
                        external_id = %test_case.external_id,
                        first = first.get().0,
                        duplicate = partial.sequence_number,
                        "duplicate test case"
                    );
                    report.rejections.push(Rejection {
                        fragment_sequence: partial.sequence_number,
                        external_id: test_case.external_id,
                        reason: RejectionReason::DuplicateTestCase {
                            first_sequence: first.get().0,
                        },
                    });
                }
            }
        }
    }

    report.accepted_count = accepted.len();
    report.rejected_count = report.rejections.len();
    if report.rejected_count > 0 {
        tracing::warn!(rejected = report.rejected_count, "some test cases were rejected");
    }

    Ok(Bundle {
        sections: registry.bundle_sections(),
        attributes: attributes.into_values().collect(),
        test_cases: accepted.into_values().map(|(_, test_case)| test_case).collect(),
    })
}

/// Deduplicate schema entries by (name, type). Options are unioned in
/// first-seen order and flags are or-ed; a second type for one name is fatal.
fn merge_attribute(
    attributes: &mut BTreeMap<String, AttributeSchema>,
    schema: AttributeSchema,
) -> Result<()> {
    match attributes.entry(schema.name.clone()) {
        Entry::Vacant(slot) => {
            slot.insert(schema);
        }
        Entry::Occupied(mut slot) => {
            let existing = slot.get_mut();
            if existing.attribute_type != schema.attribute_type {
                return Err(Error::MergeConflict {
                    name: schema.name,
                    first: existing.attribute_type,
                    second: schema.attribute_type,
                });
            }
            existing.options = exclude_duplicates(
                std::mem::take(&mut existing.options)
                    .into_iter()
                    .chain(schema.options),
            );
            existing.is_enabled |= schema.is_enabled;
            existing.is_required |= schema.is_required;
            existing.is_global |= schema.is_global;
        }
    }
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Set up run-scoped collaborators from `config` and run the merge.
pub fn run_merge(config: &MergeConfig, cancel: &CancellationToken) -> Result<MergeOutcome> {
    config.validate()?;
    let mappings = MappingConfig::new();
    if let Some(settings) = &config.mapping {
        mappings.init_once(&settings.config_path, &settings.mapping_dir)?;
    }
    MergeProcessor::new(config, &mappings).run(cancel)
}
