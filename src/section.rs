//! Section registry: source section ids to target ids.
//!
//! Target ids are UUID v5 values derived from the source id, so rebuilding the
//! registry from the same sections always yields the same table. Orphans and
//! cycles reject the whole run; there is no synthetic root. When fragments were
//! skipped, [`prune_unrooted`] first removes subtrees whose ancestors went
//! missing with them.

use crate::bundle::BundleSection;
use crate::error::{Error, Result};
use crate::model::Section;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Namespace for every id this crate derives.
pub const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_3c2a_8b4e_5f70_9a12_c3d4_e5f6_0718);

/// Deterministic target id for a source key such as `section:42`.
#[must_use]
pub fn derive_id(kind: &str, key: &str) -> Uuid {
    Uuid::new_v5(&ID_NAMESPACE, format!("{kind}:{key}").as_bytes())
}

/// Sections plus their id table.
///
/// `section_map` keys are exactly the ids of `sections`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionData {
    pub sections: Vec<Section>,
    pub section_map: BTreeMap<i64, Uuid>,
}

#[derive(Debug, Clone)]
pub struct SectionRegistry {
    data: SectionData,
}

impl SectionRegistry {
    pub fn build(sections: Vec<Section>) -> Result<Self> {
        let mut section_map = BTreeMap::new();
        for section in &sections {
            let target = derive_id("section", &section.id.to_string());
            if section_map.insert(section.id, target).is_some() {
                return Err(Error::DuplicateSection { id: section.id });
            }
        }

        let parents = sections
            .iter()
            .map(|section| (section.id, section.parent_id))
            .collect::<BTreeMap<_, _>>();

        for section in &sections {
            if let Some(parent_id) = section.parent_id {
                if !section_map.contains_key(&parent_id) {
                    return Err(Error::OrphanSection {
                        id: section.id,
                        parent_id,
                    });
                }
            }
        }

        check_acyclic(&parents)?;

        tracing::debug!(sections = sections.len(), "built section registry");
        Ok(Self {
            data: SectionData {
                sections,
                section_map,
            },
        })
    }

    pub fn resolve(&self, source_id: i64) -> Result<Uuid> {
        self.data
            .section_map
            .get(&source_id)
            .copied()
            .ok_or(Error::UnknownSection { id: source_id })
    }

    #[must_use]
    pub const fn section_data(&self) -> &SectionData {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.sections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.sections.is_empty()
    }

    /// Bundle sections ordered by source id, parents rewritten to target ids.
    #[must_use]
    pub fn bundle_sections(&self) -> Vec<BundleSection> {
        let mut sections = self.data.sections.iter().collect::<Vec<_>>();
        sections.sort_by_key(|section| section.id);
        sections
            .into_iter()
            .map(|section| BundleSection {
                id: self.data.section_map[&section.id],
                name: section.name.clone(),
                parent_id: section
                    .parent_id
                    .map(|parent| self.data.section_map[&parent]),
            })
            .collect()
    }
}

/// Drop sections whose parent is not among `sections`, then their children,
/// until every remaining parent resolves. Cycles are left for
/// [`SectionRegistry::build`] to reject.
///
/// Returns the kept sections in input order and the dropped ids ascending.
#[must_use]
pub fn prune_unrooted(sections: Vec<Section>) -> (Vec<Section>, Vec<i64>) {
    let mut kept = sections;
    let mut pruned = Vec::new();
    loop {
        let known = kept.iter().map(|section| section.id).collect::<HashSet<_>>();
        let (rooted, orphaned): (Vec<_>, Vec<_>) = kept.into_iter().partition(|section| {
            section
                .parent_id
                .is_none_or(|parent| known.contains(&parent))
        });
        kept = rooted;
        if orphaned.is_empty() {
            break;
        }
        pruned.extend(orphaned.into_iter().map(|section| section.id));
    }
    pruned.sort_unstable();
    pruned.dedup();
    (kept, pruned)
}

/// Walk each parent chain until it reaches a root or a chain already seen
/// to reach one. Revisiting an id on the current chain is a cycle.
fn check_acyclic(parents: &BTreeMap<i64, Option<i64>>) -> Result<()> {
    let mut known_rooted = HashSet::new();
    for &start in parents.keys() {
        let mut path = Vec::new();
        let mut current = Some(start);
        while let Some(id) = current {
            if known_rooted.contains(&id) {
                break;
            }
            if path.contains(&id) {
                return Err(Error::SectionCycle { id });
            }
            path.push(id);
            current = parents.get(&id).copied().flatten();
        }
        known_rooted.extend(path);
    }
    Ok(())
}
