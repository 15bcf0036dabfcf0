// src/dedup.rs
//! Deduplicator: merges items from all sources that normalize to the same key.
//!
//! Order of operations:
//! 1) per source, collapse repeated `external_id`s (last write by `observed_at` wins)
//! 2) group by dedup key, keeping at most one member per source (best rank)
//! 3) pick the canonical title: best rank, then source priority, then first seen

use std::collections::{BTreeMap, BTreeSet, HashMap};
use strsim::normalized_levenshtein;

use crate::config::SourcesSection;
use crate::model::{LifecycleState, RawItem, RunId, RunWarning, Topic};
use crate::normalize::{display_title, topic_id, DedupKeyer};

/// Result of one dedup pass.
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    pub topics: Vec<Topic>,
    /// Items that were folded into an existing topic (or dropped as same-source repeats).
    pub merged_items: usize,
    pub warnings: Vec<RunWarning>,
}

#[derive(Debug)]
struct Member {
    item: RawItem,
    seq: usize,
}

pub struct Deduplicator<'a> {
    keyer: DedupKeyer,
    sources: &'a SourcesSection,
    ambiguity_similarity: f64,
}

impl<'a> Deduplicator<'a> {
    pub fn new(keyer: DedupKeyer, sources: &'a SourcesSection, ambiguity_similarity: f64) -> Self {
        Self {
            keyer,
            sources,
            ambiguity_similarity,
        }
    }

    pub fn dedup_key(&self, item: &RawItem) -> String {
        let key = self.keyer.key(&item.title);
        if key.is_empty() {
            // Titles without any alphanumerics never merge.
            format!("{}/{}", item.source_id, item.external_id)
        } else {
            key
        }
    }

    pub fn run(&self, run_id: RunId, per_source: &BTreeMap<String, Vec<RawItem>>) -> DedupOutcome {
        let items = collapse_external_ids(per_source);
        let total = items.len();

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<Member>> = HashMap::new();
        for (seq, item) in items.into_iter().enumerate() {
            let key = self.dedup_key(&item);
            let group = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                Vec::new()
            });
            match group
                .iter_mut()
                .find(|m| m.item.source_id == item.source_id)
            {
                Some(existing) => {
                    if item.rank_in_source < existing.item.rank_in_source {
                        *existing = Member { item, seq };
                    }
                }
                None => group.push(Member { item, seq }),
            }
        }

        let mut outcome = DedupOutcome {
            merged_items: total - order.len(),
            ..Default::default()
        };

        for key in order {
            let Some(mut members) = groups.remove(&key) else {
                continue;
            };
            members.sort_by_key(|m| {
                (
                    m.item.rank_in_source,
                    self.sources.priority_of(&m.item.source_id),
                    m.seq,
                )
            });
            let id = topic_id(&key);
            let canonical = display_or_raw(&members[0].item.title);
            self.audit_ambiguity(&id, &canonical, &members, &mut outcome.warnings);

            outcome.topics.push(Topic {
                topic_id: id,
                canonical_title: canonical,
                member_items: members.into_iter().map(|m| m.item).collect(),
                matched_rules: BTreeSet::new(),
                score: 0.0,
                first_seen_run: run_id,
                last_seen_run: run_id,
                lifecycle_state: LifecycleState::New,
                rank: 0,
                rank_delta: None,
                rank_history: Vec::new(),
            });
        }

        tracing::debug!(
            target: "dedup",
            items = total,
            topics = outcome.topics.len(),
            merged = outcome.merged_items,
            "dedup pass done"
        );
        outcome
    }

    fn audit_ambiguity(
        &self,
        topic_id: &str,
        canonical: &str,
        members: &[Member],
        warnings: &mut Vec<RunWarning>,
    ) {
        let kept = canonical.to_lowercase();
        for m in members.iter().skip(1) {
            let other = display_or_raw(&m.item.title);
            let sim = normalized_levenshtein(&kept, &other.to_lowercase());
            if sim < self.ambiguity_similarity {
                tracing::debug!(
                    target: "dedup",
                    topic_id,
                    kept = canonical,
                    merged = %other,
                    similarity = sim,
                    "dedup ambiguity"
                );
                warnings.push(RunWarning::DedupAmbiguity {
                    topic_id: topic_id.to_string(),
                    kept_title: canonical.to_string(),
                    merged_title: other,
                    similarity: sim,
                });
            }
        }
    }
}

fn display_or_raw(title: &str) -> String {
    let d = display_title(title);
    if d.is_empty() {
        title.trim().to_string()
    } else {
        d
    }
}

/// Flatten sources in key order; repeated `external_id` within a source keeps the
/// latest `observed_at` (ties: later in the list) at the first occurrence's position.
/// The map key is authoritative for `source_id`.
pub fn collapse_external_ids(per_source: &BTreeMap<String, Vec<RawItem>>) -> Vec<RawItem> {
    let mut out: Vec<RawItem> = Vec::new();
    for (source_id, items) in per_source {
        let mut slot: HashMap<String, usize> = HashMap::new();
        for item in items {
            let mut item = item.clone();
            if item.source_id != *source_id {
                tracing::debug!(target: "dedup", expected = %source_id, got = %item.source_id, "item source_id rewritten to its snapshot key");
                item.source_id = source_id.clone();
            }
            match slot.get(&item.external_id) {
                Some(&pos) => {
                    if item.observed_at >= out[pos].observed_at {
                        out[pos] = item;
                    }
                }
                None => {
                    slot.insert(item.external_id.clone(), out.len());
                    out.push(item);
                }
            }
        }
    }
    out
}
