//! model.rs: shared value types flowing through one run of the pipeline.
//!
//! `RawItem` and rules live for a single run. `Topic` is rebuilt every run from the
//! current items plus history lookups; its cross-run identity is the `topic_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Monotonic run sequence number assigned by the caller.
pub type RunId = u64;

/// One hot-list entry as delivered by a fetch adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub source_id: String,
    pub external_id: String,
    pub title: String,
    /// 1-based position inside the source's list; lower is better.
    pub rank_in_source: u32,
    pub observed_at: DateTime<Utc>,
}

impl RawItem {
    pub fn new(
        source_id: impl Into<String>,
        external_id: impl Into<String>,
        title: impl Into<String>,
        rank_in_source: u32,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            external_id: external_id.into(),
            title: title.into(),
            rank_in_source,
            observed_at,
        }
    }
}

/// Input for one run. Sources missing from `per_source` contributed zero items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub per_source: BTreeMap<String, Vec<RawItem>>,
}

impl RunInput {
    pub fn new(run_id: RunId, timestamp: DateTime<Utc>) -> Self {
        Self {
            run_id,
            timestamp,
            per_source: BTreeMap::new(),
        }
    }

    /// Builder-style helper, mostly for tests and the spool provider.
    pub fn with_source(mut self, source_id: impl Into<String>, items: Vec<RawItem>) -> Self {
        self.per_source.insert(source_id.into(), items);
        self
    }

    pub fn item_count(&self) -> usize {
        self.per_source.values().map(Vec::len).sum()
    }
}

/// Trend classification of a topic relative to its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    New,
    Rising,
    Persistent,
    Fading,
}

/// The deduplicated unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub topic_id: String,
    pub canonical_title: String,
    /// Never empty; at most one item per source.
    pub member_items: Vec<RawItem>,
    pub matched_rules: BTreeSet<String>,
    pub score: f64,
    pub first_seen_run: RunId,
    pub last_seen_run: RunId,
    pub lifecycle_state: LifecycleState,
    /// 1-based position in this run's ranked output; 0 until ranked.
    pub rank: u32,
    /// `previous_rank - rank`; positive means the topic moved up.
    pub rank_delta: Option<i64>,
    /// Append-only, ascending by run id. Includes this run once ranked.
    pub rank_history: Vec<(RunId, u32)>,
}

impl Topic {
    /// Distinct sources that surfaced this topic.
    pub fn sources(&self) -> BTreeSet<&str> {
        self.member_items
            .iter()
            .map(|it| it.source_id.as_str())
            .collect()
    }

    pub fn source_count(&self) -> usize {
        self.sources().len()
    }
}

/// One persisted observation of a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    /// `None` marks the sentinel written when a topic disappears.
    pub rank: Option<u32>,
    pub score: f64,
    pub title: String,
    pub state: LifecycleState,
    /// Run the topic was first recorded in. Carried forward by the store so it
    /// survives entries being capped away.
    #[serde(default)]
    pub first_seen_run: Option<RunId>,
}

impl HistoryEntry {
    pub fn is_missing(&self) -> bool {
        self.rank.is_none()
    }

    pub fn first_seen(&self) -> RunId {
        self.first_seen_run.unwrap_or(self.run_id)
    }
}

/// A topic seen in an earlier run but absent from the current input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepartedTopic {
    pub topic_id: String,
    pub title: String,
    pub last_rank: u32,
    pub last_seen_run: RunId,
    pub runs_missing: u64,
    pub lifecycle_state: LifecycleState,
}

/// Non-fatal conditions observed during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    /// An expected source delivered nothing (or failed to fetch).
    SourceGap { source_id: String, reason: String },
    /// Merged items whose raw titles differ noticeably.
    DedupAmbiguity {
        topic_id: String,
        kept_title: String,
        merged_title: String,
        similarity: f64,
    },
    /// History lookup failed; the topic was treated as never seen.
    HistoryUnavailable { topic_id: Option<String>, reason: String },
}

/// History write failure for one topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceFailure {
    pub topic_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistenceReport {
    pub written: usize,
    pub failures: Vec<PersistenceFailure>,
}

impl PersistenceReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    PartiallyPersisted,
}

/// The engine's sole output artifact for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub topics: Vec<Topic>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub departed: Vec<DepartedTopic>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<RunWarning>,
    pub persistence: PersistenceReport,
    pub status: RunStatus,
}

/// Compact view of a snapshot returned by the tool surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub topic_count: usize,
    pub merged_topics: usize,
    pub new: usize,
    pub rising: usize,
    pub persistent: usize,
    pub fading: usize,
    pub departed: usize,
    pub warnings: usize,
    pub persist_failures: usize,
    pub top: Vec<SummaryLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryLine {
    pub rank: u32,
    pub title: String,
    pub score: f64,
    pub state: LifecycleState,
    pub sources: Vec<String>,
}

impl RunSnapshot {
    pub fn summary(&self, top_n: usize) -> RunSummary {
        let count = |s: LifecycleState| {
            self.topics
                .iter()
                .filter(|t| t.lifecycle_state == s)
                .count()
        };
        RunSummary {
            run_id: self.run_id,
            timestamp: self.timestamp,
            status: self.status,
            topic_count: self.topics.len(),
            merged_topics: self.topics.iter().filter(|t| t.source_count() > 1).count(),
            new: count(LifecycleState::New),
            rising: count(LifecycleState::Rising),
            persistent: count(LifecycleState::Persistent),
            fading: count(LifecycleState::Fading),
            departed: self.departed.len(),
            warnings: self.warnings.len(),
            persist_failures: self.persistence.failures.len(),
            top: self
                .topics
                .iter()
                .take(top_n)
                .map(|t| SummaryLine {
                    rank: t.rank,
                    title: t.canonical_title.clone(),
                    score: t.score,
                    state: t.lifecycle_state,
                    sources: t.sources().into_iter().map(str::to_string).collect(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap()
    }

    #[test]
    fn lifecycle_serializes_uppercase() {
        let s = serde_json::to_string(&LifecycleState::Persistent).unwrap();
        assert_eq!(s, "\"PERSISTENT\"");
    }

    #[test]
    fn run_input_counts_items_across_sources() {
        let input = RunInput::new(1, ts())
            .with_source("a", vec![RawItem::new("a", "1", "x", 1, ts())])
            .with_source(
                "b",
                vec![
                    RawItem::new("b", "2", "y", 1, ts()),
                    RawItem::new("b", "3", "z", 2, ts()),
                ],
            );
        assert_eq!(input.item_count(), 3);
    }

    #[test]
    fn run_input_accepts_missing_per_source() {
        let input: RunInput =
            serde_json::from_str(r#"{"run_id":7,"timestamp":"2025-09-06T09:00:00Z"}"#).unwrap();
        assert!(input.per_source.is_empty());
    }
}
