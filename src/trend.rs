// src/trend.rs
//! Trend Tracker: lifecycle classification against prior runs.
//!
//! History is read once per run (`TrendTracker::load`) and then consulted twice:
//! a provisional score-based pass before ordering, and the final rank-based pass after
//! the Ranked Result Builder assigns positions. Entries stamped with the current run id
//! or later are ignored, so a retried run classifies exactly like the first attempt.
//!
//! Departed topics: a topic whose latest entry is a present entry from the previous run
//! and which is absent now gets one sentinel entry (`rank = None`) and is reported as
//! FADING. It keeps being reported while `run_id - sentinel_run < retention_runs`.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use futures::future::join_all;

use crate::history::HistoryStore;
use crate::model::{DepartedTopic, HistoryEntry, LifecycleState, RunId, RunWarning, Topic};

/// Rank-based classification. `prev_rank` and `rank` are 1-based; lower is better.
pub fn classify(prev_rank: u32, rank: u32, threshold: u32) -> LifecycleState {
    let (prev, cur, th) = (i64::from(prev_rank), i64::from(rank), i64::from(threshold));
    if prev - cur >= th {
        LifecycleState::Rising
    } else if cur - prev >= th {
        LifecycleState::Fading
    } else {
        LifecycleState::Persistent
    }
}

/// History visible to one run.
#[derive(Debug, Default)]
pub struct PriorHistory {
    run_id: RunId,
    entries: BTreeMap<String, Vec<HistoryEntry>>,
    /// Most recent earlier run that left any entry.
    prior_run: Option<RunId>,
    pub warnings: Vec<RunWarning>,
}

impl PriorHistory {
    pub fn entries(&self, topic_id: &str) -> &[HistoryEntry] {
        self.entries.get(topic_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last_present(&self, topic_id: &str) -> Option<&HistoryEntry> {
        self.entries(topic_id).iter().rev().find(|e| !e.is_missing())
    }

    pub fn prior_run(&self) -> Option<RunId> {
        self.prior_run
    }
}

/// Sentinel write produced by departed-topic detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentinel {
    pub topic_id: String,
    pub entry: HistoryEntry,
}

#[derive(Debug, Clone)]
pub struct TrendTracker {
    threshold: u32,
    retention_runs: u64,
}

impl TrendTracker {
    pub fn new(threshold: u32, retention_runs: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            retention_runs,
        }
    }

    /// Read history for the current topics plus everything the store knows about.
    /// Lookup failures become warnings; affected topics are treated as never seen.
    pub async fn load(
        &self,
        store: &dyn HistoryStore,
        run_id: RunId,
        current: &[&str],
    ) -> PriorHistory {
        let mut prior = PriorHistory {
            run_id,
            ..Default::default()
        };

        let mut ids: BTreeSet<String> = current.iter().map(|s| s.to_string()).collect();
        match store.topic_ids().await {
            Ok(stored) => ids.extend(stored),
            Err(e) => {
                tracing::warn!(target: "trend", error = %e, "history listing failed, departed topics skipped");
                prior.warnings.push(RunWarning::HistoryUnavailable {
                    topic_id: None,
                    reason: e.to_string(),
                });
            }
        }

        let ids: Vec<String> = ids.into_iter().collect();
        let results = join_all(ids.iter().map(|id| store.get(id))).await;
        for (id, res) in ids.into_iter().zip(results) {
            match res {
                Ok(mut entries) => {
                    entries.retain(|e| e.run_id < run_id);
                    if let Some(last) = entries.last() {
                        prior.prior_run = prior.prior_run.max(Some(last.run_id));
                        prior.entries.insert(id, entries);
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "trend", topic_id = %id, error = %e, "history lookup failed, treating topic as new");
                    prior.warnings.push(RunWarning::HistoryUnavailable {
                        topic_id: Some(id),
                        reason: e.to_string(),
                    });
                }
            }
        }
        prior
    }

    /// Score-based pass, before ranks exist.
    pub fn provisional(&self, prior: &PriorHistory, topics: &mut [Topic]) {
        for t in topics.iter_mut() {
            t.first_seen_run = prior
                .entries(&t.topic_id)
                .first()
                .map(HistoryEntry::first_seen)
                .unwrap_or(prior.run_id);
            t.lifecycle_state = match prior.last_present(&t.topic_id) {
                None => LifecycleState::New,
                Some(prev) if t.score > prev.score => LifecycleState::Rising,
                Some(prev) if t.score < prev.score => LifecycleState::Fading,
                Some(_) => LifecycleState::Persistent,
            };
        }
    }

    /// Rank-based pass. Expects `rank` to be assigned.
    pub fn finalize(&self, prior: &PriorHistory, topics: &mut [Topic]) {
        for t in topics.iter_mut() {
            t.last_seen_run = prior.run_id;
            t.rank_history = prior
                .entries(&t.topic_id)
                .iter()
                .filter_map(|e| e.rank.map(|r| (e.run_id, r)))
                .collect();
            t.rank_history.push((prior.run_id, t.rank));

            match prior.last_present(&t.topic_id).and_then(|e| e.rank) {
                None => {
                    t.lifecycle_state = LifecycleState::New;
                    t.rank_delta = None;
                }
                Some(prev) => {
                    t.lifecycle_state = classify(prev, t.rank, self.threshold);
                    t.rank_delta = Some(i64::from(prev) - i64::from(t.rank));
                }
            }
        }
    }

    /// Topics absent from this run that still deserve a FADING report, plus the sentinel
    /// entries to persist for the ones that just disappeared.
    pub fn departed(
        &self,
        prior: &PriorHistory,
        present: &HashSet<&str>,
        timestamp: DateTime<Utc>,
    ) -> (Vec<DepartedTopic>, Vec<Sentinel>) {
        let run_id = prior.run_id;
        let mut departed = Vec::new();
        let mut sentinels = Vec::new();

        for (id, entries) in &prior.entries {
            if present.contains(id.as_str()) {
                continue;
            }
            let (Some(last), Some(seen)) = (entries.last(), prior.last_present(id)) else {
                continue;
            };
            let Some(last_rank) = seen.rank else {
                continue;
            };

            if !last.is_missing() {
                if prior.prior_run != Some(last.run_id) {
                    continue;
                }
                sentinels.push(Sentinel {
                    topic_id: id.clone(),
                    entry: HistoryEntry {
                        run_id,
                        timestamp,
                        rank: None,
                        score: last.score,
                        title: last.title.clone(),
                        state: LifecycleState::Fading,
                        first_seen_run: Some(last.first_seen()),
                    },
                });
            } else if run_id - last.run_id >= self.retention_runs {
                continue;
            }

            departed.push(DepartedTopic {
                topic_id: id.clone(),
                title: seen.title.clone(),
                last_rank,
                last_seen_run: seen.run_id,
                runs_missing: run_id - seen.run_id,
                lifecycle_state: LifecycleState::Fading,
            });
        }

        departed.sort_by(|a, b| {
            a.runs_missing
                .cmp(&b.runs_missing)
                .then(a.last_rank.cmp(&b.last_rank))
                .then_with(|| a.topic_id.cmp(&b.topic_id))
        });
        if !departed.is_empty() {
            tracing::debug!(target: "trend", departed = departed.len(), new_sentinels = sentinels.len(), "departed topics");
        }
        (departed, sentinels)
    }
}
