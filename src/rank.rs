//! Ranked Result Builder: total ordering, truncation, history writes.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::history::HistoryStore;
use crate::model::{HistoryEntry, PersistenceFailure, PersistenceReport, RunId, Topic};
use crate::trend::Sentinel;

/// Score desc, corroborating sources desc, canonical title asc (ordinal), topic id asc.
///
/// The topic id tie-break only matters for distinct topics sharing a display title,
/// which can happen when their dedup keys differ only by aliasing.
pub fn compare(a: &Topic, b: &Topic) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.source_count().cmp(&a.source_count()))
        .then_with(|| a.canonical_title.cmp(&b.canonical_title))
        .then_with(|| a.topic_id.cmp(&b.topic_id))
}

/// Order, then truncate to `limit`, then assign 1-based ranks.
pub fn order_and_truncate(mut topics: Vec<Topic>, limit: Option<usize>) -> Vec<Topic> {
    topics.sort_by(compare);
    if let Some(n) = limit {
        if topics.len() > n {
            tracing::debug!(target: "rank", kept = n, dropped = topics.len() - n, "truncated ranked output");
            topics.truncate(n);
        }
    }
    for (i, t) in topics.iter_mut().enumerate() {
        t.rank = u32::try_from(i + 1).unwrap_or(u32::MAX);
    }
    topics
}

pub fn history_entry(run_id: RunId, timestamp: DateTime<Utc>, topic: &Topic) -> HistoryEntry {
    HistoryEntry {
        run_id,
        timestamp,
        rank: Some(topic.rank),
        score: topic.score,
        title: topic.canonical_title.clone(),
        state: topic.lifecycle_state,
        first_seen_run: Some(topic.first_seen_run),
    }
}

/// Write one entry per retained topic plus departed-topic sentinels.
/// Each write stands alone; failures are collected, never short-circuit.
pub async fn persist(
    store: &dyn HistoryStore,
    run_id: RunId,
    timestamp: DateTime<Utc>,
    topics: &[Topic],
    sentinels: Vec<Sentinel>,
) -> PersistenceReport {
    let writes = topics
        .iter()
        .map(|t| (t.topic_id.clone(), history_entry(run_id, timestamp, t)))
        .chain(sentinels.into_iter().map(|s| (s.topic_id, s.entry)));

    let mut report = PersistenceReport::default();
    for (topic_id, entry) in writes {
        match store.put(&topic_id, entry).await {
            Ok(()) => report.written += 1,
            Err(e) => {
                tracing::warn!(target: "rank", %topic_id, error = %e, "history write failed");
                report.failures.push(PersistenceFailure {
                    topic_id,
                    reason: e.to_string(),
                });
            }
        }
    }
    report
}
