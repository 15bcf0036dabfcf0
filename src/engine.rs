//! # Trend Engine
//! One run of the pipeline: dedup → score → track → rank → persist.
//!
//! `Engine::run` never fails once input is collected. Source gaps, dedup ambiguities,
//! unreadable history and failed history writes are reported inside the snapshot.

use std::collections::HashSet;
use std::time::Instant;

use metrics::{counter, gauge, histogram};

use crate::collect::source_gaps;
use crate::config::EngineConfig;
use crate::dedup::Deduplicator;
use crate::history::HistoryStore;
use crate::metrics::ensure_metrics_described;
use crate::model::{RunInput, RunSnapshot, RunStatus, RunWarning};
use crate::normalize::DedupKeyer;
use crate::rank;
use crate::rules::HotReloadRules;
use crate::scoring::{retain_min_score, Scorer};
use crate::trend::TrendTracker;

pub struct Engine {
    config: EngineConfig,
    rules: HotReloadRules,
    keyer: DedupKeyer,
}

impl Engine {
    pub fn new(config: EngineConfig, rules: HotReloadRules) -> Self {
        let keyer = DedupKeyer::new(&config.aliases);
        Self {
            config,
            rules,
            keyer,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rules(&self) -> &HotReloadRules {
        &self.rules
    }

    pub async fn run(&self, input: RunInput, store: &dyn HistoryStore) -> RunSnapshot {
        self.run_with_warnings(input, Vec::new(), store).await
    }

    /// Same as `run`, carrying warnings raised while collecting the input.
    pub async fn run_with_warnings(
        &self,
        input: RunInput,
        mut warnings: Vec<RunWarning>,
        store: &dyn HistoryStore,
    ) -> RunSnapshot {
        ensure_metrics_described();
        let started = Instant::now();
        let cfg = &self.config.engine;
        let run_id = input.run_id;

        // Rules are re-read (if changed) once, at run start.
        let rules = self.rules.current();

        let gaps = source_gaps(&input, &self.config.sources.expected, &warnings);
        warnings.extend(gaps);
        for w in &warnings {
            if let RunWarning::SourceGap { source_id, reason } = w {
                tracing::warn!(target: "engine", run_id, source = %source_id, %reason, "source gap");
            }
        }

        // 1) dedup
        let dedup = Deduplicator::new(
            self.keyer.clone(),
            &self.config.sources,
            cfg.ambiguity_similarity,
        )
        .run(run_id, &input.per_source);
        warnings.extend(dedup.warnings);
        let mut topics = dedup.topics;
        let present: Vec<String> = topics.iter().map(|t| t.topic_id.clone()).collect();

        // 2) score + optional floor
        Scorer::new(&rules, cfg.corroboration_bonus, cfg.match_member_titles).apply(&mut topics);
        retain_min_score(&mut topics, cfg.min_score);

        // 3) provisional trend pass
        let tracker = TrendTracker::new(cfg.rank_delta_threshold, cfg.retention_runs);
        let present_refs: Vec<&str> = present.iter().map(String::as_str).collect();
        let mut prior = tracker.load(store, run_id, &present_refs).await;
        warnings.append(&mut prior.warnings);
        tracker.provisional(&prior, &mut topics);

        // 4) order, truncate, final trend pass
        let mut topics = rank::order_and_truncate(topics, cfg.topic_limit());
        tracker.finalize(&prior, &mut topics);

        let present_set: HashSet<&str> = present_refs.iter().copied().collect();
        let (departed, sentinels) = tracker.departed(&prior, &present_set, input.timestamp);

        // 5) writes: this run's entries, then topics past the horizon
        let persistence = rank::persist(store, run_id, input.timestamp, &topics, sentinels).await;
        let status = if persistence.is_complete() {
            RunStatus::Complete
        } else {
            RunStatus::PartiallyPersisted
        };
        let pruned = match run_id.checked_sub(cfg.history_horizon_runs) {
            Some(before) if before > 0 => match store.prune(before).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(target: "engine", run_id, error = %e, "history prune failed");
                    0
                }
            },
            _ => 0,
        };

        // Telemetry
        let gap_count = warnings
            .iter()
            .filter(|w| matches!(w, RunWarning::SourceGap { .. }))
            .count();
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let status_label = match status {
            RunStatus::Complete => "complete",
            RunStatus::PartiallyPersisted => "partial",
        };
        counter!("trend_runs_total", "status" => status_label).increment(1);
        counter!("trend_items_total").increment(input.item_count() as u64);
        counter!("trend_topics_total").increment(topics.len() as u64);
        counter!("trend_dedup_merged_total").increment(dedup.merged_items as u64);
        counter!("trend_source_gaps_total").increment(gap_count as u64);
        counter!("trend_persist_failures_total").increment(persistence.failures.len() as u64);
        counter!("trend_history_pruned_total").increment(pruned as u64);
        gauge!("trend_last_run_ts").set(input.timestamp.timestamp() as f64);
        histogram!("trend_run_ms").record(elapsed_ms);

        tracing::info!(
            target: "engine",
            run_id,
            items = input.item_count(),
            sources = input.per_source.len(),
            topics = topics.len(),
            merged = dedup.merged_items,
            departed = departed.len(),
            gaps = gap_count,
            warnings = warnings.len(),
            rules = rules.len(),
            persist_failures = persistence.failures.len(),
            pruned,
            elapsed_ms,
            "run complete"
        );

        RunSnapshot {
            run_id,
            timestamp: input.timestamp,
            topics,
            departed,
            warnings,
            persistence,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistory;
    use crate::model::{LifecycleState, RawItem};
    use crate::rules::RuleSet;
    use chrono::{TimeZone, Utc};

    fn engine(rules: &str) -> Engine {
        let set = RuleSet::from_lines(rules);
        Engine::new(EngineConfig::default(), HotReloadRules::fixed(set))
    }

    fn input(run_id: u64, rows: &[(&str, &str, &str, u32)]) -> RunInput {
        let ts = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
        let mut input = RunInput::new(run_id, ts);
        for (src, id, title, rank) in rows {
            input
                .per_source
                .entry(src.to_string())
                .or_default()
                .push(RawItem::new(*src, *id, *title, *rank, ts));
        }
        input
    }

    #[tokio::test]
    async fn merged_topic_outranks_single_source() {
        let e = engine("politics | 10 | event");
        let store = MemoryHistory::default();
        let snap = e
            .run(
                input(1, &[("A", "t1", "Event X", 1), ("A", "t2", "Event Y", 2), ("B", "t3", "event x!!", 1)]),
                &store,
            )
            .await;
        assert_eq!(snap.status, RunStatus::Complete);
        assert_eq!(snap.topics.len(), 2);
        assert_eq!(snap.topics[0].score, 11.0);
        assert_eq!(snap.topics[0].source_count(), 2);
        assert_eq!(snap.topics[1].canonical_title, "Event Y");
        assert_eq!(snap.topics[1].score, 10.0);
        assert!(snap.topics.iter().all(|t| t.lifecycle_state == LifecycleState::New));
        assert_eq!(snap.persistence.written, 2);
    }

    #[tokio::test]
    async fn empty_input_is_not_an_error() {
        let e = engine("");
        let store = MemoryHistory::default();
        let snap = e.run(input(1, &[]), &store).await;
        assert!(snap.topics.is_empty());
        assert_eq!(snap.status, RunStatus::Complete);
    }

    #[tokio::test]
    async fn second_run_tracks_movement_and_departures() {
        let e = engine("hot | 5 | hot");
        let store = MemoryHistory::default();
        e.run(
            input(1, &[("A", "1", "alpha", 1), ("A", "2", "beta", 2), ("A", "3", "gamma", 3)]),
            &store,
        )
        .await;

        let snap = e
            .run(input(2, &[("A", "3", "gamma hot", 1), ("A", "1", "alpha", 2)]), &store)
            .await;
        // "gamma hot" has a different key than "gamma", so it is new
        assert_eq!(snap.topics[0].canonical_title, "gamma hot");
        assert_eq!(snap.topics[0].lifecycle_state, LifecycleState::New);
        let alpha = snap.topics.iter().find(|t| t.canonical_title == "alpha").unwrap();
        assert_eq!(alpha.lifecycle_state, LifecycleState::Persistent);
        assert_eq!(alpha.rank_delta, Some(-1));
        assert_eq!(alpha.first_seen_run, 1);
        let gone: Vec<&str> = snap.departed.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(gone, vec!["beta", "gamma"]);
    }
}
