// tests/pipeline_e2e.rs
use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use trend_radar::config::EngineConfig;
use trend_radar::model::{HistoryEntry, RunStatus, RunWarning};
use trend_radar::rules::{HotReloadRules, RuleSet};
use trend_radar::{Engine, HistoryStore, MemoryHistory, RawItem, RunInput, StoreError};

fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap()
}

fn engine_with(config: EngineConfig, rules: &str) -> Engine {
    Engine::new(config, HotReloadRules::fixed(RuleSet::from_lines(rules)))
}

fn engine(rules: &str) -> Engine {
    engine_with(EngineConfig::default(), rules)
}

fn items(src: &str, rows: &[(&str, &str)]) -> Vec<RawItem> {
    rows.iter()
        .enumerate()
        .map(|(i, (id, title))| RawItem::new(src, *id, *title, i as u32 + 1, ts()))
        .collect()
}

fn example_input(run_id: u64) -> RunInput {
    RunInput::new(run_id, ts())
        .with_source("A", items("A", &[("t1", "Event X"), ("t2", "Event Y")]))
        .with_source("B", items("B", &[("t3", "event x!!")]))
}

#[tokio::test]
async fn merged_event_scores_eleven_and_ranks_first() {
    let mut cfg = EngineConfig::default();
    cfg.engine.max_topics = 10;
    let e = engine_with(cfg, "politics | 10 | event");
    let store = MemoryHistory::default();

    let snap = e.run(example_input(1), &store).await;

    assert_eq!(snap.topics.len(), 2);
    let top = &snap.topics[0];
    assert_eq!(top.rank, 1);
    assert_eq!(top.score, 11.0);
    assert_eq!(top.member_items.len(), 2);
    // both members rank 1; source A was encountered first
    assert_eq!(top.canonical_title, "Event X");
    assert_eq!(top.matched_rules.iter().collect::<Vec<_>>(), vec!["politics"]);
    let second = &snap.topics[1];
    assert_eq!(second.canonical_title, "Event Y");
    assert_eq!(second.score, 10.0);
    assert_eq!(second.rank, 2);
}

#[tokio::test]
async fn repeated_runs_on_empty_history_are_byte_identical() {
    let rules = "politics | 10 | event\nx | 1.5 | x";
    let mut outputs = Vec::new();
    for _ in 0..3 {
        let store = MemoryHistory::default();
        let snap = engine(rules).run(example_input(1), &store).await;
        outputs.push(serde_json::to_string(&snap).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
}

#[tokio::test]
async fn duplicate_item_from_same_source_yields_single_member() {
    let input = RunInput::new(1, ts()).with_source(
        "A",
        vec![
            RawItem::new("A", "t1", "Event X", 1, ts()),
            RawItem::new("A", "t1", "Event X", 1, ts()),
        ],
    );
    let snap = engine("").run(input, &MemoryHistory::default()).await;
    assert_eq!(snap.topics.len(), 1);
    assert_eq!(snap.topics[0].member_items.len(), 1);
}

#[tokio::test]
async fn missing_source_degrades_coverage_only() {
    let mut cfg = EngineConfig::default();
    cfg.sources.expected = vec!["A".into(), "B".into()];
    let e = engine_with(cfg, "politics | 10 | event");
    let input = RunInput::new(1, ts()).with_source("A", items("A", &[("t1", "Event X")]));

    let snap = e.run(input, &MemoryHistory::default()).await;

    assert_eq!(snap.topics.len(), 1);
    assert_eq!(snap.status, RunStatus::Complete);
    assert!(snap
        .warnings
        .iter()
        .any(|w| matches!(w, RunWarning::SourceGap { source_id, .. } if source_id == "B")));
}

#[tokio::test]
async fn truncation_keeps_the_highest_ranked() {
    let mut cfg = EngineConfig::default();
    cfg.engine.max_topics = 3;
    let rules: String = (0..10)
        .map(|i| format!("r{i} | {} | k{i}\n", i + 1))
        .collect();
    let e = engine_with(cfg, &rules);
    // Input order is the reverse of score order.
    let rows: Vec<(String, String)> = (0..10).map(|i| (format!("id{i}"), format!("k{i}"))).collect();
    let input = RunInput::new(1, ts()).with_source(
        "A",
        rows.iter()
            .enumerate()
            .map(|(pos, (id, title))| RawItem::new("A", id.as_str(), title.as_str(), pos as u32 + 1, ts()))
            .collect(),
    );

    let store = MemoryHistory::default();
    let snap = e.run(input, &store).await;

    let titles: Vec<&str> = snap.topics.iter().map(|t| t.canonical_title.as_str()).collect();
    assert_eq!(titles, vec!["k9", "k8", "k7"]);
    // only retained topics are written to history
    assert_eq!(store.topic_ids().await.unwrap().len(), 3);
}

#[tokio::test]
async fn min_score_filter_drops_before_ranking() {
    let mut cfg = EngineConfig::default();
    cfg.engine.min_score = Some(10.5);
    let e = engine_with(cfg, "politics | 10 | event");
    let snap = e.run(example_input(1), &MemoryHistory::default()).await;
    assert_eq!(snap.topics.len(), 1);
    assert_eq!(snap.topics[0].score, 11.0);
}

/// Store whose writes fail for selected topics and whose reads can be switched off.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryHistory,
    fail_put: std::sync::Mutex<HashSet<String>>,
    fail_get: bool,
}

#[async_trait]
impl HistoryStore for FlakyStore {
    async fn get(&self, topic_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        if self.fail_get {
            return Err(StoreError::Unavailable("read timeout".into()));
        }
        self.inner.get(topic_id).await
    }

    async fn put(&self, topic_id: &str, entry: HistoryEntry) -> Result<(), StoreError> {
        if self.fail_put.lock().unwrap().contains(topic_id) {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        self.inner.put(topic_id, entry).await
    }

    async fn topic_ids(&self) -> Result<Vec<String>, StoreError> {
        self.inner.topic_ids().await
    }

    async fn prune(&self, before: u64) -> Result<usize, StoreError> {
        self.inner.prune(before).await
    }
}

#[tokio::test]
async fn failed_write_marks_run_partially_persisted() {
    let e = engine("politics | 10 | event");
    let probe = e.run(example_input(1), &MemoryHistory::default()).await;
    let failing_id = probe.topics[1].topic_id.clone();

    let store = FlakyStore::default();
    store.fail_put.lock().unwrap().insert(failing_id.clone());
    let snap = e.run(example_input(1), &store).await;

    assert_eq!(snap.status, RunStatus::PartiallyPersisted);
    assert_eq!(snap.topics.len(), 2);
    assert_eq!(snap.persistence.written, 1);
    assert_eq!(snap.persistence.failures.len(), 1);
    assert_eq!(snap.persistence.failures[0].topic_id, failing_id);
    assert_eq!(store.inner.get(&snap.topics[0].topic_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unreadable_history_treats_topics_as_new() {
    let store = FlakyStore {
        fail_get: true,
        ..Default::default()
    };
    let snap = engine("politics | 10 | event").run(example_input(3), &store).await;
    assert_eq!(snap.topics.len(), 2);
    assert!(snap
        .topics
        .iter()
        .all(|t| t.lifecycle_state == trend_radar::LifecycleState::New));
    let unavailable = snap
        .warnings
        .iter()
        .filter(|w| matches!(w, RunWarning::HistoryUnavailable { .. }))
        .count();
    assert_eq!(unavailable, 2);
}
