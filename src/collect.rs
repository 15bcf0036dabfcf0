// src/collect.rs
//! Source Snapshot Collector: fan-in of one item list per source per run.
//!
//! Providers are fetched concurrently. A failing provider contributes nothing and
//! becomes a `SourceGap` warning; the run always proceeds with whatever arrived.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Deserialize;

use crate::model::{RawItem, RunId, RunInput, RunWarning};

#[async_trait::async_trait]
pub trait SourceProvider: Send + Sync {
    /// Current hot list for this source, best first.
    async fn fetch_snapshot(&self) -> Result<Vec<RawItem>>;
    fn source_id(&self) -> &str;
}

/// Input gathered for one run plus the gaps noticed while gathering it.
#[derive(Debug, Clone)]
pub struct Collected {
    pub input: RunInput,
    pub warnings: Vec<RunWarning>,
}

pub async fn collect(
    providers: &[Box<dyn SourceProvider>],
    run_id: RunId,
    timestamp: DateTime<Utc>,
) -> Collected {
    let results = join_all(providers.iter().map(|p| p.fetch_snapshot())).await;

    let mut input = RunInput::new(run_id, timestamp);
    let mut warnings = Vec::new();
    for (p, res) in providers.iter().zip(results) {
        let source_id = p.source_id().to_string();
        match res {
            Ok(items) => {
                tracing::debug!(target: "collect", source = %source_id, items = items.len(), "snapshot received");
                input.per_source.insert(source_id, items);
            }
            Err(e) => {
                tracing::warn!(target: "collect", source = %source_id, error = ?e, "provider error");
                warnings.push(RunWarning::SourceGap {
                    source_id,
                    reason: format!("fetch failed: {e:#}"),
                });
            }
        }
    }
    Collected { input, warnings }
}

/// Expected sources that delivered nothing. Sources already reported in `known` are skipped.
pub fn source_gaps(input: &RunInput, expected: &[String], known: &[RunWarning]) -> Vec<RunWarning> {
    let reported: BTreeSet<&str> = known
        .iter()
        .filter_map(|w| match w {
            RunWarning::SourceGap { source_id, .. } => Some(source_id.as_str()),
            _ => None,
        })
        .collect();

    expected
        .iter()
        .filter(|s| !reported.contains(s.as_str()))
        .filter_map(|s| {
            let reason = match input.per_source.get(s) {
                None => "missing from run input",
                Some(items) if items.is_empty() => "empty snapshot",
                Some(_) => return None,
            };
            Some(RunWarning::SourceGap {
                source_id: s.clone(),
                reason: reason.to_string(),
            })
        })
        .collect()
}

/// Spool file row written by an external fetcher.
#[derive(Debug, Deserialize)]
struct SpoolItem {
    #[serde(alias = "id")]
    external_id: String,
    title: String,
    #[serde(default, alias = "rank")]
    rank_in_source: Option<u32>,
    #[serde(default)]
    observed_at: Option<DateTime<Utc>>,
}

/// Reads `<dir>/<source_id>.json`: a JSON array of `{id, title, rank?, observed_at?}`.
/// Missing ranks default to list position; missing timestamps to fetch time.
#[derive(Debug, Clone)]
pub struct SpoolDirProvider {
    dir: PathBuf,
    source_id: String,
}

impl SpoolDirProvider {
    pub fn new(dir: impl Into<PathBuf>, source_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            source_id: source_id.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.source_id))
    }

    /// One provider per `listed` source plus any `*.json` already present in `dir`.
    pub fn discover(dir: &Path, listed: &[String]) -> Vec<Box<dyn SourceProvider>> {
        let mut ids: BTreeSet<String> = listed.iter().cloned().collect();
        if let Ok(rd) = std::fs::read_dir(dir) {
            for de in rd.flatten() {
                let path = de.path();
                if path.extension().and_then(|s| s.to_str()) == Some("json") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        ids.insert(stem.to_string());
                    }
                }
            }
        }
        ids.into_iter()
            .map(|id| Box::new(Self::new(dir, id)) as Box<dyn SourceProvider>)
            .collect()
    }
}

#[async_trait::async_trait]
impl SourceProvider for SpoolDirProvider {
    async fn fetch_snapshot(&self) -> Result<Vec<RawItem>> {
        let path = self.path();
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let rows: Vec<SpoolItem> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display()))?;

        let now = Utc::now();
        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| RawItem {
                source_id: self.source_id.clone(),
                external_id: row.external_id,
                title: row.title,
                rank_in_source: row
                    .rank_in_source
                    .unwrap_or_else(|| u32::try_from(i + 1).unwrap_or(u32::MAX)),
                observed_at: row.observed_at.unwrap_or(now),
            })
            .collect())
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Fixed(&'static str, Vec<RawItem>);
    struct Broken(&'static str);

    #[async_trait::async_trait]
    impl SourceProvider for Fixed {
        async fn fetch_snapshot(&self) -> Result<Vec<RawItem>> {
            Ok(self.1.clone())
        }
        fn source_id(&self) -> &str {
            self.0
        }
    }

    #[async_trait::async_trait]
    impl SourceProvider for Broken {
        async fn fetch_snapshot(&self) -> Result<Vec<RawItem>> {
            anyhow::bail!("upstream 503")
        }
        fn source_id(&self) -> &str {
            self.0
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn failing_provider_becomes_gap() {
        let providers: Vec<Box<dyn SourceProvider>> = vec![
            Box::new(Fixed("a", vec![RawItem::new("a", "1", "Event", 1, ts())])),
            Box::new(Broken("b")),
        ];
        let got = collect(&providers, 4, ts()).await;
        assert_eq!(got.input.run_id, 4);
        assert_eq!(got.input.item_count(), 1);
        assert!(!got.input.per_source.contains_key("b"));
        assert!(matches!(
            got.warnings.as_slice(),
            [RunWarning::SourceGap { source_id, reason }] if source_id == "b" && reason.contains("503")
        ));
    }

    #[test]
    fn expected_sources_missing_or_empty_are_gaps() {
        let input = RunInput::new(1, ts())
            .with_source("a", vec![RawItem::new("a", "1", "x", 1, ts())])
            .with_source("b", Vec::new());
        let expected = vec!["a".to_string(), "b".into(), "c".into(), "d".into()];
        let known = vec![RunWarning::SourceGap {
            source_id: "d".into(),
            reason: "fetch failed".into(),
        }];
        let gaps = source_gaps(&input, &expected, &known);
        let ids: Vec<_> = gaps
            .iter()
            .map(|g| match g {
                RunWarning::SourceGap { source_id, .. } => source_id.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn spool_provider_reads_and_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("weibo.json"),
            r#"[{"id":"w1","title":"Event X"},{"id":"w2","title":"Event Y","rank":7,"observed_at":"2025-09-06T09:00:00Z"}]"#,
        )
        .unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let providers = SpoolDirProvider::discover(tmp.path(), &["zhihu".to_string()]);
        let ids: Vec<&str> = providers.iter().map(|p| p.source_id()).collect();
        assert_eq!(ids, vec!["weibo", "zhihu"]);

        let got = collect(&providers, 1, ts()).await;
        let weibo = &got.input.per_source["weibo"];
        assert_eq!(weibo[0].rank_in_source, 1);
        assert_eq!(weibo[1].rank_in_source, 7);
        assert_eq!(weibo[1].observed_at, ts());
        assert_eq!(weibo[0].source_id, "weibo");
        // zhihu has no spool file yet
        assert_eq!(got.warnings.len(), 1);
    }
}
