// src/lib.rs
// Public library surface for the service binary and integration tests.

pub mod api;
pub mod collect;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod history;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod rank;
pub mod rules;
pub mod scoring;
pub mod trend;

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::Router;

pub use crate::api::{router, ToolService};
pub use crate::config::EngineConfig;
pub use crate::engine::Engine;
pub use crate::error::{ConfigError, StoreError};
pub use crate::history::{HistoryStore, JsonFileHistory, MemoryHistory};
pub use crate::model::{LifecycleState, RawItem, RunInput, RunSnapshot, Topic};

/// Build the full service from env/config files. Installs the global metrics recorder,
/// so call it once per process.
pub async fn app() -> anyhow::Result<Router> {
    let cfg = EngineConfig::load_default()?;
    let rules = rules::HotReloadRules::open(&config::rules_path())?;

    let history_dir = config::history_dir();
    tokio::fs::create_dir_all(&history_dir).await?;
    let store: Arc<dyn HistoryStore> = Arc::new(JsonFileHistory::new(history_dir));

    let known: Vec<String> = cfg
        .sources
        .expected
        .iter()
        .chain(cfg.sources.priority.iter())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let providers = collect::SpoolDirProvider::discover(&config::spool_dir(), &known);
    tracing::info!(target: "api", providers = providers.len(), "source providers ready");

    let metrics = crate::metrics::Metrics::init()?;
    let service = Arc::new(ToolService::new(Engine::new(cfg, rules), store, providers));
    Ok(router(service, &metrics))
}
