//! Tool-service HTTP surface: `run_once`, `get_status`, latest snapshot.
//!
//! Runs are serialized by `run_lock`; the engine itself assumes one run at a time.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

use crate::collect::{collect, Collected, SourceProvider};
use crate::engine::Engine;
use crate::history::{latest_run_id, HistoryStore};
use crate::metrics::Metrics;
use crate::model::{RawItem, RunId, RunInput, RunSnapshot, RunStatus, RunSummary};

/// Number of topics listed in a run summary.
pub const SUMMARY_TOP_N: usize = 10;

/// Body of `POST /tools/run_once`. The service assigns the run id.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub per_source: BTreeMap<String, Vec<RawItem>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub total_runs: u64,
    pub complete_runs: u64,
    pub partial_runs: u64,
    pub failed_runs: u64,
    pub last_run_id: Option<RunId>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_summary: Option<RunSummary>,
    pub rules_loaded: usize,
    pub providers: Vec<String>,
}

pub struct ToolService {
    engine: Engine,
    store: Arc<dyn HistoryStore>,
    providers: Vec<Box<dyn SourceProvider>>,
    run_lock: Mutex<Option<RunId>>,
    status: RwLock<PipelineStatus>,
    latest: RwLock<Option<RunSnapshot>>,
}

impl ToolService {
    pub fn new(
        engine: Engine,
        store: Arc<dyn HistoryStore>,
        providers: Vec<Box<dyn SourceProvider>>,
    ) -> Self {
        let status = PipelineStatus {
            rules_loaded: engine.rules().current().len(),
            providers: providers.iter().map(|p| p.source_id().to_string()).collect(),
            ..Default::default()
        };
        Self {
            engine,
            store,
            providers,
            run_lock: Mutex::new(None),
            status: RwLock::new(status),
            latest: RwLock::new(None),
        }
    }

    /// Execute one run. With `request = None` the input is collected from providers.
    pub async fn run_once(&self, request: Option<RunRequest>) -> anyhow::Result<RunSummary> {
        let mut last = self.run_lock.lock().await;
        let started = Instant::now();

        let run_id = match self.next_run_id(*last).await {
            Ok(id) => id,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };

        let Collected { input, warnings } = match request {
            Some(req) => Collected {
                input: RunInput {
                    run_id,
                    timestamp: req.timestamp.unwrap_or_else(Utc::now),
                    per_source: req.per_source,
                },
                warnings: Vec::new(),
            },
            None => collect(&self.providers, run_id, Utc::now()).await,
        };

        let snapshot = self
            .engine
            .run_with_warnings(input, warnings, self.store.as_ref())
            .await;
        *last = Some(run_id);

        let summary = snapshot.summary(SUMMARY_TOP_N);
        {
            let mut st = self.status_mut();
            st.total_runs += 1;
            match snapshot.status {
                RunStatus::Complete => st.complete_runs += 1,
                RunStatus::PartiallyPersisted => st.partial_runs += 1,
            }
            st.last_run_id = Some(run_id);
            st.last_run_at = Some(snapshot.timestamp);
            st.last_duration_ms = Some(started.elapsed().as_millis() as u64);
            st.last_error = None;
            st.last_summary = Some(summary.clone());
            st.rules_loaded = self.engine.rules().current().len();
        }
        match self.latest.write() {
            Ok(mut g) => *g = Some(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Some(snapshot),
        }
        Ok(summary)
    }

    pub fn status(&self) -> PipelineStatus {
        match self.status.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn latest(&self) -> Option<RunSnapshot> {
        match self.latest.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn next_run_id(&self, last: Option<RunId>) -> anyhow::Result<RunId> {
        let base = match last {
            Some(id) => id,
            None => latest_run_id(self.store.as_ref()).await?.unwrap_or(0),
        };
        Ok(base + 1)
    }

    fn record_failure(&self, e: &anyhow::Error) {
        tracing::warn!(target: "api", error = ?e, "run failed before collection");
        metrics::counter!("trend_runs_total", "status" => "failed").increment(1);
        let mut st = self.status_mut();
        st.total_runs += 1;
        st.failed_runs += 1;
        st.last_error = Some(format!("{e:#}"));
    }

    fn status_mut(&self) -> std::sync::RwLockWriteGuard<'_, PipelineStatus> {
        match self.status.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    service: Arc<ToolService>,
}

pub fn router(service: Arc<ToolService>, metrics: &Metrics) -> Router {
    let state = AppState { service };
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/tools/run_once", post(run_once))
        .route("/tools/status", get(get_status))
        .route("/snapshot/latest", get(latest_snapshot))
        .with_state(state)
        .merge(metrics.router())
        .layer(CorsLayer::very_permissive())
}

async fn run_once(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RunSummary>, (StatusCode, String)> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        let req: RunRequest = serde_json::from_slice(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid run request: {e}")))?;
        Some(req)
    };
    state
        .service
        .run_once(request)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")))
}

async fn get_status(State(state): State<AppState>) -> Json<PipelineStatus> {
    Json(state.service.status())
}

async fn latest_snapshot(
    State(state): State<AppState>,
) -> Result<Json<RunSnapshot>, (StatusCode, &'static str)> {
    state
        .service
        .latest()
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "no run yet"))
}
