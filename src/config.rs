// src/config.rs
//! Engine configuration (`config/engine.toml`).
//!
//! Every key has a default, so a missing file is fine. A file that exists but
//! cannot be parsed or holds invalid values is a startup error.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

// --- env defaults & names ---
pub const DEFAULT_CONFIG_PATH: &str = "config/engine.toml";
pub const DEFAULT_RULES_PATH: &str = "config/rules.toml";
pub const DEFAULT_HISTORY_DIR: &str = "state/history";
pub const DEFAULT_SPOOL_DIR: &str = "state/spool";

pub const ENV_CONFIG_PATH: &str = "TREND_CONFIG_PATH";
pub const ENV_RULES_PATH: &str = "TREND_RULES_PATH";
pub const ENV_HISTORY_DIR: &str = "TREND_HISTORY_DIR";
pub const ENV_SPOOL_DIR: &str = "TREND_SPOOL_DIR";
pub const ENV_MAX_TOPICS: &str = "TREND_MAX_TOPICS";
pub const ENV_MIN_SCORE: &str = "TREND_MIN_SCORE";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub sources: SourcesSection,
    /// Synonym folding for dedup keys: token or phrase -> canonical form.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_corroboration_bonus")]
    pub corroboration_bonus: f64,
    #[serde(default)]
    pub min_score: Option<f64>,
    /// 0 disables truncation.
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,
    #[serde(default = "default_rank_delta_threshold")]
    pub rank_delta_threshold: u32,
    #[serde(default = "default_retention_runs")]
    pub retention_runs: u64,
    /// Topics with no entry in this many runs are pruned from history.
    #[serde(default = "default_history_horizon_runs")]
    pub history_horizon_runs: u64,
    #[serde(default)]
    pub match_member_titles: bool,
    #[serde(default = "default_ambiguity_similarity")]
    pub ambiguity_similarity: f64,
}

fn default_corroboration_bonus() -> f64 {
    1.0
}
fn default_max_topics() -> usize {
    50
}
fn default_rank_delta_threshold() -> u32 {
    2
}
fn default_retention_runs() -> u64 {
    3
}
fn default_history_horizon_runs() -> u64 {
    64
}
fn default_ambiguity_similarity() -> f64 {
    0.5
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            corroboration_bonus: default_corroboration_bonus(),
            min_score: None,
            max_topics: default_max_topics(),
            rank_delta_threshold: default_rank_delta_threshold(),
            retention_runs: default_retention_runs(),
            history_horizon_runs: default_history_horizon_runs(),
            match_member_titles: false,
            ambiguity_similarity: default_ambiguity_similarity(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SourcesSection {
    /// Tie-break order when choosing a canonical title; unlisted sources come last.
    #[serde(default)]
    pub priority: Vec<String>,
    /// Sources whose absence from a run is reported as a gap.
    #[serde(default)]
    pub expected: Vec<String>,
}

impl EngineSection {
    pub fn topic_limit(&self) -> Option<usize> {
        (self.max_topics > 0).then_some(self.max_topics)
    }
}

impl SourcesSection {
    /// Position of `source_id` in the priority list (unlisted = after all listed).
    pub fn priority_of(&self, source_id: &str) -> usize {
        self.priority
            .iter()
            .position(|s| s == source_id)
            .unwrap_or(self.priority.len())
    }
}

impl EngineConfig {
    /// Load using `$TREND_CONFIG_PATH` (or the default path), then apply env overrides.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut cfg = if path.exists() {
            Self::load_from(&path)?
        } else {
            tracing::info!(target: "config", path = %path.display(), "no engine config, using defaults");
            Self::default()
        };

        if let Some(v) = parse_env::<usize>(ENV_MAX_TOPICS)? {
            cfg.engine.max_topics = v;
        }
        if let Some(v) = parse_env::<f64>(ENV_MIN_SCORE)? {
            cfg.engine.min_score = Some(v);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(s).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.engine;
        if !(e.corroboration_bonus.is_finite() && e.corroboration_bonus > 0.0) {
            return Err(ConfigError::Invalid {
                key: "engine.corroboration_bonus",
                message: format!("must be finite and > 0, got {}", e.corroboration_bonus),
            });
        }
        if let Some(m) = e.min_score {
            if !m.is_finite() {
                return Err(ConfigError::Invalid {
                    key: "engine.min_score",
                    message: "must be finite".into(),
                });
            }
        }
        if e.rank_delta_threshold == 0 {
            return Err(ConfigError::Invalid {
                key: "engine.rank_delta_threshold",
                message: "must be >= 1".into(),
            });
        }
        if e.history_horizon_runs == 0 || e.history_horizon_runs < e.retention_runs {
            return Err(ConfigError::Invalid {
                key: "engine.history_horizon_runs",
                message: format!(
                    "must be >= 1 and >= retention_runs ({}), got {}",
                    e.retention_runs, e.history_horizon_runs
                ),
            });
        }
        if !(0.0..=1.0).contains(&e.ambiguity_similarity) {
            return Err(ConfigError::Invalid {
                key: "engine.ambiguity_similarity",
                message: "must be within [0, 1]".into(),
            });
        }
        Ok(())
    }
}

/// Rules path from `$TREND_RULES_PATH` or the default.
pub fn rules_path() -> PathBuf {
    env_path(ENV_RULES_PATH, DEFAULT_RULES_PATH)
}

pub fn history_dir() -> PathBuf {
    env_path(ENV_HISTORY_DIR, DEFAULT_HISTORY_DIR)
}

pub fn spool_dir() -> PathBuf {
    env_path(ENV_SPOOL_DIR, DEFAULT_SPOOL_DIR)
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: var,
                message: format!("cannot parse `{raw}`"),
            }),
        _ => Ok(None),
    }
}
