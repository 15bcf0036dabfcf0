//! Weighted match rules (`config/rules.toml`, `.json` or line-oriented `.txt`).
//!
//! TOML shape:
//! ```toml
//! [[rules]]
//! label = "politics"
//! required = ["election"]
//! excluded = ["rumor"]
//! weight = 10.0
//! sources = ["weibo"]     # optional scope
//! match = "substring"     # or "token"
//! ```
//!
//! Line shape (`#` comments, blank lines ignored; last two fields optional):
//! `label | weight | required, terms | excluded, terms | source, ids`
//!
//! Malformed entries are skipped with a warning and never fail the load. The file is
//! re-read when its mtime changes, checked once at the start of every run.

use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::SystemTime,
};

use crate::error::ConfigError;
use crate::normalize::{match_text, tokens};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Substring,
    Token,
}

/// Raw rule entry as written by operators.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    pub label: String,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    pub weight: f64,
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    #[serde(default, rename = "match")]
    pub mode: MatchMode,
}

/// One compiled term predicate over normalized text.
#[derive(Debug, Clone, PartialEq)]
enum Term {
    Substring(String),
    Tokens(Vec<String>),
}

impl Term {
    fn compile(raw: &str, mode: MatchMode) -> Option<Self> {
        let norm = match_text(raw);
        if norm.is_empty() {
            return None;
        }
        Some(match mode {
            MatchMode::Substring => Term::Substring(norm),
            MatchMode::Token => Term::Tokens(tokens(raw)),
        })
    }

    /// `text` must already be `match_text` output; `toks` its tokens.
    fn matches(&self, text: &str, toks: &[&str]) -> bool {
        match self {
            Term::Substring(p) => text.contains(p.as_str()),
            Term::Tokens(seq) => toks
                .windows(seq.len())
                .any(|w| w.iter().zip(seq).all(|(a, b)| *a == b)),
        }
    }
}

/// A title prepared once for matching against many rules.
#[derive(Debug, Clone)]
pub struct MatchTarget {
    text: String,
}

impl MatchTarget {
    pub fn new(title: &str) -> Self {
        Self {
            text: match_text(title),
        }
    }

    fn tokens(&self) -> Vec<&str> {
        self.text.split(' ').filter(|t| !t.is_empty()).collect()
    }
}

/// Compiled rule: all required terms, none of the excluded terms.
#[derive(Debug, Clone)]
pub struct Rule {
    pub label: String,
    pub weight: f64,
    pub source_scope: Option<BTreeSet<String>>,
    required: Vec<Term>,
    excluded: Vec<Term>,
}

impl Rule {
    pub fn compile(entry: RuleEntry) -> Result<Self, String> {
        let label = entry.label.trim().to_string();
        if label.is_empty() {
            return Err("empty label".into());
        }
        if !entry.weight.is_finite() {
            return Err(format!("rule `{label}`: weight must be finite"));
        }
        let required: Vec<Term> = entry
            .required
            .iter()
            .filter_map(|t| Term::compile(t, entry.mode))
            .collect();
        if required.is_empty() {
            return Err(format!("rule `{label}`: no usable required terms"));
        }
        let excluded = entry
            .excluded
            .iter()
            .filter_map(|t| Term::compile(t, entry.mode))
            .collect();
        let source_scope = entry.sources.map(|v| {
            v.into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<BTreeSet<_>>()
        });
        if source_scope.as_ref().is_some_and(BTreeSet::is_empty) {
            return Err(format!("rule `{label}`: empty source scope"));
        }
        Ok(Self {
            label,
            weight: entry.weight,
            source_scope,
            required,
            excluded,
        })
    }

    /// Scope check: unscoped rules apply everywhere.
    pub fn applies_to<'a, I>(&self, mut sources: I) -> bool
    where
        I: Iterator<Item = &'a str>,
    {
        match &self.source_scope {
            None => true,
            Some(scope) => sources.any(|s| scope.contains(s)),
        }
    }

    /// Every required term hits at least one target; no excluded term hits any.
    pub fn matches(&self, targets: &[MatchTarget]) -> bool {
        let prepared: Vec<(&str, Vec<&str>)> = targets
            .iter()
            .map(|t| (t.text.as_str(), t.tokens()))
            .collect();
        let hit = |term: &Term| prepared.iter().any(|(text, toks)| term.matches(text, toks));
        self.required.iter().all(hit) && !self.excluded.iter().any(hit)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    /// Entries dropped while loading (for metrics and logs).
    pub skipped: usize,
}

impl RuleSet {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Compile entries, skipping malformed ones and duplicate labels (first wins).
    pub fn from_entries(entries: Vec<Result<RuleEntry, String>>) -> Self {
        let mut seen = HashSet::new();
        let mut out = RuleSet::default();
        for (idx, entry) in entries.into_iter().enumerate() {
            let compiled = entry.and_then(Rule::compile).and_then(|r| {
                if seen.insert(r.label.clone()) {
                    Ok(r)
                } else {
                    Err(format!("duplicate label `{}`", r.label))
                }
            });
            match compiled {
                Ok(rule) => out.rules.push(rule),
                Err(reason) => {
                    tracing::warn!(target: "rules", entry = idx, %reason, "skipping malformed rule");
                    out.skipped += 1;
                }
            }
        }
        if out.skipped > 0 {
            crate::metrics::ensure_metrics_described();
            metrics::counter!("trend_rules_skipped_total").increment(out.skipped as u64);
        }
        out
    }

    pub fn from_toml_str(s: &str) -> Result<Self, String> {
        let root: toml::Table = toml::from_str(s).map_err(|e| e.to_string())?;
        let arr = match root.get("rules") {
            Some(toml::Value::Array(a)) => a.clone(),
            Some(_) => return Err("`rules` must be an array of tables".into()),
            None => Vec::new(),
        };
        let entries = arr
            .into_iter()
            .map(|v| RuleEntry::deserialize(v).map_err(|e| e.to_string()))
            .collect();
        Ok(Self::from_entries(entries))
    }

    pub fn from_json_str(s: &str) -> Result<Self, String> {
        let root: serde_json::Value = serde_json::from_str(s).map_err(|e| e.to_string())?;
        let arr = match &root {
            serde_json::Value::Array(a) => a.clone(),
            serde_json::Value::Object(o) => match o.get("rules") {
                Some(serde_json::Value::Array(a)) => a.clone(),
                _ => return Err("expected a `rules` array".into()),
            },
            _ => return Err("expected an array or an object with `rules`".into()),
        };
        let entries = arr
            .into_iter()
            .map(|v| serde_json::from_value::<RuleEntry>(v).map_err(|e| e.to_string()))
            .collect();
        Ok(Self::from_entries(entries))
    }

    pub fn from_lines(s: &str) -> Self {
        let entries = s
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(parse_line)
            .collect();
        Self::from_entries(entries)
    }
}

fn split_list(field: &str) -> Vec<String> {
    field
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_line(line: &str) -> Result<RuleEntry, String> {
    let fields: Vec<&str> = line.split('|').map(str::trim).collect();
    if fields.len() < 3 || fields.len() > 5 {
        return Err(format!("expected 3-5 `|` separated fields: `{line}`"));
    }
    let weight = fields[1]
        .parse::<f64>()
        .map_err(|_| format!("bad weight `{}`", fields[1]))?;
    let sources = fields.get(4).map(|f| split_list(f)).filter(|v| !v.is_empty());
    Ok(RuleEntry {
        label: fields[0].to_string(),
        required: split_list(fields[2]),
        excluded: fields.get(3).map(|f| split_list(f)).unwrap_or_default(),
        weight,
        sources,
        mode: MatchMode::Substring,
    })
}

/// Load by extension: `.json`, `.txt`, anything else is parsed as TOML.
pub fn load_rules_file(path: &Path) -> Result<RuleSet, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let parsed = match ext.as_str() {
        "json" => RuleSet::from_json_str(&content),
        "txt" => Ok(RuleSet::from_lines(&content)),
        _ => RuleSet::from_toml_str(&content),
    };
    parsed.map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

/// Rules file with mtime-based reload.
#[derive(Debug)]
pub struct HotReloadRules {
    path: PathBuf,
    inner: RwLock<State>,
}

#[derive(Debug)]
struct State {
    rules: RuleSet,
    last_modified: Option<SystemTime>,
}

impl HotReloadRules {
    /// Initial load must succeed; a missing or unparsable file is a startup error.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let rules = load_rules_file(path)?;
        let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
        tracing::info!(
            target: "rules",
            path = %path.display(),
            rules = rules.len(),
            skipped = rules.skipped,
            "rules loaded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(State {
                rules,
                last_modified: mtime,
            }),
        })
    }

    /// Fixed rule set with no backing file (tests, embedded use).
    pub fn fixed(rules: RuleSet) -> Self {
        Self {
            path: PathBuf::new(),
            inner: RwLock::new(State {
                rules,
                last_modified: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Latest rules, reloading if the file changed. A failed reload keeps the last good set.
    pub fn current(&self) -> RuleSet {
        if self.path.as_os_str().is_empty() {
            return self.read_state().rules.clone();
        }
        let mtime = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(target: "rules", path = %self.path.display(), error = %e, "rules file unavailable, keeping last good set");
                return self.read_state().rules.clone();
            }
        };
        if self.read_state().last_modified == Some(mtime) {
            return self.read_state().rules.clone();
        }

        let mut guard = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Double-check in case another caller reloaded meanwhile.
        if guard.last_modified != Some(mtime) {
            match load_rules_file(&self.path) {
                Ok(rules) => {
                    tracing::info!(target: "rules", rules = rules.len(), skipped = rules.skipped, "rules reloaded");
                    guard.rules = rules;
                    guard.last_modified = Some(mtime);
                }
                Err(e) => {
                    tracing::warn!(target: "rules", error = %e, "rules reload failed, keeping last good set");
                }
            }
        }
        guard.rules.clone()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Write, thread, time::Duration};

    fn entry(label: &str, req: &[&str], excl: &[&str], weight: f64) -> RuleEntry {
        RuleEntry {
            label: label.into(),
            required: req.iter().map(|s| s.to_string()).collect(),
            excluded: excl.iter().map(|s| s.to_string()).collect(),
            weight,
            sources: None,
            mode: MatchMode::Substring,
        }
    }

    fn targets(titles: &[&str]) -> Vec<MatchTarget> {
        titles.iter().map(|t| MatchTarget::new(t)).collect()
    }

    #[test]
    fn required_and_excluded_terms() {
        let r = Rule::compile(entry("fed", &["rate", "cut"], &["rumor"], 2.0)).unwrap();
        assert!(r.matches(&targets(&["Fed CUTS rates today"])));
        assert!(!r.matches(&targets(&["Fed holds rates"])));
        assert!(!r.matches(&targets(&["Rumor: Fed cuts rates"])));
    }

    #[test]
    fn case_and_whitespace_insensitive() {
        let r = Rule::compile(entry("ease", &["policy   easing"], &[], 1.0)).unwrap();
        assert!(r.matches(&targets(&["  POLICY\tEASING confirmed "])));
        assert!(r.matches(&targets(&["policy-easing ahead"])));
    }

    #[test]
    fn token_mode_needs_whole_tokens() {
        let mut e = entry("ai", &["ai"], &[], 1.0);
        e.mode = MatchMode::Token;
        let r = Rule::compile(e).unwrap();
        assert!(r.matches(&targets(&["New AI chip"])));
        assert!(!r.matches(&targets(&["Said the chairman"])));

        let sub = Rule::compile(entry("ai", &["ai"], &[], 1.0)).unwrap();
        assert!(sub.matches(&targets(&["Said the chairman"])));
    }

    #[test]
    fn terms_may_match_across_member_titles() {
        let r = Rule::compile(entry("combo", &["launch", "rocket"], &["test"], 1.0)).unwrap();
        assert!(r.matches(&targets(&["Launch delayed", "Rocket on pad"])));
        assert!(!r.matches(&targets(&["Launch delayed", "Rocket test fire"])));
    }

    #[test]
    fn scope_restricts_sources() {
        let mut e = entry("scoped", &["x"], &[], 1.0);
        e.sources = Some(vec!["weibo".into()]);
        let r = Rule::compile(e).unwrap();
        assert!(r.applies_to(["zhihu", "weibo"].into_iter()));
        assert!(!r.applies_to(["zhihu"].into_iter()));
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let set = RuleSet::from_toml_str(
            r#"
[[rules]]
label = "ok"
required = ["event"]
weight = 10

[[rules]]
label = "no_weight"
required = ["x"]

[[rules]]
label = "no_terms"
required = ["  ", "!!"]
weight = 1

[[rules]]
label = "ok"
required = ["dup"]
weight = 1
"#,
        )
        .unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.skipped, 3);
        assert_eq!(set.rules[0].label, "ok");
    }

    #[test]
    fn json_array_and_object_forms() {
        let a = RuleSet::from_json_str(r#"[{"label":"a","required":["x"],"weight":1}]"#).unwrap();
        let b = RuleSet::from_json_str(
            r#"{"rules":[{"label":"b","required":["y"],"weight":2,"sources":["s"]}, {"label":""}]}"#,
        )
        .unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(b.skipped, 1);
        assert!(b.rules[0].source_scope.is_some());
    }

    #[test]
    fn line_format_parses_and_skips() {
        let set = RuleSet::from_lines(
            "# politics\n\
             politics | 10 | event |  |\n\
             tech | 5 | ai, chip | rumor | weibo, zhihu\n\
             broken line\n\
             bad | ten | x\n",
        );
        assert_eq!(set.len(), 2);
        assert_eq!(set.skipped, 2);
        assert!(set.rules[0].source_scope.is_none());
        assert_eq!(set.rules[1].source_scope.as_ref().map(|s| s.len()), Some(2));
    }

    #[test]
    fn reloads_on_change_and_keeps_last_good() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        {
            let mut f = fs::File::create(&path).unwrap();
            write!(f, "[[rules]]\nlabel = \"a\"\nrequired = [\"x\"]\nweight = 1\n").unwrap();
            f.sync_all().unwrap();
        }
        let hot = HotReloadRules::open(&path).unwrap();
        assert_eq!(hot.current().len(), 1);

        // Ensure different mtime (coarse filesystem granularity).
        thread::sleep(Duration::from_millis(1100));
        {
            let mut f = fs::File::create(&path).unwrap();
            write!(
                f,
                "[[rules]]\nlabel = \"a\"\nrequired = [\"x\"]\nweight = 1\n\n[[rules]]\nlabel = \"b\"\nrequired = [\"y\"]\nweight = 2\n"
            )
            .unwrap();
            f.sync_all().unwrap();
        }
        assert_eq!(hot.current().len(), 2);

        thread::sleep(Duration::from_millis(1100));
        fs::write(&path, "[[rules\nbroken").unwrap();
        assert_eq!(hot.current().len(), 2);
    }

    #[test]
    fn failed_reload_retries_at_same_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        fs::write(&path, "[[rules]]\nlabel = \"a\"\nrequired = [\"x\"]\nweight = 1\n").unwrap();
        let hot = HotReloadRules::open(&path).unwrap();

        // Half-written file and its completed version share one mtime tick.
        let tick = SystemTime::now() + Duration::from_secs(60);
        let write_at_tick = |body: &str| {
            fs::write(&path, body).unwrap();
            let f = fs::File::options().write(true).open(&path).unwrap();
            f.set_modified(tick).unwrap();
        };

        write_at_tick("[[rules]\nlabel =");
        assert_eq!(hot.current().len(), 1);

        write_at_tick(
            "[[rules]]\nlabel = \"a\"\nrequired = [\"x\"]\nweight = 1\n\n[[rules]]\nlabel = \"b\"\nrequired = [\"y\"]\nweight = 2\n",
        );
        assert_eq!(hot.current().len(), 2);
    }

    #[test]
    fn open_fails_on_missing_file() {
        assert!(HotReloadRules::open(Path::new("/definitely/not/here/rules.toml")).is_err());
    }
}
