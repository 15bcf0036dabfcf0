// src/normalize.rs
//! Title normalization shared by dedup and rule matching.
//!
//! - `display_title`: entity-decoded, tag-stripped, whitespace-collapsed title for output.
//! - `match_text`: lowercase, punctuation folded to single spaces (rule matching).
//! - `DedupKeyer`: token sequence with alias folding, concatenated into the dedup key.
//! - `topic_id`: stable short hash of a dedup key.

use once_cell::sync::OnceCell;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Clean a raw title for display: decode entities, strip tags, collapse whitespace.
pub fn display_title(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[a-z][^<>]*>").expect("tag regex"));
    out = re_tags.replace_all(&out, "").to_string();

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("ws regex"));
    re_ws.replace_all(&out, " ").trim().to_string()
}

/// Split into lowercase alphanumeric tokens. Any other char is a separator.
pub fn tokens(s: &str) -> Vec<String> {
    let decoded = display_title(s);
    let mut out = Vec::new();
    let mut cur = String::new();
    for ch in decoded.chars() {
        if ch.is_alphanumeric() {
            cur.extend(ch.to_lowercase());
        } else if !cur.is_empty() {
            out.push(std::mem::take(&mut cur));
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// Lowercase text with punctuation folded to single spaces, used for term matching.
pub fn match_text(s: &str) -> String {
    tokens(s).join(" ")
}

/// Stable identifier derived from a dedup key (first 8 bytes of SHA-256, hex).
pub fn topic_id(dedup_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dedup_key.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Builds dedup keys with an operator-supplied alias table.
///
/// Alias keys may be phrases ("federal reserve"); they are tokenized the same way as
/// titles and matched longest-first on token boundaries.
#[derive(Debug, Clone, Default)]
pub struct DedupKeyer {
    // alias phrase tokens -> replacement tokens, longest phrase first
    aliases: Vec<(Vec<String>, Vec<String>)>,
}

impl DedupKeyer {
    pub fn new(aliases: &BTreeMap<String, String>) -> Self {
        let mut compiled: Vec<(Vec<String>, Vec<String>)> = aliases
            .iter()
            .map(|(from, to)| (tokens(from), tokens(to)))
            .filter(|(from, _)| !from.is_empty())
            .collect();
        // BTreeMap order keeps this deterministic for equal lengths.
        compiled.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { aliases: compiled }
    }

    /// Token sequence after alias folding.
    pub fn folded_tokens(&self, title: &str) -> Vec<String> {
        let toks = tokens(title);
        if self.aliases.is_empty() {
            return toks;
        }
        let mut out = Vec::with_capacity(toks.len());
        let mut i = 0;
        'outer: while i < toks.len() {
            for (from, to) in &self.aliases {
                if toks[i..].starts_with(from) {
                    out.extend(to.iter().cloned());
                    i += from.len();
                    continue 'outer;
                }
            }
            out.push(toks[i].clone());
            i += 1;
        }
        out
    }

    /// Dedup key: folded tokens concatenated with no separator, so spacing and
    /// punctuation differences vanish. Empty for titles without alphanumerics.
    pub fn key(&self, title: &str) -> String {
        self.folded_tokens(title).concat()
    }
}
