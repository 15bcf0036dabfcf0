//! Scorer: rule weights plus a cross-source corroboration bonus.
//!
//! score = Σ weight(matching rules) + (distinct sources − 1) × corroboration_bonus
//!
//! Pure function of (topic, rule set); no clock, no randomness.

use std::collections::BTreeSet;

use crate::model::Topic;
use crate::rules::{MatchTarget, RuleSet};

/// Bonus for topics surfaced independently by several sources.
pub fn corroboration_score(source_count: usize, bonus: f64) -> f64 {
    source_count.saturating_sub(1) as f64 * bonus
}

pub struct Scorer<'a> {
    rules: &'a RuleSet,
    corroboration_bonus: f64,
    match_member_titles: bool,
}

impl<'a> Scorer<'a> {
    pub fn new(rules: &'a RuleSet, corroboration_bonus: f64, match_member_titles: bool) -> Self {
        Self {
            rules,
            corroboration_bonus,
            match_member_titles,
        }
    }

    /// Returns `(score, matched rule labels)` for one topic.
    pub fn score(&self, topic: &Topic) -> (f64, BTreeSet<String>) {
        let mut targets = vec![MatchTarget::new(&topic.canonical_title)];
        if self.match_member_titles {
            targets.extend(topic.member_items.iter().map(|it| MatchTarget::new(&it.title)));
        }
        let sources = topic.sources();

        let mut score = corroboration_score(sources.len(), self.corroboration_bonus);
        let mut matched = BTreeSet::new();
        for rule in &self.rules.rules {
            if !rule.applies_to(sources.iter().copied()) {
                continue;
            }
            if rule.matches(&targets) {
                score += rule.weight;
                matched.insert(rule.label.clone());
            }
        }
        (score, matched)
    }

    /// Score every topic in place.
    pub fn apply(&self, topics: &mut [Topic]) {
        for t in topics.iter_mut() {
            let (score, matched) = self.score(t);
            t.score = score;
            t.matched_rules = matched;
        }
    }
}

/// Drop topics below `min_score` (if set). Returns the number removed.
pub fn retain_min_score(topics: &mut Vec<Topic>, min_score: Option<f64>) -> usize {
    let Some(min) = min_score else {
        return 0;
    };
    let before = topics.len();
    topics.retain(|t| t.score >= min);
    let dropped = before - topics.len();
    if dropped > 0 {
        tracing::debug!(target: "scoring", dropped, min_score = min, "topics below minimum score dropped");
    }
    dropped
}
