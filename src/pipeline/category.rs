//! Mapping classifier output onto the configured category set, and the
//! confidence heuristic.

use crate::config::CategoryMatching;
use crate::pipeline::types::round2;

/// Resolves a classifier's raw answer to one of the configured categories.
pub trait CategoryMatcher: Send + Sync {
    /// Return the matching category, or `None` when nothing matches.
    fn resolve(&self, raw: &str, categories: &[String]) -> Option<String>;
}

/// Accepts only an exact match after trimming whitespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactMatcher;

impl CategoryMatcher for ExactMatcher {
    fn resolve(&self, raw: &str, categories: &[String]) -> Option<String> {
        let raw = raw.trim();
        categories.iter().find(|c| c.as_str() == raw).cloned()
    }
}

/// Exact, then case-insensitive, then substring containment in either
/// direction. The first category in configured order wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuzzyMatcher;

impl CategoryMatcher for FuzzyMatcher {
    fn resolve(&self, raw: &str, categories: &[String]) -> Option<String> {
        if let Some(exact) = ExactMatcher.resolve(raw, categories) {
            return Some(exact);
        }

        let needle = raw.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }

        if let Some(found) = categories.iter().find(|c| c.to_lowercase() == needle) {
            return Some(found.clone());
        }

        categories
            .iter()
            .find(|c| {
                let label = c.to_lowercase();
                needle.contains(&label) || label.contains(&needle)
            })
            .cloned()
    }
}

pub fn matcher_for(matching: CategoryMatching) -> Box<dyn CategoryMatcher> {
    match matching {
        CategoryMatching::Exact => Box::new(ExactMatcher),
        CategoryMatching::Fuzzy => Box::new(FuzzyMatcher),
    }
}

/// Confidence for a classification.
///
/// The fallback category starts at 0.5, the high-confidence categories at
/// 0.9 and everything else at 0.7. A longer explanation adds up to 0.2.
/// The result is capped at 1.0 and rounded to two decimals.
pub fn confidence_score(
    category: &str,
    explanation: &str,
    fallback_category: &str,
    high_confidence: &[String],
) -> f64 {
    let base = if category == fallback_category {
        0.5
    } else if high_confidence.iter().any(|c| c == category) {
        0.9
    } else {
        0.7
    };

    let explanation_bonus = (explanation.chars().count() as f64 / 200.0).min(1.0) * 0.2;
    round2((base + explanation_bonus).min(1.0))
}
