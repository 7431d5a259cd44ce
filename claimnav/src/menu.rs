//! Matching a requested target page against the claim's side menu labels.

use serde::Serialize;

const STOP_WORDS: [&str; 4] = ["and", "the", "for", "with"];

/// Trim, lowercase, underscores to spaces, collapse whitespace.
pub fn normalize_label(raw: &str) -> String {
    raw.to_lowercase()
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Label matching strategies, strictest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Contains,
    AllWords,
    SignificantWord,
}

impl MatchStrategy {
    pub const ORDER: [MatchStrategy; 4] = [
        MatchStrategy::Exact,
        MatchStrategy::Contains,
        MatchStrategy::AllWords,
        MatchStrategy::SignificantWord,
    ];

    fn matches(self, label: &str, desired: &str, words: &[&str], significant: &[&str]) -> bool {
        match self {
            MatchStrategy::Exact => label == desired,
            MatchStrategy::Contains => label.contains(desired),
            MatchStrategy::AllWords => !words.is_empty() && words.iter().all(|w| label.contains(w)),
            MatchStrategy::SignificantWord => significant.iter().any(|w| label.contains(w)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatch {
    /// Index into the label list that was searched.
    pub index: usize,
    pub strategy: MatchStrategy,
    /// Strategies tried, in order, up to and including the winning one.
    pub attempted: Vec<MatchStrategy>,
}

/// Finds the first label matching `desired`, relaxing the strategy only when
/// a stricter one matches nothing. Empty labels never match.
pub fn find_label_match<S: AsRef<str>>(labels: &[S], desired: &str) -> Option<LabelMatch> {
    let desired = normalize_label(desired);
    if desired.is_empty() {
        return None;
    }
    let normalized: Vec<String> = labels.iter().map(|l| normalize_label(l.as_ref())).collect();
    let words: Vec<&str> = desired.split(' ').filter(|w| !w.is_empty()).collect();
    let significant: Vec<&str> = words
        .iter()
        .copied()
        .filter(|w| w.len() > 3 && !STOP_WORDS.contains(w))
        .collect();

    let mut attempted = Vec::with_capacity(MatchStrategy::ORDER.len());
    for strategy in MatchStrategy::ORDER {
        attempted.push(strategy);
        let hit = normalized
            .iter()
            .position(|l| !l.is_empty() && strategy.matches(l, &desired, &words, &significant));
        if let Some(index) = hit {
            return Some(LabelMatch {
                index,
                strategy,
                attempted,
            });
        }
    }
    None
}
