//! Per-call routing context

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::Serialize;

use super::rules::Urgency;

/// Words ignored when extracting keywords from free text
const STOPWORDS: &[&str] = &[
    "about", "after", "again", "also", "and", "are", "but", "can", "could", "for", "from", "have",
    "her", "his", "how", "into", "just", "need", "our", "please", "should", "that", "the", "their",
    "them", "then", "there", "this", "want", "was", "what", "when", "where", "which", "who", "will",
    "with", "would", "you", "your",
];

/// Caller-supplied hints merged into the routing context
#[derive(Debug, Clone, Default)]
pub struct CallHints {
    /// Free-form caller metadata
    pub metadata: BTreeMap<String, String>,

    /// Urgency (default: medium)
    pub urgency: Option<Urgency>,

    /// Explicit keywords
    pub keywords: Vec<String>,

    /// Free text (subject line, first utterance) to extract keywords from
    pub text: Option<String>,

    /// Local timestamp (default: now)
    pub timestamp: Option<NaiveDateTime>,
}

impl CallHints {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = Some(urgency);
        self
    }

    #[must_use]
    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn at(mut self, timestamp: NaiveDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Everything a routing decision is made from
///
/// Built once per call and discarded after the decision is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallContext {
    pub caller_id: String,
    pub metadata: BTreeMap<String, String>,
    /// Earlier routed contacts from this caller
    pub prior_interactions: u32,
    pub urgency: Urgency,
    pub keywords: Vec<String>,
    /// Local wall-clock time of the call
    pub timestamp: NaiveDateTime,
}

impl CallContext {
    /// Merge hints with defaults
    #[must_use]
    pub fn build(caller_id: &str, hints: CallHints, prior_interactions: u32) -> Self {
        let mut keywords = hints.keywords;
        if let Some(text) = hints.text.as_deref() {
            for kw in extract_keywords(text) {
                if !keywords.iter().any(|k| k.eq_ignore_ascii_case(&kw)) {
                    keywords.push(kw);
                }
            }
        }

        Self {
            caller_id: caller_id.trim().to_string(),
            metadata: hints.metadata,
            prior_interactions,
            urgency: hints.urgency.unwrap_or_default(),
            keywords,
            timestamp: hints
                .timestamp
                .unwrap_or_else(|| chrono::Local::now().naive_local()),
        }
    }
}

/// Pull candidate routing keywords out of free text
///
/// Lowercases, splits on anything that is not alphanumeric or `-`, and drops
/// short words, stopwords and duplicates. Order of first appearance is kept.
#[must_use]
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in text
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .map(|w| w.trim_matches('-').to_lowercase())
    {
        if word.chars().count() < 3 || STOPWORDS.contains(&word.as_str()) {
            continue;
        }
        if !out.contains(&word) {
            out.push(word);
        }
    }
    out
}
