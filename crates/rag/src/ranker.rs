use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use ragcache_index::SearchHit;

/// `doc_id` reported when no chunk survives filtering.
pub const NO_DOCUMENT: &str = "none";

const WILDCARD: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SectionFilter {
    #[default]
    All,
    Only(String),
}

impl SectionFilter {
    /// `"all"` (any case) and blank input are the wildcard.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(WILDCARD) {
            SectionFilter::All
        } else {
            SectionFilter::Only(trimmed.to_string())
        }
    }

    pub fn matches(&self, section: &str) -> bool {
        match self {
            SectionFilter::All => true,
            SectionFilter::Only(wanted) => wanted == section,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SectionFilter::All => WILDCARD,
            SectionFilter::Only(section) => section,
        }
    }
}

impl fmt::Display for SectionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub doc_id: String,
    pub chunks: Vec<String>,
    pub score: f32,
}

impl RankedResult {
    pub fn none() -> Self {
        Self {
            doc_id: NO_DOCUMENT.to_string(),
            chunks: Vec::new(),
            score: 0.0,
        }
    }

    pub fn is_none(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Picks the document whose matching chunks have the largest summed score.
///
/// Chunks outside `filter` are ignored. Equal sums go to the document seen
/// first in `hits`, and the winner's chunks keep their hit order.
pub fn rank(hits: &[SearchHit], filter: &SectionFilter) -> RankedResult {
    let mut by_doc: IndexMap<&str, (f32, Vec<&str>)> = IndexMap::new();
    for hit in hits {
        let metadata = &hit.document.metadata;
        if !filter.matches(&metadata.section) {
            continue;
        }
        let entry = by_doc
            .entry(metadata.doc_id.as_str())
            .or_insert_with(|| (0.0, Vec::new()));
        entry.0 += hit.score;
        entry.1.push(hit.document.text.as_str());
    }

    let mut best: Option<(&str, f32, &Vec<&str>)> = None;
    for (doc_id, (score, chunks)) in &by_doc {
        match best {
            Some((_, top, _)) if *score <= top => {}
            _ => best = Some((*doc_id, *score, chunks)),
        }
    }

    match best {
        Some((doc_id, score, chunks)) => RankedResult {
            doc_id: doc_id.to_string(),
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            score,
        },
        None => RankedResult::none(),
    }
}
