//! Merge-candidate scoring: decides whether a freshly built case is really
//! a new sighting of one we already track.

use kuntavahti_common::Category;

use crate::records::CaseRow;
use crate::{Result, Store};

/// A candidate must score above this to absorb the incoming document.
pub const MERGE_THRESHOLD: f64 = 0.8;

/// What the incoming document contributed, used to score existing cases.
#[derive(Debug, Clone)]
pub struct MergeQuery {
    pub entities: Vec<String>,
    pub municipalities: Vec<String>,
    pub locations: Vec<String>,
    pub category: Category,
    pub headline: String,
}

#[derive(Debug)]
pub struct MergeCandidate {
    pub case: CaseRow,
    pub score: f64,
}

/// Score how well an existing case matches the incoming extraction.
///
/// An identical entity or permit number carries most of the weight (0.6);
/// overlapping location adds 0.2, a category match 0.1, and a close headline
/// (normalized Levenshtein ≥ 0.7) another 0.1. Without an entity match the
/// ceiling is 0.4, well under the merge threshold.
pub fn score_case_match(case: &CaseRow, query: &MergeQuery) -> f64 {
    let mut score = 0.0;

    let case_entities = case.entities();
    if overlaps(&case_entities, &query.entities) {
        score += 0.6;
    }
    if overlaps(&case.locations(), &query.locations) {
        score += 0.2;
    }
    if case.primary_category == query.category.as_str() {
        score += 0.1;
    }
    let title_sim = strsim::normalized_levenshtein(
        &case.headline.to_lowercase(),
        &query.headline.to_lowercase(),
    );
    if title_sim >= 0.7 {
        score += 0.1;
    }

    score
}

fn overlaps(a: &[String], b: &[String]) -> bool {
    a.iter().any(|x| {
        b.iter()
            .any(|y| x.trim().eq_ignore_ascii_case(y.trim()) && !x.trim().is_empty())
    })
}

impl Store {
    /// Existing cases that could absorb the incoming document, best match
    /// first. Only cases sharing a municipality are considered.
    pub async fn find_merge_candidates(&self, query: &MergeQuery) -> Result<Vec<MergeCandidate>> {
        let mut candidates: Vec<MergeCandidate> = self
            .all_cases()
            .await?
            .into_iter()
            .filter(|case| overlaps(&case.municipalities(), &query.municipalities))
            .map(|case| {
                let score = score_case_match(&case, query);
                MergeCandidate { case, score }
            })
            .filter(|c| c.score > 0.0)
            .collect();
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(candidates)
    }
}
