//! Duplicate candidate ranking.
//!
//! Ranking is a pure function over raw index hits, with no index or
//! network dependencies, so the policy can be tested in isolation.
//!
//! # Policy
//!
//! 1. Clamp every raw cosine score to `[0, 1]`.
//! 2. Keep hits whose clamped score is `>= threshold`.
//! 3. Keep the best hit per ticket id.
//! 4. Sort by score (desc), last_modified (desc), ticket id (asc, natural
//!    order so `OPS-9` sorts before `OPS-10`).
//! 5. Truncate to `top_k` and assign 1-based ranks.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::index::IndexHit;
use crate::models::DuplicateCandidate;

/// Thresholding and truncation parameters, decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankingParams {
    /// Minimum clamped cosine similarity.
    pub threshold: f32,
    /// Maximum candidates to return.
    pub top_k: usize,
}

impl Default for RankingParams {
    fn default() -> Self {
        Self {
            threshold: 0.80,
            top_k: 5,
        }
    }
}

/// The `k` best raw hits in policy order.
///
/// Indexes call this before returning, so a cut at `k` never drops a hit
/// that the tie-break would have ranked ahead of one that was kept.
pub fn nearest(mut hits: Vec<IndexHit>, k: usize) -> Vec<IndexHit> {
    hits.sort_by(compare_hits);
    hits.truncate(k);
    hits
}

/// Apply the threshold and tie-break policy to raw hits.
pub fn rank_candidates(hits: Vec<IndexHit>, params: &RankingParams) -> Vec<DuplicateCandidate> {
    let mut best: HashMap<String, IndexHit> = HashMap::new();
    for mut hit in hits {
        hit.score = clamp_score(hit.score);
        if hit.score < params.threshold {
            continue;
        }
        match best.get(&hit.ticket_id) {
            Some(existing) if compare_hits(existing, &hit) != Ordering::Greater => {}
            _ => {
                best.insert(hit.ticket_id.clone(), hit);
            }
        }
    }

    let mut kept: Vec<IndexHit> = best.into_values().collect();
    kept.sort_by(compare_hits);
    kept.truncate(params.top_k);

    kept.into_iter()
        .enumerate()
        .map(|(i, hit)| DuplicateCandidate {
            ticket_id: hit.ticket_id,
            score: hit.score,
            rank: i + 1,
            title: hit.title,
            last_modified: hit.last_modified,
        })
        .collect()
}

/// Clamp a raw cosine score to `[0, 1]`. NaN becomes `0`.
pub fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// `Less` means `a` ranks ahead of `b`. Scores compare after clamping.
fn compare_hits(a: &IndexHit, b: &IndexHit) -> Ordering {
    clamp_score(b.score)
        .total_cmp(&clamp_score(a.score))
        .then_with(|| b.last_modified.cmp(&a.last_modified))
        .then_with(|| compare_ticket_ids(&a.ticket_id, &b.ticket_id))
}

/// Order ticket ids by prefix, then numerically by the trailing number.
///
/// Ids without a `PREFIX-NUMBER` shape fall back to plain string order.
pub fn compare_ticket_ids(a: &str, b: &str) -> Ordering {
    match (split_ticket_id(a), split_ticket_id(b)) {
        (Some((pa, na)), Some((pb, nb))) => pa.cmp(pb).then(na.cmp(&nb)).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

fn split_ticket_id(id: &str) -> Option<(&str, u64)> {
    let (prefix, number) = id.rsplit_once('-')?;
    Some((prefix, number.parse().ok()?))
}
