//! Duplicate detection engine.
//!
//! Given draft text and a project scope, [`DuplicateDetector::detect`]
//! normalizes the text, embeds it, asks the [`SimilarityIndex`] for the
//! `candidate_k` nearest neighbours, and hands the hits to
//! [`rank_candidates`] for thresholding and tie-breaking.
//!
//! Detection is read-only with respect to the index. Time limits are the
//! caller's concern: the app wraps `detect` in a runtime timeout and maps
//! expiry to [`DetectionError::Timeout`].

use std::sync::Arc;

use crate::embedding::EmbeddingProvider;
use crate::error::DetectionError;
use crate::index::{ScopeFilter, SimilarityIndex};
use crate::models::DuplicateCandidate;
use crate::ranking::{rank_candidates, RankingParams};
use crate::text::normalize_text;

/// Detection tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    pub threshold: f32,
    pub top_k: usize,
    /// Neighbours fetched from the index before thresholding.
    pub candidate_k: usize,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            threshold: 0.80,
            top_k: 5,
            candidate_k: 20,
        }
    }
}

impl DetectionParams {
    fn ranking(&self) -> RankingParams {
        RankingParams {
            threshold: self.threshold,
            top_k: self.top_k,
        }
    }
}

pub struct DuplicateDetector {
    provider: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn SimilarityIndex>,
    params: DetectionParams,
}

impl DuplicateDetector {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn SimilarityIndex>,
        params: DetectionParams,
    ) -> Self {
        Self {
            provider,
            index,
            params,
        }
    }

    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    /// Ranked candidates for `text` within `scope`, best first.
    ///
    /// Text that normalizes to nothing yields an empty list without
    /// calling the provider.
    pub async fn detect(
        &self,
        text: &str,
        scope: &ScopeFilter,
    ) -> Result<Vec<DuplicateCandidate>, DetectionError> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return Ok(Vec::new());
        }

        let vector = self
            .provider
            .embed_one(&normalized)
            .await
            .map_err(|e| DetectionError::Unavailable(e.to_string()))?;

        let k = self.params.candidate_k.max(self.params.top_k);
        let hits = self
            .index
            .query(&vector, k, scope)
            .await
            .map_err(|e| DetectionError::Unavailable(format!("index query failed: {e}")))?;

        Ok(rank_candidates(hits, &self.params.ranking()))
    }
}
