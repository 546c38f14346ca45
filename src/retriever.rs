//! Hybrid retrieval: semantic (cosine) and lexical (Jaccard) signals merged
//! into one combined ranking.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::{ScopeFilter, SimilarityIndex};
use crate::normalize::{jaccard, token_set};
use crate::store::{ChunkRecord, ChunkStore};

/// Retrieval tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct RetrieverConfig {
    /// Weight of the semantic score; the lexical score gets the remainder.
    pub semantic_weight: f32,
    /// Minimum combined score. This is a strict filter: results below it
    /// are dropped even when fewer than `top_k` remain. `top_k` is a cap,
    /// never a fill guarantee, which keeps retrieval monotone in `top_k`.
    pub min_score: f32,
    /// Dense candidates pulled per requested result before blending.
    pub candidate_factor: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            semantic_weight: 0.85,
            min_score: 0.25,
            candidate_factor: 4,
        }
    }
}

/// Per-candidate scores, all in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// Scored chunk.
    pub chunk_id: String,
    /// Cosine similarity mapped onto [0, 1].
    pub semantic_score: f32,
    /// Token-set Jaccard overlap.
    pub lexical_score: f32,
    /// Weighted blend of the two.
    pub combined_score: f32,
}

/// A retrieval hit joined with its stored chunk row.
#[derive(Debug, Clone)]
pub struct RankedChunk {
    /// The stored chunk (text, tags, embedding state).
    pub record: ChunkRecord,
    /// The scores that ranked it.
    pub scores: RetrievalResult,
}

/// Hybrid retriever over a similarity index and a chunk store.
#[derive(Debug, Clone)]
pub struct HybridRetriever {
    config: RetrieverConfig,
}

impl HybridRetriever {
    /// Builds a retriever with the given weights and threshold.
    pub fn new(config: RetrieverConfig) -> Self {
        Self { config }
    }

    /// Returns the underlying config reference.
    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    /// Ranks indexed chunks against the query, returning at most `top_k`
    /// results at or above the configured threshold, best first.
    pub fn retrieve(
        &self,
        index: &SimilarityIndex,
        store: &dyn ChunkStore,
        query_text: &str,
        query_vector: &[f32],
        top_k: usize,
        filter: &ScopeFilter,
    ) -> Result<Vec<RankedChunk>> {
        if top_k == 0 || index.is_empty() {
            return Ok(Vec::new());
        }
        let pool = top_k.saturating_mul(self.config.candidate_factor.max(1)).max(top_k);
        let hits = index.search(query_vector, pool, filter);
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = hits.iter().map(|hit| hit.chunk_id.clone()).collect();
        let records = store.get_many(&ids)?;
        let query_tokens = token_set(query_text);

        let w_sem = self.config.semantic_weight.clamp(0.0, 1.0);
        let mut ranked: Vec<RankedChunk> = Vec::with_capacity(records.len());
        for record in records {
            let Some(hit) = hits.iter().find(|hit| hit.chunk_id == record.chunk.id) else {
                continue;
            };
            // Map cosine from [-1, 1] onto [0, 1] so the blend stays bounded
            // for any vector pair.
            let semantic = ((hit.cosine + 1.0) / 2.0).clamp(0.0, 1.0);
            let lexical = jaccard(&query_tokens, &token_set(&record.chunk.text));
            let combined = w_sem * semantic + (1.0 - w_sem) * lexical;
            if combined < self.config.min_score {
                continue;
            }
            let chunk_id = record.chunk.id.clone();
            ranked.push(RankedChunk {
                record,
                scores: RetrievalResult {
                    chunk_id,
                    semantic_score: semantic,
                    lexical_score: lexical,
                    combined_score: combined,
                },
            });
        }

        ranked.sort_by(|a, b| {
            b.scores
                .combined_score
                .partial_cmp(&a.scores.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.scores.chunk_id.cmp(&b.scores.chunk_id))
        });
        ranked.truncate(top_k);
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddedVector, EmbedMode};
    use crate::index::IndexEntry;
    use crate::segmenter::Chunk;
    use crate::store::MemoryChunkStore;
    use std::collections::BTreeMap;

    fn seed(store: &MemoryChunkStore, index: &mut SimilarityIndex, id: &str, text: &str, vector: Vec<f32>) {
        let record = ChunkRecord {
            chunk: Chunk {
                id: id.to_string(),
                doc_id: "doc".to_string(),
                position: 0,
                text: text.to_string(),
                token_count: text.split_whitespace().count(),
                article_no: None,
                section_title: None,
                extra: BTreeMap::new(),
            },
            jurisdiction: None,
            doc_type: None,
            checksum: 0,
            embedding: Some(EmbeddedVector {
                vector: vector.clone(),
                mode: EmbedMode::Fallback,
                model_id: "hash-v1".to_string(),
            }),
            processed: true,
        };
        store.upsert_chunks(vec![record]).unwrap();
        index.insert(
            IndexEntry {
                chunk_id: id.to_string(),
                source_id: "doc".to_string(),
                jurisdiction: None,
                doc_type: None,
                vector,
            },
            "hash-v1",
        );
    }

    fn fixture() -> (MemoryChunkStore, SimilarityIndex, HybridRetriever) {
        let store = MemoryChunkStore::new();
        let mut index = SimilarityIndex::new();
        seed(&store, &mut index, "a", "notice period for lease termination", vec![1.0, 0.0]);
        seed(&store, &mut index, "b", "penalties for late registration", vec![0.6, 0.8]);
        seed(&store, &mut index, "c", "unrelated maritime salvage rules", vec![0.0, 1.0]);
        let retriever = HybridRetriever::new(RetrieverConfig {
            min_score: 0.0,
            ..RetrieverConfig::default()
        });
        (store, index, retriever)
    }

    #[test]
    fn combined_scores_are_bounded() {
        let (store, index, retriever) = fixture();
        let results = retriever
            .retrieve(&index, &store, "lease termination notice", &[1.0, 0.0], 3, &ScopeFilter::default())
            .unwrap();
        assert!(!results.is_empty());
        for ranked in &results {
            let s = &ranked.scores;
            assert!((0.0..=1.0).contains(&s.semantic_score));
            assert!((0.0..=1.0).contains(&s.lexical_score));
            assert!((0.0..=1.0).contains(&s.combined_score));
        }
    }

    #[test]
    fn lexical_overlap_boosts_matching_chunk() {
        let (store, index, retriever) = fixture();
        let results = retriever
            .retrieve(&index, &store, "lease termination notice", &[1.0, 0.0], 3, &ScopeFilter::default())
            .unwrap();
        assert_eq!(results[0].scores.chunk_id, "a");
        assert!(results[0].scores.lexical_score > 0.0);
    }

    #[test]
    fn threshold_strictly_filters() {
        let (store, index, _) = fixture();
        let strict = HybridRetriever::new(RetrieverConfig {
            min_score: 0.99,
            ..RetrieverConfig::default()
        });
        let results = strict
            .retrieve(&index, &store, "anything", &[1.0, 0.0], 3, &ScopeFilter::default())
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn top_k_is_monotone() {
        let (store, index, retriever) = fixture();
        let small = retriever
            .retrieve(&index, &store, "lease termination", &[1.0, 0.0], 1, &ScopeFilter::default())
            .unwrap();
        let large = retriever
            .retrieve(&index, &store, "lease termination", &[1.0, 0.0], 3, &ScopeFilter::default())
            .unwrap();
        assert!(large.len() >= small.len());
        for kept in &small {
            assert!(large
                .iter()
                .any(|r| r.scores.chunk_id == kept.scores.chunk_id));
        }
    }

    #[test]
    fn empty_index_returns_nothing() {
        let store = MemoryChunkStore::new();
        let index = SimilarityIndex::new();
        let retriever = HybridRetriever::new(RetrieverConfig::default());
        let results = retriever
            .retrieve(&index, &store, "query", &[1.0], 5, &ScopeFilter::default())
            .unwrap();
        assert!(results.is_empty());
    }
}
