//! Second-pass reranking of the retrieval shortlist.
//!
//! A pairwise query/candidate scorer refines the hybrid ranking. Small
//! candidate sets skip the pass entirely, and the whole pass is time-boxed:
//! on expiry the pre-rerank order is returned unchanged.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::normalize::token_set;
use crate::retriever::RankedChunk;

/// Pairwise query/candidate relevance scorer. Implementations must return
/// scores in [0, 1]; a model-backed cross-encoder plugs in here without the
/// orchestrator noticing.
pub trait PairwiseScorer: Send + Sync {
    /// Relevance of `candidate` to `query`.
    fn score(&self, query: &str, candidate: &str) -> f32;
}

/// Lexical default scorer: query-term coverage weighted by term length, so
/// rare long terms count more than short function words.
#[derive(Debug, Default, Clone)]
pub struct TermOverlapScorer;

impl PairwiseScorer for TermOverlapScorer {
    fn score(&self, query: &str, candidate: &str) -> f32 {
        let query_tokens = token_set(query);
        if query_tokens.is_empty() {
            return 0.0;
        }
        let candidate_tokens = token_set(candidate);
        let total_weight: f32 = query_tokens.iter().map(|tok| term_weight(tok)).sum();
        if total_weight <= 0.0 {
            return 0.0;
        }
        let hit_weight: f32 = query_tokens
            .iter()
            .filter(|tok| candidate_tokens.contains(*tok))
            .map(|tok| term_weight(tok))
            .sum();
        (hit_weight / total_weight).clamp(0.0, 1.0)
    }
}

fn term_weight(token: &str) -> f32 {
    // ln(1 + len): a crude rarity proxy that needs no corpus statistics.
    (1.0 + token.chars().count() as f32).ln()
}

/// Reranking knobs.
#[derive(Debug, Clone, Copy)]
pub struct RerankConfig {
    /// Candidate sets at or below this size keep their original order.
    pub skip_at_or_below: usize,
    /// Final list length after reranking.
    pub final_k: usize,
    /// Budget for the whole pass.
    pub timeout: Duration,
    /// Weight of the pairwise score; the retrieval combined score gets the
    /// remainder.
    pub pairwise_weight: f32,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            skip_at_or_below: 3,
            final_k: 5,
            timeout: Duration::from_millis(500),
            pairwise_weight: 0.6,
        }
    }
}

/// How a rerank pass concluded; the list inside is always usable.
#[derive(Debug)]
pub enum RerankOutcome {
    /// Pairwise scoring reordered (and possibly truncated) the list.
    Reranked(Vec<RankedChunk>),
    /// The candidate set was small enough to keep as-is.
    Skipped(Vec<RankedChunk>),
    /// The pass exceeded its budget; pre-rerank order kept.
    TimedOut(Vec<RankedChunk>),
}

impl RerankOutcome {
    /// The final candidate list, whichever path produced it.
    pub fn into_candidates(self) -> Vec<RankedChunk> {
        match self {
            RerankOutcome::Reranked(list)
            | RerankOutcome::Skipped(list)
            | RerankOutcome::TimedOut(list) => list,
        }
    }
}

/// Shortlist reranker. Process-wide, shared by reference.
#[derive(Clone)]
pub struct Reranker {
    scorer: Arc<dyn PairwiseScorer>,
    config: RerankConfig,
}

impl Reranker {
    /// Builds a reranker with the default lexical scorer.
    pub fn new(config: RerankConfig) -> Self {
        Self::with_scorer(config, Arc::new(TermOverlapScorer))
    }

    /// Builds a reranker around a custom pairwise scorer.
    pub fn with_scorer(config: RerankConfig, scorer: Arc<dyn PairwiseScorer>) -> Self {
        Self { scorer, config }
    }

    /// Returns the underlying config reference.
    pub fn config(&self) -> &RerankConfig {
        &self.config
    }

    /// Synchronous rerank core: blends pairwise and retrieval scores, sorts,
    /// truncates to `final_k`.
    pub fn rerank(&self, query: &str, mut candidates: Vec<RankedChunk>) -> Vec<RankedChunk> {
        let w_pair = self.config.pairwise_weight.clamp(0.0, 1.0);
        let mut scored: Vec<(f32, RankedChunk)> = candidates
            .drain(..)
            .map(|candidate| {
                let pair = self
                    .scorer
                    .score(query, &candidate.record.chunk.text)
                    .clamp(0.0, 1.0);
                let blended = w_pair * pair + (1.0 - w_pair) * candidate.scores.combined_score;
                (blended, candidate)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.config.final_k.max(1));
        scored.into_iter().map(|(_, candidate)| candidate).collect()
    }

    /// Time-boxed rerank. CPU work runs on the blocking pool; a budget
    /// overrun or a lost worker keeps the pre-rerank order.
    pub async fn rerank_timeboxed(&self, query: &str, candidates: Vec<RankedChunk>) -> RerankOutcome {
        if candidates.len() <= self.config.skip_at_or_below {
            return RerankOutcome::Skipped(candidates);
        }
        let fallback = candidates.clone();
        let reranker = self.clone();
        let query = query.to_string();
        let work =
            tokio::task::spawn_blocking(move || reranker.rerank(&query, candidates));
        match tokio::time::timeout(self.config.timeout, work).await {
            Ok(Ok(list)) => RerankOutcome::Reranked(list),
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "rerank worker lost; keeping retrieval order");
                RerankOutcome::TimedOut(truncated(fallback, self.config.final_k))
            }
            Err(_) => {
                warn!(budget_ms = self.config.timeout.as_millis() as u64, "rerank timed out");
                RerankOutcome::TimedOut(truncated(fallback, self.config.final_k))
            }
        }
    }
}

fn truncated(mut list: Vec<RankedChunk>, final_k: usize) -> Vec<RankedChunk> {
    list.truncate(final_k.max(1));
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::RetrievalResult;
    use crate::segmenter::Chunk;
    use crate::store::ChunkRecord;
    use std::collections::BTreeMap;

    fn candidate(id: &str, text: &str, combined: f32) -> RankedChunk {
        RankedChunk {
            record: ChunkRecord {
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
                embedding: None,
                processed: true,
            },
            scores: RetrievalResult {
                chunk_id: id.to_string(),
                semantic_score: combined,
                lexical_score: 0.0,
                combined_score: combined,
            },
        }
    }

    #[test]
    fn pairwise_scorer_is_bounded() {
        let scorer = TermOverlapScorer;
        let score = scorer.score("lease termination notice", "termination of a lease agreement");
        assert!((0.0..=1.0).contains(&score));
        assert!(score > 0.0);
        assert_eq!(scorer.score("", "anything"), 0.0);
    }

    #[test]
    fn rerank_promotes_relevant_text() {
        let reranker = Reranker::new(RerankConfig::default());
        let candidates = vec![
            candidate("weak", "maritime salvage compensation rules", 0.9),
            candidate("strong", "notice period required before lease termination", 0.5),
        ];
        let reranked = reranker.rerank("lease termination notice period", candidates);
        assert_eq!(reranked[0].scores.chunk_id, "strong");
    }

    #[tokio::test]
    async fn small_sets_skip_reranking() {
        let reranker = Reranker::new(RerankConfig::default());
        let candidates = vec![
            candidate("a", "text one", 0.9),
            candidate("b", "text two", 0.8),
        ];
        match reranker.rerank_timeboxed("query", candidates).await {
            RerankOutcome::Skipped(list) => {
                assert_eq!(list[0].scores.chunk_id, "a");
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_keeps_pre_rerank_order() {
        struct SlowScorer;
        impl PairwiseScorer for SlowScorer {
            fn score(&self, _query: &str, _candidate: &str) -> f32 {
                std::thread::sleep(Duration::from_millis(200));
                1.0
            }
        }
        let reranker = Reranker::with_scorer(
            RerankConfig {
                timeout: Duration::from_millis(20),
                ..RerankConfig::default()
            },
            Arc::new(SlowScorer),
        );
        let candidates = vec![
            candidate("a", "one", 0.9),
            candidate("b", "two", 0.8),
            candidate("c", "three", 0.7),
            candidate("d", "four", 0.6),
        ];
        match reranker.rerank_timeboxed("query", candidates).await {
            RerankOutcome::TimedOut(list) => {
                assert_eq!(list[0].scores.chunk_id, "a");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rerank_truncates_to_final_k() {
        let reranker = Reranker::new(RerankConfig {
            final_k: 2,
            ..RerankConfig::default()
        });
        let candidates = (0..6)
            .map(|i| candidate(&format!("c{i}"), "shared candidate text", 0.5))
            .collect();
        let list = reranker
            .rerank_timeboxed("shared candidate text", candidates)
            .await
            .into_candidates();
        assert_eq!(list.len(), 2);
    }
}
