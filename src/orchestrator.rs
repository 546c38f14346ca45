//! End-to-end query flow: embed, retrieve, rerank, build bounded context,
//! generate, audit.
//!
//! Each stage returns an explicit outcome and carries its own time budget;
//! a blown budget degrades that stage (smaller k, skipped rerank, templated
//! answer, dropped audit write) instead of failing the query. A query
//! surfaces as failed only when retrieval itself is impossible.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::{emit_best_effort, AuditRecord, AuditSink};
use crate::embedding::EmbeddingEngine;
use crate::error::{LexragError, Stage};
use crate::generation::{GenerationClient, GenerationRequest};
use crate::index::{ScopeFilter, SimilarityIndex};
use crate::rerank::{Reranker, RerankOutcome};
use crate::retriever::{HybridRetriever, RankedChunk, RetrievalResult};
use crate::store::ChunkStore;

/// States a query passes through, recorded in order on the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    /// Request accepted.
    Received,
    /// Query embedding in progress.
    Embedding,
    /// Similarity search + hybrid scoring.
    Searching,
    /// Shortlist reranking ran.
    Reranking,
    /// Shortlist was small; rerank skipped.
    SkipRerank,
    /// Bounded context assembled.
    ContextBuilt,
    /// Generation call in flight.
    Generating,
    /// Model-grounded answer produced.
    Answered,
    /// Templated answer from sources only.
    DegradedAnswer,
    /// No fallback path remained.
    Failed,
}

/// Terminal outcome of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    /// Generation succeeded against retrieved context.
    Answered,
    /// A fallback path produced a usable, source-listing answer.
    Degraded,
    /// Retrieval was impossible; no grounded answer exists.
    Failed,
}

/// An incoming question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Natural-language question.
    pub question: String,
    /// Requesting user, for the audit trail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Requested result count; clamped to the configured maximum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    /// Optional scope narrowing.
    #[serde(default)]
    pub scope: ScopeFilter,
}

/// A cited source in the final answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    /// Cited chunk.
    pub chunk_id: String,
    /// Owning document.
    pub doc_id: String,
    /// Article number, when tagged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article_no: Option<u32>,
    /// Section title, when tagged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    /// Scores that ranked the chunk.
    pub scores: RetrievalResult,
    /// Leading text snippet.
    pub snippet: String,
}

/// The packaged answer handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    /// Answer text (model output or degraded template).
    pub text: String,
    /// Sources the answer is grounded in, best first.
    pub sources: Vec<SourceRef>,
    /// Terminal outcome.
    pub outcome: QueryOutcome,
    /// State trace, in execution order.
    pub states: Vec<QueryState>,
    /// Embedding model generation the query ran against.
    pub model_id: String,
    /// Wall-clock latency.
    pub latency_ms: u64,
}

/// Orchestration knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Result count when the request does not override it.
    pub default_top_k: usize,
    /// Upper bound on requested result counts.
    pub max_top_k: usize,
    /// Context cap in characters; lowest-ranked content is cut first.
    pub max_context_chars: usize,
    /// Budget for the search stage.
    pub search_timeout: Duration,
    /// Budget for the generation call.
    pub generation_timeout: Duration,
    /// Budget for the audit write.
    pub audit_timeout: Duration,
    /// Sampling temperature passed to generation.
    pub temperature: f32,
    /// Output length bound passed to generation.
    pub max_output_tokens: usize,
    /// Nucleus-sampling parameter passed to generation.
    pub top_p: f32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            max_top_k: 20,
            max_context_chars: 12_000,
            search_timeout: Duration::from_secs(5),
            generation_timeout: Duration::from_secs(30),
            audit_timeout: Duration::from_secs(2),
            temperature: 0.1,
            max_output_tokens: 600,
            top_p: 0.9,
        }
    }
}

/// Drives one query through the pipeline. Process-wide, shared by all
/// concurrent requests; every collaborator behind it is read-mostly.
pub struct Orchestrator {
    engine: Arc<EmbeddingEngine>,
    index: Arc<RwLock<SimilarityIndex>>,
    store: Arc<dyn ChunkStore>,
    retriever: HybridRetriever,
    reranker: Reranker,
    generator: Arc<dyn GenerationClient>,
    audit: Arc<dyn AuditSink>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Wires the pipeline together.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<EmbeddingEngine>,
        index: Arc<RwLock<SimilarityIndex>>,
        store: Arc<dyn ChunkStore>,
        retriever: HybridRetriever,
        reranker: Reranker,
        generator: Arc<dyn GenerationClient>,
        audit: Arc<dyn AuditSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            engine,
            index,
            store,
            retriever,
            reranker,
            generator,
            audit,
            config,
        }
    }

    /// Answers one query. Never returns an error: every failure mode folds
    /// into the answer's outcome.
    pub async fn answer(&self, request: QueryRequest) -> Answer {
        let started = Instant::now();
        let mut states = vec![QueryState::Received];
        let top_k = request
            .top_k
            .unwrap_or(self.config.default_top_k)
            .clamp(1, self.config.max_top_k);

        states.push(QueryState::Embedding);
        let engine = self.engine.clone();
        let question = request.question.clone();
        let embedded = match tokio::task::spawn_blocking(move || engine.embed(&question)).await {
            Ok(embedded) => embedded,
            Err(join_err) => {
                warn!(error = %join_err, "embedding worker lost");
                return self
                    .finish_failed(request, states, "query embedding unavailable", started)
                    .await;
            }
        };

        states.push(QueryState::Searching);
        let candidates = match self.search(&request, &embedded.vector, top_k).await {
            Ok(candidates) => candidates,
            Err(reason) => {
                return self.finish_failed(request, states, &reason, started).await;
            }
        };

        if candidates.is_empty() {
            states.push(QueryState::DegradedAnswer);
            let answer = Answer {
                text: "No passages in the ingested corpus matched this question at the \
                       configured relevance threshold."
                    .to_string(),
                sources: Vec::new(),
                outcome: QueryOutcome::Degraded,
                states,
                model_id: self.engine.model_id(),
                latency_ms: started.elapsed().as_millis() as u64,
            };
            self.emit_audit(&request, &answer).await;
            return answer;
        }

        let shortlist = match self
            .reranker
            .rerank_timeboxed(&request.question, candidates)
            .await
        {
            RerankOutcome::Skipped(list) => {
                states.push(QueryState::SkipRerank);
                list
            }
            RerankOutcome::Reranked(list) => {
                states.push(QueryState::Reranking);
                list
            }
            RerankOutcome::TimedOut(list) => {
                states.push(QueryState::Reranking);
                list
            }
        };

        let (context, sources) = build_context(&shortlist, self.config.max_context_chars);
        states.push(QueryState::ContextBuilt);

        states.push(QueryState::Generating);
        let (text, outcome) = match self.generate(&request.question, &context).await {
            Some(text) => (text, QueryOutcome::Answered),
            None => (degraded_answer(&sources), QueryOutcome::Degraded),
        };
        states.push(match outcome {
            QueryOutcome::Answered => QueryState::Answered,
            _ => QueryState::DegradedAnswer,
        });

        let answer = Answer {
            text,
            sources,
            outcome,
            states,
            model_id: self.engine.model_id(),
            latency_ms: started.elapsed().as_millis() as u64,
        };
        self.emit_audit(&request, &answer).await;
        answer
    }

    /// Search stage with its own budget. A first timeout retries once with
    /// half the requested k before giving up.
    async fn search(
        &self,
        request: &QueryRequest,
        query_vector: &[f32],
        top_k: usize,
    ) -> std::result::Result<Vec<RankedChunk>, String> {
        match self.search_once(request, query_vector, top_k).await {
            SearchAttempt::Hit(list) => Ok(list),
            SearchAttempt::Broken(reason) => Err(reason),
            SearchAttempt::TimedOut => {
                let reduced = (top_k / 2).max(1);
                warn!(top_k, reduced, "search timed out; retrying with smaller k");
                match self.search_once(request, query_vector, reduced).await {
                    SearchAttempt::Hit(list) => Ok(list),
                    SearchAttempt::Broken(reason) => Err(reason),
                    SearchAttempt::TimedOut => Err(LexragError::StageTimeout {
                        stage: Stage::Search,
                        budget_ms: self.config.search_timeout.as_millis() as u64,
                    }
                    .to_string()),
                }
            }
        }
    }

    async fn search_once(
        &self,
        request: &QueryRequest,
        query_vector: &[f32],
        top_k: usize,
    ) -> SearchAttempt {
        let index = self.index.clone();
        let store = self.store.clone();
        let retriever = self.retriever.clone();
        let question = request.question.clone();
        let scope = request.scope.clone();
        let vector = query_vector.to_vec();
        let work = tokio::task::spawn_blocking(move || {
            let index = index
                .read()
                .map_err(|_| "similarity index lock poisoned".to_string())?;
            retriever
                .retrieve(&index, store.as_ref(), &question, &vector, top_k, &scope)
                .map_err(|err| err.to_string())
        });
        match tokio::time::timeout(self.config.search_timeout, work).await {
            Ok(Ok(Ok(list))) => SearchAttempt::Hit(list),
            Ok(Ok(Err(reason))) => SearchAttempt::Broken(reason),
            Ok(Err(join_err)) => SearchAttempt::Broken(format!("search worker lost: {join_err}")),
            Err(_) => SearchAttempt::TimedOut,
        }
    }

    /// Generation stage: `Some(text)` on usable output, `None` for every
    /// degradable condition (error, timeout, empty text).
    async fn generate(&self, question: &str, context: &str) -> Option<String> {
        let request = GenerationRequest {
            prompt: build_prompt(question, context),
            temperature: self.config.temperature,
            max_tokens: self.config.max_output_tokens,
            top_p: self.config.top_p,
        };
        let generator = self.generator.clone();
        let work = tokio::task::spawn_blocking(move || generator.generate(&request));
        match tokio::time::timeout(self.config.generation_timeout, work).await {
            Ok(Ok(Ok(text))) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    warn!("generation returned empty output; degrading");
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Ok(Ok(Err(err))) => {
                let reason = LexragError::Generation(err.to_string());
                warn!(error = %reason, "degrading to templated answer");
                None
            }
            Ok(Err(join_err)) => {
                let reason = LexragError::Generation(format!("worker lost: {join_err}"));
                warn!(error = %reason, "degrading to templated answer");
                None
            }
            Err(_) => {
                let reason = LexragError::StageTimeout {
                    stage: Stage::Generation,
                    budget_ms: self.config.generation_timeout.as_millis() as u64,
                };
                warn!(error = %reason, "degrading to templated answer");
                None
            }
        }
    }

    async fn finish_failed(
        &self,
        request: QueryRequest,
        mut states: Vec<QueryState>,
        reason: &str,
        started: Instant,
    ) -> Answer {
        states.push(QueryState::Failed);
        let answer = Answer {
            text: format!("The question could not be answered: {reason}."),
            sources: Vec::new(),
            outcome: QueryOutcome::Failed,
            states,
            model_id: self.engine.model_id(),
            latency_ms: started.elapsed().as_millis() as u64,
        };
        self.emit_audit(&request, &answer).await;
        answer
    }

    /// Audit emission runs on success and failure paths alike and never
    /// propagates an error.
    async fn emit_audit(&self, request: &QueryRequest, answer: &Answer) {
        let record = AuditRecord {
            user: request.user.clone(),
            question: request.question.clone(),
            sources: answer
                .sources
                .iter()
                .map(|source| source.chunk_id.clone())
                .collect(),
            answer: answer.text.clone(),
            outcome: match answer.outcome {
                QueryOutcome::Answered => "answered",
                QueryOutcome::Degraded => "degraded",
                QueryOutcome::Failed => "failed",
            }
            .to_string(),
            unix_ms: 0,
        }
        .stamp();
        let landed = emit_best_effort(self.audit.clone(), record, self.config.audit_timeout).await;
        debug!(landed, "audit record emitted");
    }
}

enum SearchAttempt {
    Hit(Vec<RankedChunk>),
    TimedOut,
    Broken(String),
}

/// Assembles the bounded context and the source list. Chunks enter in rank
/// order; once the cap is hit, remaining (lower-ranked) chunks are dropped.
/// The first chunk alone exceeding the cap is cut at a word boundary so the
/// context is never empty when sources exist.
fn build_context(shortlist: &[RankedChunk], max_chars: usize) -> (String, Vec<SourceRef>) {
    let mut context = String::new();
    let mut sources = Vec::new();
    for (rank, candidate) in shortlist.iter().enumerate() {
        let chunk = &candidate.record.chunk;
        let mut excerpt = format!("[{}] {}\n{}\n", rank + 1, excerpt_header(candidate), chunk.text);
        if context.len() + excerpt.len() > max_chars {
            if sources.is_empty() {
                truncate_at_word(&mut excerpt, max_chars);
            } else {
                break;
            }
        }
        context.push_str(&excerpt);
        context.push('\n');
        sources.push(SourceRef {
            chunk_id: chunk.id.clone(),
            doc_id: chunk.doc_id.clone(),
            article_no: chunk.article_no,
            section_title: chunk.section_title.clone(),
            scores: candidate.scores.clone(),
            snippet: chunk.text.chars().take(160).collect(),
        });
    }
    (context, sources)
}

fn excerpt_header(candidate: &RankedChunk) -> String {
    let chunk = &candidate.record.chunk;
    let mut header = chunk.doc_id.clone();
    if let Some(article) = chunk.article_no {
        header.push_str(&format!(", article {article}"));
    }
    if let Some(section) = &chunk.section_title {
        header.push_str(&format!(", {section}"));
    }
    header
}

fn truncate_at_word(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    // Floor to a char boundary first; byte max_bytes may fall inside a
    // multi-byte character.
    let mut boundary = max_bytes;
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let cut = text[..boundary]
        .rfind(char::is_whitespace)
        .unwrap_or(boundary);
    text.truncate(cut);
}

fn build_prompt(question: &str, context: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Answer the question using only the numbered excerpts below. \
         Cite every claim with its excerpt number as [n]. \
         If the excerpts do not contain the answer, say so explicitly.\n\n",
    );
    prompt.push_str("Excerpts:\n");
    prompt.push_str(context);
    prompt.push_str("\nQuestion:\n");
    prompt.push_str(question);
    prompt
}

/// Templated answer used when generation produced nothing usable; it still
/// points the caller at the retrieved passages.
fn degraded_answer(sources: &[SourceRef]) -> String {
    let mut out = String::from(
        "An answer could not be generated right now. \
         The following passages are the most relevant to your question:\n",
    );
    for (rank, source) in sources.iter().enumerate() {
        out.push_str(&format!("{}. {}", rank + 1, source.doc_id));
        if let Some(article) = source.article_no {
            out.push_str(&format!(", article {article}"));
        }
        out.push_str(&format!(": {}\n", source.snippet));
    }
    out
}
