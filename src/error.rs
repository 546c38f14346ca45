//! Error taxonomy shared across the pipeline.

use thiserror::Error;

/// Pipeline stage labels used in timeout errors and state traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Query embedding.
    Embedding,
    /// Similarity search + hybrid scoring.
    Search,
    /// Shortlist reranking.
    Rerank,
    /// External answer generation.
    Generation,
    /// Audit log emission.
    Audit,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Embedding => "embedding",
            Stage::Search => "search",
            Stage::Rerank => "rerank",
            Stage::Generation => "generation",
            Stage::Audit => "audit",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the retrieval/answering core.
#[derive(Debug, Error)]
pub enum LexragError {
    /// Ingested document is structurally malformed; rejected before any
    /// chunk is created.
    #[error("invalid document: {0}")]
    Validation(String),

    /// The embedding model could not be loaded or warmed up. Reported at
    /// engine init, where it downgrades the mode; never surfaced as a query
    /// failure.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// A pipeline stage exceeded its time budget and no fallback remained.
    #[error("{stage} stage exceeded its {budget_ms}ms budget")]
    StageTimeout {
        /// Stage that ran out of budget.
        stage: Stage,
        /// Configured budget in milliseconds.
        budget_ms: u64,
    },

    /// The generation service errored, timed out, or returned nothing
    /// usable. Triggers the templated degraded answer.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Index or store write failure during ingestion.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

/// Convenience alias used across the library.
pub type Result<T> = std::result::Result<T, LexragError>;
