#![warn(missing_docs)]
//! Core library entry points for the lexrag legal retrieval pipeline.

pub mod audit;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod normalize;
pub mod orchestrator;
pub mod rerank;
pub mod retriever;
pub mod segmenter;
pub mod store;

pub use audit::{AuditRecord, AuditSink, JsonlAuditSink};
pub use config::Cli;
pub use embedding::{EmbedMode, EmbeddedVector, EmbeddingConfig, EmbeddingEngine};
pub use error::{LexragError, Result, Stage};
pub use generation::{GenerationClient, GenerationRequest, HttpGenerationClient};
pub use index::{IndexEntry, IndexHit, ScopeFilter, SimilarityIndex};
pub use ingest::{IngestDocument, IngestReport, Ingestor};
pub use orchestrator::{
    Answer, Orchestrator, OrchestratorConfig, QueryOutcome, QueryRequest, QueryState, SourceRef,
};
pub use rerank::{PairwiseScorer, Reranker, RerankConfig, RerankOutcome, TermOverlapScorer};
pub use retriever::{HybridRetriever, RankedChunk, RetrievalResult, RetrieverConfig};
pub use segmenter::{Chunk, Segmenter, SegmenterConfig};
pub use store::{ChunkRecord, ChunkStore, MemoryChunkStore};
