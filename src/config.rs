//! Shared configuration surface for the pipeline binaries.
//!
//! Every knob is reachable through flags or `LEXRAG_*` environment
//! variables; the typed config structs in each module keep their own
//! defaults, and this CLI only overrides what operators actually tune.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::embedding::{EmbeddingConfig, ModelSettings};
use crate::orchestrator::OrchestratorConfig;
use crate::rerank::RerankConfig;
use crate::retriever::RetrieverConfig;
use crate::segmenter::SegmenterConfig;

/// Command-line interface shared by binaries that run the pipeline.
#[derive(Parser, Debug, Clone)]
#[command(name = "lexrag", about = "Legal corpus retrieval pipeline controls")]
pub struct Cli {
    /// Embeddings API key (empty selects the hash fallback)
    #[arg(long, env = "LEXRAG_EMBED_API_KEY", default_value = "")]
    pub embed_api_key: String,

    /// Embeddings endpoint base URL
    #[arg(long, env = "LEXRAG_EMBED_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub embed_base_url: String,

    /// Embedding model identifier
    #[arg(long, env = "LEXRAG_EMBED_MODEL", default_value = "text-embedding-3-small")]
    pub embed_model: String,

    /// Embedding dimension override (0 = model default)
    #[arg(long, env = "LEXRAG_EMBED_DIMENSIONS", default_value_t = 0)]
    pub embed_dimensions: usize,

    /// Per-request embedding timeout in milliseconds
    #[arg(long, env = "LEXRAG_EMBED_TIMEOUT_MS", default_value_t = 10_000)]
    pub embed_timeout_ms: u64,

    /// Retry attempts for transient embedding failures
    #[arg(long, env = "LEXRAG_EMBED_RETRIES", default_value_t = 3)]
    pub embed_retries: usize,

    /// Inputs per embedding request
    #[arg(long, env = "LEXRAG_EMBED_BATCH", default_value_t = 32)]
    pub embed_batch: usize,

    /// Force the deterministic hash fallback even when a key is configured
    #[arg(long, env = "LEXRAG_FORCE_FALLBACK", default_value_t = false)]
    pub force_fallback: bool,

    /// Vector width in fallback mode
    #[arg(long, env = "LEXRAG_FALLBACK_DIM", default_value_t = 256)]
    pub fallback_dimension: usize,

    /// Start in fallback mode below this much available memory, MiB (0 = off)
    #[arg(long, env = "LEXRAG_MIN_MEMORY_MB", default_value_t = 0)]
    pub min_memory_mb: u64,

    /// Minimum combined relevance score for retrieval results
    #[arg(long, env = "LEXRAG_MIN_SCORE", default_value_t = 0.25)]
    pub min_score: f32,

    /// Weight of the semantic score in hybrid retrieval
    #[arg(long, env = "LEXRAG_SEMANTIC_WEIGHT", default_value_t = 0.85)]
    pub semantic_weight: f32,

    /// Default result count per query
    #[arg(long, env = "LEXRAG_TOP_K", default_value_t = 10)]
    pub top_k: usize,

    /// Final shortlist length after reranking
    #[arg(long, env = "LEXRAG_FINAL_K", default_value_t = 5)]
    pub final_k: usize,

    /// Rerank budget in milliseconds
    #[arg(long, env = "LEXRAG_RERANK_TIMEOUT_MS", default_value_t = 500)]
    pub rerank_timeout_ms: u64,

    /// Generation API key (empty disables generation; answers degrade)
    #[arg(long, env = "LEXRAG_GEN_API_KEY", default_value = "")]
    pub gen_api_key: String,

    /// Generation endpoint base URL
    #[arg(long, env = "LEXRAG_GEN_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub gen_base_url: String,

    /// Generation model identifier
    #[arg(long, env = "LEXRAG_GEN_MODEL", default_value = "gpt-4o-mini")]
    pub gen_model: String,

    /// Generation call budget in milliseconds
    #[arg(long, env = "LEXRAG_GEN_TIMEOUT_MS", default_value_t = 30_000)]
    pub gen_timeout_ms: u64,

    /// Context cap in characters handed to generation
    #[arg(long, env = "LEXRAG_MAX_CONTEXT_CHARS", default_value_t = 12_000)]
    pub max_context_chars: usize,

    /// Append-only audit log path
    #[arg(long, env = "LEXRAG_AUDIT_LOG", default_value = "lexrag-audit.jsonl")]
    pub audit_log: PathBuf,

    /// Target chunk size in tokens
    #[arg(long, env = "LEXRAG_CHUNK_TOKENS", default_value_t = 220)]
    pub chunk_tokens: usize,
}

impl Cli {
    /// Embedding engine settings derived from the CLI.
    pub fn embedding_config(&self) -> EmbeddingConfig {
        let model = (!self.force_fallback && !self.embed_api_key.trim().is_empty()).then(|| {
            ModelSettings {
                api_key: self.embed_api_key.clone(),
                base_url: self.embed_base_url.clone(),
                model: self.embed_model.clone(),
                dimensions: (self.embed_dimensions > 0).then_some(self.embed_dimensions),
                timeout: Duration::from_millis(self.embed_timeout_ms),
                max_retries: self.embed_retries,
            }
        });
        EmbeddingConfig {
            model,
            fallback_dimension: self.fallback_dimension,
            batch_size: self.embed_batch,
            min_available_memory_mb: self.min_memory_mb,
            ..EmbeddingConfig::default()
        }
    }

    /// Hybrid retrieval settings derived from the CLI.
    pub fn retriever_config(&self) -> RetrieverConfig {
        RetrieverConfig {
            semantic_weight: self.semantic_weight,
            min_score: self.min_score,
            ..RetrieverConfig::default()
        }
    }

    /// Rerank settings derived from the CLI.
    pub fn rerank_config(&self) -> RerankConfig {
        RerankConfig {
            final_k: self.final_k,
            timeout: Duration::from_millis(self.rerank_timeout_ms),
            ..RerankConfig::default()
        }
    }

    /// Orchestration settings derived from the CLI.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            default_top_k: self.top_k.max(1),
            max_context_chars: self.max_context_chars,
            generation_timeout: Duration::from_millis(self.gen_timeout_ms),
            ..OrchestratorConfig::default()
        }
    }

    /// Segmentation settings derived from the CLI.
    pub fn segmenter_config(&self) -> SegmenterConfig {
        let target = self.chunk_tokens.max(10);
        SegmenterConfig {
            target_tokens: target,
            max_tokens: (target * 3 / 2).max(target + 1),
            ..SegmenterConfig::default()
        }
    }

    /// Whether a generation backend is configured at all.
    pub fn generation_enabled(&self) -> bool {
        !self.gen_api_key.trim().is_empty()
    }

    /// Generation call budget.
    pub fn gen_timeout(&self) -> Duration {
        Duration::from_millis(self.gen_timeout_ms)
    }
}
