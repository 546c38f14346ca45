//! Vector embedding engine with a model-backed mode and a deterministic
//! hash fallback.
//!
//! The operating mode is decided once at engine construction: the model
//! client must build and answer a warmup probe, and the host must have
//! enough available memory. Any failure silently selects fallback mode for
//! the remainder of the process lifetime (logged, never raised to callers).
//! A failed model batch at runtime degrades per-item to fallback vectors
//! rather than aborting the batch.

pub mod fallback;
pub mod model;

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LexragError;
use crate::normalize::normalize_text;
use fallback::{HashEmbedder, DEFAULT_FALLBACK_DIM};
use model::ModelEmbedder;

/// Which path produced a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedMode {
    /// Pretrained sentence-embedding model.
    Model,
    /// Deterministic hash expansion.
    Fallback,
}

/// A produced vector together with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedVector {
    /// Unit-normalized vector lanes.
    pub vector: Vec<f32>,
    /// Producing mode.
    pub mode: EmbedMode,
    /// Model identifier (or `"hash-v1"` in fallback mode). Vectors from
    /// different identifiers belong to different model generations and must
    /// not share an index.
    pub model_id: String,
}

/// Connection settings for the model-backed mode.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// Bearer key for the embeddings endpoint.
    pub api_key: String,
    /// Endpoint base URL.
    pub base_url: String,
    /// Embedding model identifier.
    pub model: String,
    /// Optional dimension override.
    pub dimensions: Option<usize>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry attempts for transient failures.
    pub max_retries: usize,
}

/// Embedding engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Model connection settings; `None` forces fallback mode.
    pub model: Option<ModelSettings>,
    /// Vector width in fallback mode.
    pub fallback_dimension: usize,
    /// Inputs per model request.
    pub batch_size: usize,
    /// Inputs longer than this many characters are truncated before
    /// normalization-sensitive work.
    pub max_sequence_chars: usize,
    /// Cached embeddings kept by normalized text (0 disables).
    pub cache_size: usize,
    /// Start in fallback mode when available memory is below this many MiB
    /// (0 disables the probe).
    pub min_available_memory_mb: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: None,
            fallback_dimension: DEFAULT_FALLBACK_DIM,
            batch_size: 32,
            max_sequence_chars: 8_000,
            cache_size: 1024,
            min_available_memory_mb: 0,
        }
    }
}

/// Model identifier recorded on fallback vectors.
pub const FALLBACK_MODEL_ID: &str = "hash-v1";

enum Backend {
    Model(ModelEmbedder),
    Fallback,
}

/// Process-wide embedding service. Construct once, share by reference.
pub struct EmbeddingEngine {
    backend: Backend,
    hash: HashEmbedder,
    batch_size: usize,
    max_sequence_chars: usize,
    cache: Option<Mutex<LruCache<String, EmbeddedVector>>>,
}

impl EmbeddingEngine {
    /// Builds the engine and selects the operating mode. Never fails: every
    /// degraded condition lands in fallback mode.
    pub fn init(config: &EmbeddingConfig) -> Self {
        let backend = Self::select_backend(config);
        let cache = NonZeroUsize::new(config.cache_size)
            .map(|capacity| Mutex::new(LruCache::new(capacity)));
        Self {
            backend,
            hash: HashEmbedder::new(config.fallback_dimension),
            batch_size: config.batch_size.max(1),
            max_sequence_chars: config.max_sequence_chars.max(1),
            cache,
        }
    }

    fn select_backend(config: &EmbeddingConfig) -> Backend {
        if config.min_available_memory_mb > 0 {
            if let Some(available) = available_memory_mb() {
                if available < config.min_available_memory_mb {
                    warn!(
                        available_mb = available,
                        threshold_mb = config.min_available_memory_mb,
                        "available memory below threshold; using fallback embeddings"
                    );
                    return Backend::Fallback;
                }
            }
        }
        let Some(settings) = &config.model else {
            debug!("no model configured; using fallback embeddings");
            return Backend::Fallback;
        };
        match ModelEmbedder::new(settings) {
            Ok(embedder) => match embedder.warmup() {
                Ok(()) => Backend::Model(embedder),
                Err(err) => {
                    let reason = LexragError::ModelUnavailable(format!("warmup failed: {err}"));
                    warn!(error = %reason, "using fallback embeddings");
                    Backend::Fallback
                }
            },
            Err(err) => {
                let reason = LexragError::ModelUnavailable(err.to_string());
                warn!(error = %reason, "using fallback embeddings");
                Backend::Fallback
            }
        }
    }

    /// The mode the engine operates in for this process lifetime.
    pub fn mode(&self) -> EmbedMode {
        match self.backend {
            Backend::Model(_) => EmbedMode::Model,
            Backend::Fallback => EmbedMode::Fallback,
        }
    }

    /// Model identifier stamped on produced vectors.
    pub fn model_id(&self) -> String {
        match &self.backend {
            Backend::Model(embedder) => embedder.model().to_string(),
            Backend::Fallback => FALLBACK_MODEL_ID.to_string(),
        }
    }

    /// Embeds one text. Deterministic for identical normalized input within
    /// the same mode and model identifier.
    pub fn embed(&self, text: &str) -> EmbeddedVector {
        self.embed_batch(&[text.to_string()])
            .into_iter()
            .next()
            .unwrap_or_else(|| self.fallback_vector(&self.prepare(text)))
    }

    /// Embeds texts preserving input order.
    pub fn embed_batch(&self, texts: &[String]) -> Vec<EmbeddedVector> {
        let prepared: Vec<String> = texts.iter().map(|t| self.prepare(t)).collect();

        let mut out: Vec<Option<EmbeddedVector>> = vec![None; prepared.len()];
        let mut misses: Vec<usize> = Vec::new();
        for (idx, key) in prepared.iter().enumerate() {
            if let Some(hit) = self.cache_get(key) {
                out[idx] = Some(hit);
            } else {
                misses.push(idx);
            }
        }

        for group in misses.chunks(self.batch_size) {
            let vectors = self.embed_group(&prepared, group);
            for (&idx, vector) in group.iter().zip(vectors.into_iter()) {
                self.cache_put(prepared[idx].clone(), vector.clone());
                out[idx] = Some(vector);
            }
        }

        out.into_iter()
            .enumerate()
            .map(|(idx, slot)| slot.unwrap_or_else(|| self.fallback_vector(&prepared[idx])))
            .collect()
    }

    fn embed_group(&self, prepared: &[String], group: &[usize]) -> Vec<EmbeddedVector> {
        match &self.backend {
            Backend::Fallback => group
                .iter()
                .map(|&idx| self.fallback_vector(&prepared[idx]))
                .collect(),
            Backend::Model(embedder) => {
                let inputs: Vec<&str> = group.iter().map(|&idx| prepared[idx].as_str()).collect();
                match embedder.embed_batch(&inputs) {
                    // The client hands back dimension-checked, unit-normalized
                    // vectors in input order.
                    Ok(vectors) => vectors
                        .into_iter()
                        .map(|vector| EmbeddedVector {
                            vector,
                            mode: EmbedMode::Model,
                            model_id: embedder.model().to_string(),
                        })
                        .collect(),
                    Err(err) => {
                        // Degrade this batch per-item instead of failing the
                        // caller; the mode itself is unchanged.
                        warn!(
                            error = %err,
                            batch = group.len(),
                            "model batch failed; degrading items to fallback vectors"
                        );
                        group
                            .iter()
                            .map(|&idx| self.fallback_vector(&prepared[idx]))
                            .collect()
                    }
                }
            }
        }
    }

    fn fallback_vector(&self, normalized: &str) -> EmbeddedVector {
        EmbeddedVector {
            vector: self.hash.embed(normalized),
            mode: EmbedMode::Fallback,
            model_id: FALLBACK_MODEL_ID.to_string(),
        }
    }

    fn prepare(&self, text: &str) -> String {
        let normalized = normalize_text(text);
        if normalized.chars().count() > self.max_sequence_chars {
            normalized.chars().take(self.max_sequence_chars).collect()
        } else {
            normalized
        }
    }

    fn cache_get(&self, key: &str) -> Option<EmbeddedVector> {
        let cache = self.cache.as_ref()?;
        let mut guard = cache.lock().ok()?;
        guard.get(key).cloned()
    }

    fn cache_put(&self, key: String, value: EmbeddedVector) {
        if let Some(cache) = &self.cache {
            if let Ok(mut guard) = cache.lock() {
                guard.put(key, value);
            }
        }
    }
}

/// Available system memory in MiB, if the platform exposes it.
#[cfg(target_os = "linux")]
fn available_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn available_memory_mb() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback_engine() -> EmbeddingEngine {
        EmbeddingEngine::init(&EmbeddingConfig {
            fallback_dimension: 64,
            cache_size: 8,
            ..EmbeddingConfig::default()
        })
    }

    #[test]
    fn no_model_selects_fallback() {
        let engine = fallback_engine();
        assert_eq!(engine.mode(), EmbedMode::Fallback);
        assert_eq!(engine.model_id(), FALLBACK_MODEL_ID);
    }

    #[test]
    fn embed_is_deterministic() {
        let engine = fallback_engine();
        let a = engine.embed("The lessee shall vacate the premises.");
        let b = engine.embed("The lessee shall vacate the premises.");
        assert_eq!(a.vector, b.vector);
        assert_eq!(a.mode, EmbedMode::Fallback);
    }

    #[test]
    fn normalization_variants_share_a_vector() {
        let engine = fallback_engine();
        let a = engine.embed("Lease   TERMINATION");
        let b = engine.embed("lease termination");
        assert_eq!(a.vector, b.vector);
    }

    #[test]
    fn batch_preserves_order() {
        let engine = fallback_engine();
        let texts = vec![
            "first text".to_string(),
            "second text".to_string(),
            "third text".to_string(),
        ];
        let batch = engine.embed_batch(&texts);
        assert_eq!(batch.len(), 3);
        for (text, embedded) in texts.iter().zip(&batch) {
            assert_eq!(embedded.vector, engine.embed(text).vector);
        }
    }

    #[test]
    fn oversized_input_is_truncated_deterministically() {
        let engine = EmbeddingEngine::init(&EmbeddingConfig {
            fallback_dimension: 32,
            max_sequence_chars: 10,
            cache_size: 0,
            ..EmbeddingConfig::default()
        });
        let a = engine.embed("abcdefghij-TAIL-ONE");
        let b = engine.embed("abcdefghij-TAIL-TWO");
        assert_eq!(a.vector, b.vector);
    }
}
