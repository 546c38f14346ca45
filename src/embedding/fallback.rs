//! Deterministic hash-derived embeddings used when no model is available.
//!
//! A SHA-256 counter expansion turns normalized text into a fixed-length
//! vector: identical input always yields the identical vector, and distinct
//! inputs differ with overwhelming probability. The vectors carry no
//! semantic signal, but they keep the index, retriever, and orchestrator
//! fully operational (lexical scoring still ranks meaningfully).

use sha2::{Digest, Sha256};

/// Default fallback vector width.
pub const DEFAULT_FALLBACK_DIM: usize = 256;

/// Hash-based embedder with a fixed output dimension.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    /// Builds a hash embedder producing `dimension`-wide vectors.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Output vector width.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Derives a unit-normalized vector from already-normalized text.
    pub fn embed(&self, normalized: &str) -> Vec<f32> {
        let mut lanes = Vec::with_capacity(self.dimension);
        let mut counter = 0u32;
        while lanes.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(normalized.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for byte in digest.iter() {
                if lanes.len() == self.dimension {
                    break;
                }
                // Center bytes around zero so the vector is not biased
                // toward the positive orthant.
                lanes.push(*byte as f32 - 127.5);
            }
            counter += 1;
        }
        unit_normalize(&mut lanes);
        lanes
    }
}

/// Scales a vector to unit length in place. All-zero input is left as-is.
pub fn unit_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for lane in vector.iter_mut() {
            *lane /= norm;
        }
    }
}
