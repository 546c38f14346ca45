//! In-memory similarity index over unit-normalized vectors.
//!
//! Brute-force cosine scan with chunk-id back-references; at the corpus
//! sizes this serves (tens of thousands of chunks) a scan stays well under
//! the search budget. Readers share a stable snapshot behind the caller's
//! lock; mutation happens only during ingestion or an explicit rebuild.

use serde::{Deserialize, Serialize};

/// One indexed vector with the scope tags used by pre-filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Back-reference to the chunk.
    pub chunk_id: String,
    /// Owning source document.
    pub source_id: String,
    /// Jurisdiction tag, if known.
    pub jurisdiction: Option<String>,
    /// Document type tag, if known.
    pub doc_type: Option<String>,
    /// Unit-normalized embedding vector.
    pub vector: Vec<f32>,
}

/// Narrowing filters applied before scoring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeFilter {
    /// Restrict to one source document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Restrict to one jurisdiction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
    /// Restrict to one document type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
}

impl ScopeFilter {
    fn admits(&self, entry: &IndexEntry) -> bool {
        if let Some(source) = &self.source_id {
            if entry.source_id != *source {
                return false;
            }
        }
        if let Some(jurisdiction) = &self.jurisdiction {
            if entry.jurisdiction.as_deref() != Some(jurisdiction.as_str()) {
                return false;
            }
        }
        if let Some(doc_type) = &self.doc_type {
            if entry.doc_type.as_deref() != Some(doc_type.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A scored nearest-neighbor hit.
#[derive(Debug, Clone)]
pub struct IndexHit {
    /// Chunk back-reference.
    pub chunk_id: String,
    /// Raw cosine similarity in [-1, 1].
    pub cosine: f32,
}

/// In-memory similarity index. One active vector per chunk per model
/// generation; inserting an existing chunk id replaces its vector.
#[derive(Debug, Default)]
pub struct SimilarityIndex {
    entries: Vec<IndexEntry>,
    /// Model identifier of the vectors currently held. Mixing generations
    /// would make cosine scores meaningless.
    generation: Option<String>,
}

impl SimilarityIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Model generation of the held vectors.
    pub fn generation(&self) -> Option<&str> {
        self.generation.as_deref()
    }

    /// Inserts or replaces one entry. The first insert pins the index to
    /// that model generation; entries from another generation are rejected
    /// by the caller via [`SimilarityIndex::matches_generation`].
    pub fn insert(&mut self, entry: IndexEntry, model_id: &str) {
        if self.generation.is_none() {
            self.generation = Some(model_id.to_string());
        }
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|held| held.chunk_id == entry.chunk_id)
        {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
    }

    /// True when `model_id` matches the held generation (or the index is
    /// still empty).
    pub fn matches_generation(&self, model_id: &str) -> bool {
        self.generation
            .as_deref()
            .map(|held| held == model_id)
            .unwrap_or(true)
    }

    /// Drops every entry belonging to `source_id`; returns how many were
    /// removed. Used when a source document is deleted (cascade).
    pub fn remove_source(&mut self, source_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.source_id != source_id);
        before - self.entries.len()
    }

    /// Replaces the whole vector set in one administrative operation, e.g.
    /// after a model-generation change.
    pub fn rebuild(&mut self, entries: Vec<IndexEntry>, model_id: &str) {
        self.entries = entries;
        self.generation = Some(model_id.to_string());
    }

    /// Returns up to `limit` nearest entries by cosine similarity, highest
    /// first, after applying the scope filter.
    pub fn search(&self, query: &[f32], limit: usize, filter: &ScopeFilter) -> Vec<IndexHit> {
        if limit == 0 || query.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<IndexHit> = self
            .entries
            .iter()
            .filter(|entry| filter.admits(entry))
            .map(|entry| IndexHit {
                chunk_id: entry.chunk_id.clone(),
                cosine: dot(query, &entry.vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.cosine
                .partial_cmp(&a.cosine)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        hits
    }
}

/// Dot product; equals cosine for unit-normalized inputs. Mismatched
/// dimensions (stale generation) score zero instead of panicking.
fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(chunk_id: &str, source: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            chunk_id: chunk_id.to_string(),
            source_id: source.to_string(),
            jurisdiction: Some("ae".to_string()),
            doc_type: Some("law".to_string()),
            vector,
        }
    }

    #[test]
    fn ranks_by_cosine() {
        let mut index = SimilarityIndex::new();
        index.insert(entry("a", "doc", vec![1.0, 0.0]), "hash-v1");
        index.insert(entry("b", "doc", vec![0.0, 1.0]), "hash-v1");
        let hits = index.search(&[1.0, 0.0], 2, &ScopeFilter::default());
        assert_eq!(hits[0].chunk_id, "a");
        assert!(hits[0].cosine > hits[1].cosine);
    }

    #[test]
    fn insert_replaces_existing_chunk() {
        let mut index = SimilarityIndex::new();
        index.insert(entry("a", "doc", vec![1.0, 0.0]), "hash-v1");
        index.insert(entry("a", "doc", vec![0.0, 1.0]), "hash-v1");
        assert_eq!(index.len(), 1);
        let hits = index.search(&[0.0, 1.0], 1, &ScopeFilter::default());
        assert!(hits[0].cosine > 0.99);
    }

    #[test]
    fn scope_filter_narrows_candidates() {
        let mut index = SimilarityIndex::new();
        index.insert(entry("a", "lease-law", vec![1.0, 0.0]), "hash-v1");
        index.insert(entry("b", "labor-law", vec![1.0, 0.0]), "hash-v1");
        let filter = ScopeFilter {
            source_id: Some("labor-law".to_string()),
            ..ScopeFilter::default()
        };
        let hits = index.search(&[1.0, 0.0], 10, &filter);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "b");
    }

    #[test]
    fn remove_source_cascades() {
        let mut index = SimilarityIndex::new();
        index.insert(entry("a", "doc1", vec![1.0]), "hash-v1");
        index.insert(entry("b", "doc1", vec![1.0]), "hash-v1");
        index.insert(entry("c", "doc2", vec![1.0]), "hash-v1");
        assert_eq!(index.remove_source("doc1"), 2);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn rebuild_swaps_generation() {
        let mut index = SimilarityIndex::new();
        index.insert(entry("a", "doc", vec![1.0]), "hash-v1");
        index.rebuild(vec![entry("a", "doc", vec![0.5, 0.5])], "model-v2");
        assert_eq!(index.generation(), Some("model-v2"));
        assert!(!index.matches_generation("hash-v1"));
    }
}
