//! Document/chunk store collaborator interface.
//!
//! Persistence itself is external to the core; this trait is the seam the
//! pipeline writes through. The in-memory implementation backs the service
//! and the test suite.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddedVector;
use crate::error::{LexragError, Result};
use crate::segmenter::Chunk;

/// A persisted chunk row: the chunk plus its scope tags, checksum, and
/// embedding state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// The chunk itself (id, order, text, structural tags).
    pub chunk: Chunk,
    /// Jurisdiction of the owning document, denormalized for filtering.
    pub jurisdiction: Option<String>,
    /// Document type of the owning document, denormalized for filtering.
    pub doc_type: Option<String>,
    /// CRC32 of the chunk text, for cheap change detection.
    pub checksum: u32,
    /// Active embedding vector, present once processed.
    pub embedding: Option<EmbeddedVector>,
    /// True once an embedding has been written back.
    pub processed: bool,
}

/// Store collaborator the ingestion pipeline and retriever read through.
pub trait ChunkStore: Send + Sync {
    /// Inserts or replaces a batch of chunk rows.
    fn upsert_chunks(&self, records: Vec<ChunkRecord>) -> Result<()>;

    /// Returns up to `limit` rows that still lack an embedding.
    fn unprocessed(&self, limit: usize) -> Result<Vec<ChunkRecord>>;

    /// Writes embeddings back and flips the processed flag.
    fn store_embeddings(&self, vectors: Vec<(String, EmbeddedVector)>) -> Result<()>;

    /// Fetches one row by chunk id.
    fn get(&self, chunk_id: &str) -> Result<Option<ChunkRecord>>;

    /// Fetches many rows, skipping ids that are gone.
    fn get_many(&self, chunk_ids: &[String]) -> Result<Vec<ChunkRecord>> {
        let mut out = Vec::with_capacity(chunk_ids.len());
        for id in chunk_ids {
            if let Some(record) = self.get(id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Deletes every chunk of a source document; returns how many went.
    fn remove_source(&self, doc_id: &str) -> Result<usize>;

    /// True when this document was already ingested with this exact content
    /// fingerprint.
    fn fingerprint_seen(&self, doc_id: &str, fingerprint: &str) -> Result<bool>;

    /// Records a document's content fingerprint, replacing any prior one.
    fn record_fingerprint(&self, doc_id: &str, fingerprint: &str) -> Result<()>;

    /// Drops a document's fingerprint so a later re-ingest is not treated
    /// as a duplicate.
    fn forget_fingerprint(&self, doc_id: &str) -> Result<()>;

    /// All processed rows, for an explicit index rebuild.
    fn processed_records(&self) -> Result<Vec<ChunkRecord>>;
}

/// Hash-map-backed store used by the service binary and tests.
#[derive(Default)]
pub struct MemoryChunkStore {
    rows: Mutex<HashMap<String, ChunkRecord>>,
    /// doc_id -> content fingerprint of the last complete ingest.
    fingerprints: Mutex<HashMap<String, String>>,
}

impl MemoryChunkStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_rows(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ChunkRecord>>> {
        self.rows
            .lock()
            .map_err(|_| LexragError::Persistence("chunk store lock poisoned".to_string()))
    }

    fn lock_fingerprints(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.fingerprints
            .lock()
            .map_err(|_| LexragError::Persistence("fingerprint lock poisoned".to_string()))
    }
}

impl ChunkStore for MemoryChunkStore {
    fn upsert_chunks(&self, records: Vec<ChunkRecord>) -> Result<()> {
        let mut rows = self.lock_rows()?;
        for record in records {
            rows.insert(record.chunk.id.clone(), record);
        }
        Ok(())
    }

    fn unprocessed(&self, limit: usize) -> Result<Vec<ChunkRecord>> {
        let rows = self.lock_rows()?;
        let mut out: Vec<ChunkRecord> = rows
            .values()
            .filter(|record| !record.processed)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (&a.chunk.doc_id, a.chunk.position).cmp(&(&b.chunk.doc_id, b.chunk.position))
        });
        out.truncate(limit);
        Ok(out)
    }

    fn store_embeddings(&self, vectors: Vec<(String, EmbeddedVector)>) -> Result<()> {
        let mut rows = self.lock_rows()?;
        for (chunk_id, vector) in vectors {
            let record = rows.get_mut(&chunk_id).ok_or_else(|| {
                LexragError::Persistence(format!("unknown chunk id {chunk_id}"))
            })?;
            record.embedding = Some(vector);
            record.processed = true;
        }
        Ok(())
    }

    fn get(&self, chunk_id: &str) -> Result<Option<ChunkRecord>> {
        Ok(self.lock_rows()?.get(chunk_id).cloned())
    }

    fn remove_source(&self, doc_id: &str) -> Result<usize> {
        let mut rows = self.lock_rows()?;
        let before = rows.len();
        rows.retain(|_, record| record.chunk.doc_id != doc_id);
        Ok(before - rows.len())
    }

    fn fingerprint_seen(&self, doc_id: &str, fingerprint: &str) -> Result<bool> {
        let seen = self.lock_fingerprints()?;
        Ok(seen.get(doc_id).map(|held| held == fingerprint).unwrap_or(false))
    }

    fn record_fingerprint(&self, doc_id: &str, fingerprint: &str) -> Result<()> {
        self.lock_fingerprints()?
            .insert(doc_id.to_string(), fingerprint.to_string());
        Ok(())
    }

    fn forget_fingerprint(&self, doc_id: &str) -> Result<()> {
        self.lock_fingerprints()?.remove(doc_id);
        Ok(())
    }

    fn processed_records(&self) -> Result<Vec<ChunkRecord>> {
        let rows = self.lock_rows()?;
        Ok(rows
            .values()
            .filter(|record| record.processed)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(doc: &str, position: usize) -> ChunkRecord {
        ChunkRecord {
            chunk: Chunk {
                id: format!("{doc}-{position}"),
                doc_id: doc.to_string(),
                position,
                text: format!("chunk {position} of {doc}"),
                token_count: 4,
                article_no: None,
                section_title: None,
                extra: BTreeMap::new(),
            },
            jurisdiction: None,
            doc_type: None,
            checksum: 0,
            embedding: None,
            processed: false,
        }
    }

    #[test]
    fn upsert_then_unprocessed_roundtrip() {
        let store = MemoryChunkStore::new();
        store
            .upsert_chunks(vec![record("doc", 0), record("doc", 1)])
            .unwrap();
        let pending = store.unprocessed(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].chunk.position, 0);
    }

    #[test]
    fn store_embeddings_marks_processed() {
        let store = MemoryChunkStore::new();
        store.upsert_chunks(vec![record("doc", 0)]).unwrap();
        let vector = crate::embedding::EmbeddedVector {
            vector: vec![1.0],
            mode: crate::embedding::EmbedMode::Fallback,
            model_id: "hash-v1".to_string(),
        };
        store
            .store_embeddings(vec![("doc-0".to_string(), vector)])
            .unwrap();
        assert!(store.unprocessed(10).unwrap().is_empty());
        assert!(store.get("doc-0").unwrap().unwrap().processed);
    }

    #[test]
    fn remove_source_cascades() {
        let store = MemoryChunkStore::new();
        store
            .upsert_chunks(vec![record("a", 0), record("a", 1), record("b", 0)])
            .unwrap();
        assert_eq!(store.remove_source("a").unwrap(), 2);
        assert!(store.get("a-0").unwrap().is_none());
        assert!(store.get("b-0").unwrap().is_some());
    }

    #[test]
    fn fingerprints_deduplicate_per_document() {
        let store = MemoryChunkStore::new();
        assert!(!store.fingerprint_seen("doc", "abc").unwrap());
        store.record_fingerprint("doc", "abc").unwrap();
        assert!(store.fingerprint_seen("doc", "abc").unwrap());
        assert!(!store.fingerprint_seen("doc", "def").unwrap());
        assert!(!store.fingerprint_seen("other", "abc").unwrap());
    }

    #[test]
    fn forgotten_fingerprint_clears_the_duplicate_check() {
        let store = MemoryChunkStore::new();
        store.record_fingerprint("doc", "abc").unwrap();
        store.forget_fingerprint("doc").unwrap();
        assert!(!store.fingerprint_seen("doc", "abc").unwrap());
    }
}
