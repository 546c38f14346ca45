//! Ingestion boundary: validates structured documents, segments them,
//! embeds the chunks, and commits incrementally to the store and index.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::embedding::EmbeddingEngine;
use crate::error::{LexragError, Result};
use crate::index::{IndexEntry, SimilarityIndex};
use crate::segmenter::Segmenter;
use crate::store::{ChunkRecord, ChunkStore};

/// Document metadata required at the ingestion boundary. `name`,
/// `doc_type`, and `jurisdiction` must be present and non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Human-readable document name; also the basis of the document id.
    pub name: String,
    /// Document type (law, regulation, decree, ...).
    pub doc_type: String,
    /// Issuing jurisdiction.
    pub jurisdiction: String,
    /// Issuing authority, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuing_authority: Option<String>,
    /// Date of issue (ISO 8601 string, opaque to the core).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_on: Option<String>,
    /// Date the text takes effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<String>,
}

/// One article of legal text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    /// Article number, when the source carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    /// Article body text.
    pub text: String,
}

/// A chapter grouping articles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    /// Chapter title.
    pub title: String,
    /// Contained articles.
    pub articles: Vec<Article>,
}

/// A branch grouping chapters (source → branches → chapters → articles).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Branch title.
    pub title: String,
    /// Contained chapters.
    pub chapters: Vec<Chapter>,
}

/// Document body: hierarchical or a flat article list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentBody {
    /// source → branches → chapters → articles.
    Hierarchical(Vec<Branch>),
    /// Plain ordered article list.
    Flat(Vec<Article>),
}

/// A structured document presented for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestDocument {
    /// Required metadata.
    pub metadata: DocumentMetadata,
    /// Structured text body.
    pub body: DocumentBody,
}

impl IngestDocument {
    /// Rejects structurally invalid documents before any chunk is created.
    pub fn validate(&self) -> Result<()> {
        let meta = &self.metadata;
        for (field, value) in [
            ("name", &meta.name),
            ("doc_type", &meta.doc_type),
            ("jurisdiction", &meta.jurisdiction),
        ] {
            if value.trim().is_empty() {
                return Err(LexragError::Validation(format!(
                    "missing required metadata key '{field}'"
                )));
            }
        }
        if self.flatten().trim().is_empty() {
            return Err(LexragError::Validation(
                "document body contains no text".to_string(),
            ));
        }
        Ok(())
    }

    /// Renders the structured body as marker-annotated plain text so the
    /// segmenter can pick up article/section boundaries.
    pub fn flatten(&self) -> String {
        let mut out = String::new();
        match &self.body {
            DocumentBody::Flat(articles) => push_articles(&mut out, articles),
            DocumentBody::Hierarchical(branches) => {
                for branch in branches {
                    push_paragraph(&mut out, &format!("Section {}", branch.title.trim()));
                    for chapter in &branch.chapters {
                        push_paragraph(&mut out, &format!("Chapter {}", chapter.title.trim()));
                        push_articles(&mut out, &chapter.articles);
                    }
                }
            }
        }
        out
    }

    /// Stable document identifier derived from the name.
    pub fn doc_id(&self) -> String {
        slug(&self.metadata.name)
    }

    /// SHA-256 hex fingerprint of the flattened text, used for idempotent
    /// re-ingestion.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.flatten().as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn push_articles(out: &mut String, articles: &[Article]) {
    for article in articles {
        if let Some(number) = article.number {
            push_paragraph(out, &format!("Article {number}"));
        }
        push_paragraph(out, article.text.trim());
    }
}

fn push_paragraph(out: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(text);
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

/// Outcome of one document ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    /// Document identifier.
    pub doc_id: String,
    /// Chunks created and committed.
    pub chunks_created: usize,
    /// Chunks lost to failed batches (retried once, then skipped).
    pub chunks_failed: usize,
    /// True when the document was a byte-identical duplicate and nothing
    /// was ingested.
    pub duplicate: bool,
}

/// Ingestion pipeline: single writer over the store and index.
pub struct Ingestor {
    store: Arc<dyn ChunkStore>,
    engine: Arc<EmbeddingEngine>,
    index: Arc<RwLock<SimilarityIndex>>,
    segmenter: Segmenter,
    /// Chunks per commit batch; a mid-document failure loses at most the
    /// uncommitted tail of one batch.
    commit_every: usize,
}

impl Ingestor {
    /// Builds the pipeline around shared collaborators.
    pub fn new(
        store: Arc<dyn ChunkStore>,
        engine: Arc<EmbeddingEngine>,
        index: Arc<RwLock<SimilarityIndex>>,
        segmenter: Segmenter,
        commit_every: usize,
    ) -> Self {
        Self {
            store,
            engine,
            index,
            segmenter,
            commit_every: commit_every.max(1),
        }
    }

    /// Ingests one document end to end. Structural problems reject the
    /// whole document; batch-level persistence problems are retried once,
    /// then skipped and counted.
    pub fn ingest(&self, document: &IngestDocument) -> Result<IngestReport> {
        document.validate()?;
        let doc_id = document.doc_id();
        let fingerprint = document.fingerprint();
        if self.store.fingerprint_seen(&doc_id, &fingerprint)? {
            info!(doc_id, "duplicate document fingerprint; skipping ingestion");
            return Ok(IngestReport {
                doc_id,
                chunks_created: 0,
                chunks_failed: 0,
                duplicate: true,
            });
        }

        let text = document.flatten();
        let chunks = self.segmenter.segment(&doc_id, &text);
        let mut created = 0usize;
        let mut failed = 0usize;

        for batch in chunks.chunks(self.commit_every) {
            match self.commit_batch(document, batch) {
                Ok(count) => created += count,
                Err(first_err) => {
                    warn!(doc_id, error = %first_err, "batch commit failed; retrying once");
                    match self.commit_batch(document, batch) {
                        Ok(count) => created += count,
                        Err(second_err) => {
                            warn!(doc_id, error = %second_err, "batch commit failed twice; skipping");
                            failed += batch.len();
                        }
                    }
                }
            }
        }

        if failed == 0 {
            // Only a fully-committed document counts as seen; a partial
            // ingest stays re-runnable.
            self.store.record_fingerprint(&doc_id, &fingerprint)?;
        }
        info!(doc_id, created, failed, "document ingested");
        Ok(IngestReport {
            doc_id,
            chunks_created: created,
            chunks_failed: failed,
            duplicate: false,
        })
    }

    fn commit_batch(
        &self,
        document: &IngestDocument,
        batch: &[crate::segmenter::Chunk],
    ) -> Result<usize> {
        let records: Vec<ChunkRecord> = batch
            .iter()
            .map(|chunk| ChunkRecord {
                chunk: chunk.clone(),
                jurisdiction: Some(document.metadata.jurisdiction.clone()),
                doc_type: Some(document.metadata.doc_type.clone()),
                checksum: crc32fast::hash(chunk.text.as_bytes()),
                embedding: None,
                processed: false,
            })
            .collect();
        self.store.upsert_chunks(records.clone())?;

        let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = self.engine.embed_batch(&texts);
        let writes: Vec<(String, crate::embedding::EmbeddedVector)> = batch
            .iter()
            .zip(vectors.iter())
            .map(|(chunk, vector)| (chunk.id.clone(), vector.clone()))
            .collect();
        self.store.store_embeddings(writes)?;

        let mut index = self
            .index
            .write()
            .map_err(|_| LexragError::Persistence("index lock poisoned".to_string()))?;
        let model_id = self.engine.model_id();
        for (record, vector) in records.iter().zip(vectors.iter()) {
            index.insert(
                IndexEntry {
                    chunk_id: record.chunk.id.clone(),
                    source_id: record.chunk.doc_id.clone(),
                    jurisdiction: record.jurisdiction.clone(),
                    doc_type: record.doc_type.clone(),
                    vector: vector.vector.clone(),
                },
                &model_id,
            );
        }
        Ok(batch.len())
    }

    /// Removes a source document; its chunks cascade out of the store and
    /// the index, and its fingerprint is dropped so the document can be
    /// ingested again later.
    pub fn remove_document(&self, doc_id: &str) -> Result<usize> {
        let removed = self.store.remove_source(doc_id)?;
        self.store.forget_fingerprint(doc_id)?;
        let mut index = self
            .index
            .write()
            .map_err(|_| LexragError::Persistence("index lock poisoned".to_string()))?;
        index.remove_source(doc_id);
        info!(doc_id, removed, "document removed");
        Ok(removed)
    }

    /// Explicit administrative rebuild: re-embeds rows from stale model
    /// generations, writes the vectors back, and swaps the whole index.
    pub fn rebuild_index(&self) -> Result<usize> {
        let model_id = self.engine.model_id();
        let mut records = self.store.processed_records()?;

        let stale: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, record)| {
                record
                    .embedding
                    .as_ref()
                    .map(|held| held.model_id != model_id)
                    .unwrap_or(true)
            })
            .map(|(idx, _)| idx)
            .collect();
        if !stale.is_empty() {
            let texts: Vec<String> = stale
                .iter()
                .map(|&idx| records[idx].chunk.text.clone())
                .collect();
            let vectors = self.engine.embed_batch(&texts);
            let mut writes = Vec::with_capacity(stale.len());
            for (&idx, vector) in stale.iter().zip(vectors.into_iter()) {
                records[idx].embedding = Some(vector.clone());
                writes.push((records[idx].chunk.id.clone(), vector));
            }
            self.store.store_embeddings(writes)?;
        }

        let entries: Vec<IndexEntry> = records
            .iter()
            .filter_map(|record| {
                record.embedding.as_ref().map(|embedded| IndexEntry {
                    chunk_id: record.chunk.id.clone(),
                    source_id: record.chunk.doc_id.clone(),
                    jurisdiction: record.jurisdiction.clone(),
                    doc_type: record.doc_type.clone(),
                    vector: embedded.vector.clone(),
                })
            })
            .collect();
        let count = entries.len();
        let mut index = self
            .index
            .write()
            .map_err(|_| LexragError::Persistence("index lock poisoned".to_string()))?;
        index.rebuild(entries, &model_id);
        info!(count, model_id, "index rebuilt");
        Ok(count)
    }
}
