//! Splits raw legal text into bounded, structurally-aware chunks.
//!
//! Chunks are the retrieval granularity: paragraphs are split into
//! sentences, sentences accumulate until a target token count is reached, a
//! maximum is about to be exceeded, or an article/section marker starts a
//! new structural unit. A bounded number of trailing sentences carries over
//! between adjacent chunks to preserve context continuity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A bounded unit of source text emitted by the segmenter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable chunk identifier, `{doc_id}-{position}`.
    pub id: String,
    /// Owning source document.
    pub doc_id: String,
    /// Ordered position within the document.
    pub position: usize,
    /// Chunk body text.
    pub text: String,
    /// Whitespace-token count of `text`.
    pub token_count: usize,
    /// Article number detected at the chunk's structural boundary, if any.
    pub article_no: Option<u32>,
    /// Section or chapter title in scope for this chunk, if any.
    pub section_title: Option<String>,
    /// Explicit extension map for forward-compatible metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Segmentation tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    /// Minimum tokens before a structural boundary may close a chunk.
    pub min_tokens: usize,
    /// Token count at which a chunk is flushed.
    pub target_tokens: usize,
    /// Hard cap; a chunk never exceeds this many tokens.
    pub max_tokens: usize,
    /// Trailing sentences carried into the next chunk.
    pub overlap_sentences: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_tokens: 40,
            target_tokens: 220,
            max_tokens: 320,
            overlap_sentences: 2,
        }
    }
}

/// Stateless text segmentation service.
#[derive(Debug, Clone)]
pub struct Segmenter {
    config: SegmenterConfig,
}

/// Structural marker detected at a paragraph boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    Article(u32),
    Section(String),
}

impl Segmenter {
    /// Builds a segmenter with the given bounds.
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    /// Returns the underlying config reference.
    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Segments raw text into ordered chunks. Empty input yields zero
    /// chunks; the final chunk of a document may be under-sized.
    pub fn segment(&self, doc_id: &str, text: &str) -> Vec<Chunk> {
        let mut builder = ChunkBuilder::new(doc_id, &self.config);
        for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            match detect_marker(paragraph) {
                Some(Marker::Article(no)) => builder.structural_boundary(|b| b.article_no = Some(no)),
                Some(Marker::Section(title)) => {
                    builder.structural_boundary(|b| b.section_title = Some(title))
                }
                None => {}
            }
            for sentence in split_sentences(paragraph) {
                builder.push_sentence(sentence, &self.config);
            }
        }
        builder.finish()
    }
}

struct ChunkBuilder {
    doc_id: String,
    overlap_sentences: usize,
    /// Sentences buffered for the chunk under construction, with per-sentence
    /// token counts so overlap retention stays cheap.
    buffer: Vec<(String, usize)>,
    token_total: usize,
    /// Leading sentences of `buffer` that were carried from the prior chunk.
    carried: usize,
    min_tokens: usize,
    chunks: Vec<Chunk>,
    article_no: Option<u32>,
    section_title: Option<String>,
}

impl ChunkBuilder {
    fn new(doc_id: &str, config: &SegmenterConfig) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            overlap_sentences: config.overlap_sentences,
            buffer: Vec::new(),
            token_total: 0,
            carried: 0,
            min_tokens: config.min_tokens,
            chunks: Vec::new(),
            article_no: None,
            section_title: None,
        }
    }

    /// Closes the current chunk (without overlap carry) once it has reached
    /// the minimum size, then applies the tag update. An under-sized head
    /// merges into the new structural unit instead of forming a fragment.
    fn structural_boundary(&mut self, apply: impl FnOnce(&mut Self)) {
        if !self.buffer.is_empty() && self.token_total >= self.min_tokens {
            self.flush(false);
        }
        apply(self);
    }

    fn push_sentence(&mut self, sentence: &str, config: &SegmenterConfig) {
        let tokens = count_tokens(sentence);
        if tokens > config.max_tokens {
            // A single oversized sentence is split at word boundaries.
            for piece in split_words(sentence, config.max_tokens) {
                let piece_tokens = count_tokens(&piece);
                self.push_bounded(piece, piece_tokens, config);
            }
            return;
        }
        self.push_bounded(sentence.to_string(), tokens, config);
    }

    fn push_bounded(&mut self, sentence: String, tokens: usize, config: &SegmenterConfig) {
        if self.token_total + tokens > config.max_tokens && !self.buffer.is_empty() {
            if self.token_total < self.min_tokens {
                // An under-sized head must not close as its own chunk. Top
                // it up with the leading words of the incoming sentence,
                // close at the cap, and push the remainder through again.
                let room = config.max_tokens.saturating_sub(self.token_total).max(1);
                let words: Vec<&str> = sentence.split_whitespace().collect();
                let split_at = room.min(words.len());
                let (head, rest) = words.split_at(split_at);
                self.buffer.push((head.join(" "), head.len()));
                self.token_total += head.len();
                self.flush(false);
                if !rest.is_empty() {
                    let rest_tokens = rest.len();
                    self.push_bounded(rest.join(" "), rest_tokens, config);
                }
                return;
            }
            self.flush(true);
        }
        self.buffer.push((sentence, tokens));
        self.token_total += tokens;
        if self.token_total >= config.target_tokens {
            self.flush(true);
        }
    }

    fn flush(&mut self, carry_overlap: bool) {
        if self.buffer.is_empty() {
            return;
        }
        // A buffer holding nothing but carried overlap would re-emit the
        // previous chunk's tail.
        if self.buffer.len() <= self.carried {
            self.buffer.clear();
            self.token_total = 0;
            self.carried = 0;
            return;
        }
        let text = self
            .buffer
            .iter()
            .map(|(s, _)| s.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let token_count = self.buffer.iter().map(|(_, t)| *t).sum();
        let position = self.chunks.len();
        self.chunks.push(Chunk {
            id: format!("{}-{}", self.doc_id, position),
            doc_id: self.doc_id.clone(),
            position,
            text,
            token_count,
            article_no: self.article_no,
            section_title: self.section_title.clone(),
            extra: BTreeMap::new(),
        });

        if carry_overlap && self.overlap_sentences > 0 {
            let keep_from = self.buffer.len().saturating_sub(self.overlap_sentences);
            self.buffer.drain(..keep_from);
            self.token_total = self.buffer.iter().map(|(_, t)| *t).sum();
            self.carried = self.buffer.len();
        } else {
            self.buffer.clear();
            self.token_total = 0;
            self.carried = 0;
        }
    }

    fn finish(mut self) -> Vec<Chunk> {
        // Overlap-only residue would duplicate the previous chunk's tail.
        if self.buffer.len() > self.carried {
            self.flush(false);
        }
        self.chunks
    }
}

/// Sentence terminators across the scripts in the corpus.
fn is_terminator(ch: char) -> bool {
    matches!(ch, '.' | '!' | '?' | '؟' | '۔' | '؛')
}

fn split_sentences(paragraph: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut prev_terminator = false;
    for (idx, ch) in paragraph.char_indices() {
        if prev_terminator && ch.is_whitespace() {
            let sentence = paragraph[start..idx].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = idx;
        }
        prev_terminator = is_terminator(ch);
    }
    let tail = paragraph[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn split_words(sentence: &str, max_tokens: usize) -> Vec<String> {
    let words: Vec<&str> = sentence.split_whitespace().collect();
    words
        .chunks(max_tokens.max(1))
        .map(|piece| piece.join(" "))
        .collect()
}

fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Recognizes `Article <n>` / `Art. <n>` / `المادة <n>` and
/// `Section|Chapter <title>` / `باب|فصل <title>` at a paragraph start.
/// Malformed markers (no number, empty title) are ignored and the paragraph
/// proceeds as plain text.
fn detect_marker(paragraph: &str) -> Option<Marker> {
    let first_line = paragraph.lines().next()?.trim();
    let mut words = first_line.split_whitespace();
    let head = words.next()?;
    let rest = first_line[head.len()..].trim();

    let head_lower = head.to_lowercase();
    if matches!(head_lower.as_str(), "article" | "art." | "المادة" | "مادة") {
        let digits: String = rest
            .chars()
            .take_while(|ch| ch.is_ascii_digit())
            .collect();
        return digits.parse::<u32>().ok().map(Marker::Article);
    }
    if matches!(head_lower.as_str(), "section" | "chapter" | "باب" | "فصل") {
        let title = rest.trim_matches(|ch: char| ch == ':' || ch == '-').trim();
        if title.is_empty() {
            return None;
        }
        return Some(Marker::Section(title.to_string()));
    }
    None
}
