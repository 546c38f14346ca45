//! Text normalization shared by the embedding engine and lexical scoring.
//!
//! Normalization runs before hashing or model inference so that identical
//! surface variants map to identical vectors. Legal corpora mix Latin and
//! Arabic script; vowel marks and interchangeable alef forms are folded,
//! while letterforms that change word meaning (ة, ى) are preserved.

use std::collections::BTreeSet;

use unicode_normalization::UnicodeNormalization;

/// Arabic tatweel (kashida), purely typographic.
const TATWEEL: char = '\u{0640}';

/// Returns true for combining marks that carry no lexical meaning here:
/// general combining diacritics plus the Arabic harakat range and the
/// superscript alef.
fn is_strippable_mark(ch: char) -> bool {
    matches!(ch,
        '\u{0300}'..='\u{036F}'
        | '\u{064B}'..='\u{0652}'
        | '\u{0670}'
        | '\u{06D6}'..='\u{06ED}'
    )
}

/// Folds interchangeable letter variants onto a canonical form.
fn fold_letter(ch: char) -> Option<char> {
    match ch {
        // Alef with hamza/madda/wasla variants collapse onto bare alef.
        '\u{0622}' | '\u{0623}' | '\u{0625}' | '\u{0671}' => Some('\u{0627}'),
        TATWEEL => None,
        _ => Some(ch),
    }
}

/// Canonical form of a text for embedding and caching.
///
/// NFKD-decomposes, strips vowel marks/diacritics, unifies alef variants,
/// lowercases ASCII, and collapses whitespace runs to single spaces.
pub fn normalize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for ch in input.nfkd() {
        if is_strippable_mark(ch) {
            continue;
        }
        let Some(folded) = fold_letter(ch) else {
            continue;
        };
        if folded.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(folded.to_ascii_lowercase());
    }
    out
}

/// Token set used for lexical (Jaccard) scoring. Tokens shorter than two
/// characters are noise in both scripts and are dropped.
pub fn token_set(text: &str) -> BTreeSet<String> {
    normalize_text(text)
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|tok| tok.chars().count() >= 2)
        .map(str::to_string)
        .collect()
}

/// Jaccard overlap between two token sets, in [0, 1].
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    if union == 0 {
        0.0
    } else {
        inter as f32 / union as f32
    }
}
