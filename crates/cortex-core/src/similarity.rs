//! Tokenization, Jaccard similarity, and key-phrase extraction.
//!
//! Pure functions, no I/O — used by both the `store` insert path (auto-link
//! candidate scoring) and `consolidation` (merge clustering).

use std::collections::BTreeSet;

/// A fixed lexicon of technology terms recognized during key-phrase extraction,
/// regardless of capitalization.
const TECH_LEXICON: &[&str] = &[
    "api", "sql", "http", "https", "json", "rest", "graphql", "docker", "kubernetes",
    "postgres", "postgresql", "mysql", "sqlite", "redis", "kafka", "grpc", "oauth",
    "jwt", "tcp", "udp", "dns", "cli", "sdk", "ci", "cd", "git", "github", "gitlab",
    "rust", "python", "typescript", "javascript", "golang", "java", "webassembly",
];

/// Lowercase, strip punctuation, split on whitespace, drop tokens of length <= 2.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() > 2)
        .collect()
}

/// Jaccard similarity of two raw texts (tokenizes both internally).
///
/// `jaccard("", "") == 1.0` (two empty sets are defined as identical);
/// `jaccard(x, "") == 0.0` for any non-empty `x`.
pub fn jaccard(a: &str, b: &str) -> f64 {
    jaccard_sets(&tokenize(a), &tokenize(b))
}

/// Jaccard similarity of two pre-tokenized sets; avoids re-tokenizing in hot
/// O(n^2) loops (consolidation's merge clustering, auto-link candidate scoring).
pub fn jaccard_sets(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Extract candidate key phrases: quoted phrases, backticked terms,
/// capitalized identifiers, and known technology terms.
pub fn extract_key_phrases(text: &str) -> BTreeSet<String> {
    let mut phrases = BTreeSet::new();

    for quoted in extract_delimited(text, '"', '"') {
        phrases.insert(quoted);
    }
    for backticked in extract_delimited(text, '`', '`') {
        phrases.insert(backticked);
    }

    for word in text.split_whitespace() {
        let trimmed: String = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_string();
        if trimmed.is_empty() {
            continue;
        }
        if is_capitalized_identifier(&trimmed) {
            phrases.insert(trimmed.clone());
        }
        if TECH_LEXICON.contains(&trimmed.to_lowercase().as_str()) {
            phrases.insert(trimmed.to_lowercase());
        }
    }

    phrases
}

fn is_capitalized_identifier(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) if c.is_uppercase() => word.len() > 1 && word.chars().skip(1).any(|c| c.is_alphabetic()),
        _ => false,
    }
}

/// Collect substrings delimited by `open`/`close` (non-overlapping, non-nested).
fn extract_delimited(text: &str, open: char, close: char) -> Vec<String> {
    let mut result = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c == open {
            let rest = &text[start + c.len_utf8()..];
            if let Some(end) = rest.find(close) {
                let phrase = &rest[..end];
                if !phrase.is_empty() && phrase.len() < 80 {
                    result.push(phrase.to_string());
                }
                // Skip past the closing delimiter.
                let skip_to = start + c.len_utf8() + end + close.len_utf8();
                while let Some(&(idx, _)) = chars.peek() {
                    if idx < skip_to {
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
        }
    }
    result
}
