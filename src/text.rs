//! Keyword extraction shared by ranking and the hashing embedder
//!
//! Questions, keyword lists and aliases all go through the same pipeline:
//! Unicode word segmentation, snake_case splitting, lowercasing, stop-word
//! removal and a light suffix stemmer. Both sides of every comparison use it,
//! so consistency matters more than linguistic precision.

use std::collections::HashSet;
use unicode_segmentation::UnicodeSegmentation;

const STOP_WORDS: &[&str] = &[
    "a", "all", "an", "and", "any", "are", "as", "at", "be", "by", "did", "do", "does", "each",
    "for", "from", "give", "had", "has", "have", "how", "in", "into", "is", "it", "its", "list",
    "me", "of", "on", "or", "show", "that", "the", "their", "there", "these", "this", "those",
    "to", "was", "were", "what", "when", "where", "which", "who", "whose", "with",
];

fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.binary_search(&word).is_ok()
}

/// Lowercased words with snake_case identifiers split apart and stop words removed
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .flat_map(|w| w.split('_'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() >= 2 && !is_stop_word(w))
        .collect()
}

/// Strip common English inflections
pub fn stem(word: &str) -> String {
    let w = word.to_lowercase();
    if !w.is_ascii() || w.len() <= 3 {
        return w;
    }

    if let Some(base) = w.strip_suffix("ies") {
        if base.len() >= 2 {
            return format!("{}y", base);
        }
    }
    if let Some(base) = w.strip_suffix("sses") {
        return format!("{}ss", base);
    }
    if let Some(base) = w.strip_suffix("ing") {
        if base.len() >= 3 {
            return base.to_string();
        }
    }
    if let Some(base) = w.strip_suffix("ed") {
        if base.len() >= 3 {
            return base.to_string();
        }
    }
    if w.ends_with('s') && !w.ends_with("ss") && !w.ends_with("us") && !w.ends_with("is") {
        return w[..w.len() - 1].to_string();
    }
    w
}

/// Stemmed terms of `text`, deduplicated in first-seen order
pub fn terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .map(|t| stem(&t))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Union of stemmed terms over several phrases (keywords, aliases, names)
pub fn term_set<'a, I>(phrases: I) -> HashSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    phrases.into_iter().flat_map(terms).collect()
}

/// Fraction of `question_terms` present in `candidate`; zero for an empty question
pub fn overlap_ratio(question_terms: &[String], candidate: &HashSet<String>) -> f32 {
    if question_terms.is_empty() {
        return 0.0;
    }
    let hits = question_terms
        .iter()
        .filter(|t| candidate.contains(t.as_str()))
        .count();
    hits as f32 / question_terms.len() as f32
}

/// Split a comma-separated ingest field (`aliases`, `keywords`)
pub fn split_list(field: &str) -> Vec<String> {
    field
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
