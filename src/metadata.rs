//! Lightweight text analysis attached to indexed content.
//!
//! Produces counts, a coarse language guess, the most frequent non-stopword
//! keywords, and regex-detected entities (emails, URLs, dates, numbers).

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Share of function words above which text is tagged `en`.
const ENGLISH_THRESHOLD: f64 = 0.05;
/// Cap on each entity list.
const MAX_ENTITIES: usize = 50;

const ENGLISH_FUNCTION_WORDS: &[&str] = &[
    "the", "be", "to", "of", "and", "a", "an", "in", "that", "have", "has", "i", "it", "for",
    "not", "on", "with", "he", "she", "as", "you", "do", "at", "this", "but", "his", "her", "by",
    "from", "they", "we", "or", "will", "my", "all", "would", "there", "their", "is", "are",
    "was", "were", "been", "which", "what", "can", "if", "so",
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "his", "how", "its", "may", "new", "now", "see", "two",
    "who", "did", "get", "him", "let", "say", "she", "too", "use", "that", "with", "this", "from",
    "they", "will", "would", "there", "their", "what", "about", "which", "when", "were", "been",
    "into", "than", "then", "them", "these", "those", "some", "such", "only", "other", "also",
    "each", "more", "most", "very", "your", "just", "over", "after", "before", "where", "while",
    "because", "should", "could", "being", "does", "here",
];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TextMetadata {
    pub word_count: usize,
    pub sentence_count: usize,
    pub paragraph_count: usize,
    /// `"en"` or `"unknown"`.
    pub language: String,
    pub keywords: Vec<KeywordCount>,
    pub entities: Entities,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KeywordCount {
    pub word: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Entities {
    pub emails: Vec<String>,
    pub urls: Vec<String>,
    pub dates: Vec<String>,
    pub numbers: Vec<String>,
}

struct Patterns {
    word: Regex,
    sentence_end: Regex,
    paragraph_break: Regex,
    email: Regex,
    url: Regex,
    date: Regex,
    number: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("metadata pattern is valid");
        Patterns {
            word: re(r"[\p{L}\p{N}][\p{L}\p{N}'_-]*"),
            sentence_end: re(r"[.!?]+"),
            paragraph_break: re(r"\n\s*\n"),
            email: re(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
            url: re(r#"https?://[^\s<>"')\]]+"#),
            date: re(r"\b(?:\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{2,4})\b"),
            number: re(r"\b\d+(?:[.,]\d+)*\b"),
        }
    })
}

/// Analyze `text`, keeping at most `keyword_limit` keywords.
pub fn extract_metadata(text: &str, keyword_limit: usize) -> TextMetadata {
    let p = patterns();
    let words: Vec<String> = p
        .word
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect();

    TextMetadata {
        word_count: words.len(),
        sentence_count: count_segments(&p.sentence_end, text),
        paragraph_count: count_segments(&p.paragraph_break, text),
        language: detect_language(&words).to_string(),
        keywords: top_keywords(&words, keyword_limit),
        entities: Entities {
            emails: unique_matches(&p.email, text),
            urls: unique_matches(&p.url, text),
            dates: unique_matches(&p.date, text),
            numbers: unique_matches(&p.number, text),
        },
    }
}

fn count_segments(separator: &Regex, text: &str) -> usize {
    separator
        .split(text)
        .filter(|segment| !segment.trim().is_empty())
        .count()
}

fn detect_language(words: &[String]) -> &'static str {
    if words.is_empty() {
        return "unknown";
    }
    let hits = words
        .iter()
        .filter(|w| ENGLISH_FUNCTION_WORDS.contains(&w.as_str()))
        .count();
    if hits as f64 / words.len() as f64 > ENGLISH_THRESHOLD {
        "en"
    } else {
        "unknown"
    }
}

fn top_keywords(words: &[String], limit: usize) -> Vec<KeywordCount> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for word in words {
        if word.chars().count() < 3
            || STOPWORDS.contains(&word.as_str())
            || word.chars().all(|c| c.is_ascii_digit())
        {
            continue;
        }
        *counts.entry(word.as_str()).or_insert(0) += 1;
    }

    let mut ranked: Vec<KeywordCount> = counts
        .into_iter()
        .map(|(word, count)| KeywordCount {
            word: word.to_string(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
    ranked.truncate(limit);
    ranked
}

fn unique_matches(pattern: &Regex, text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for m in pattern.find_iter(text) {
        let value = m.as_str().trim_end_matches(['.', ',']).to_string();
        if !seen.contains(&value) {
            seen.push(value);
            if seen.len() >= MAX_ENTITIES {
                break;
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let text = "First sentence here. Second one!\n\nNew paragraph? Yes.";
        let meta = extract_metadata(text, 10);
        assert_eq!(meta.word_count, 8);
        assert_eq!(meta.sentence_count, 4);
        assert_eq!(meta.paragraph_count, 2);
    }

    #[test]
    fn test_detects_english() {
        let meta = extract_metadata("The cat sat on the mat and it was happy.", 10);
        assert_eq!(meta.language, "en");

        let meta = extract_metadata("Der Hund läuft schnell über die Straße.", 10);
        assert_eq!(meta.language, "unknown");

        assert_eq!(extract_metadata("", 10).language, "unknown");
    }

    #[test]
    fn test_keywords_rank_by_frequency_without_stopwords() {
        let text = "Rust rust RUST tokio tokio serde. The the the and and.";
        let meta = extract_metadata(text, 2);
        assert_eq!(
            meta.keywords,
            vec![
                KeywordCount {
                    word: "rust".into(),
                    count: 3
                },
                KeywordCount {
                    word: "tokio".into(),
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn test_entities() {
        let text = "Mail ops@example.com or see https://status.example.com/page. \
                    Outage on 2024-03-15 lasted 42 minutes, affecting 3.5 regions. \
                    Mail ops@example.com again.";
        let e = extract_metadata(text, 10).entities;
        assert_eq!(e.emails, vec!["ops@example.com"]);
        assert_eq!(e.urls, vec!["https://status.example.com/page"]);
        assert_eq!(e.dates, vec!["2024-03-15"]);
        assert!(e.numbers.contains(&"42".to_string()));
        assert!(e.numbers.contains(&"3.5".to_string()));
    }
}
