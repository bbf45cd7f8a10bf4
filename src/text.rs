//! Message text preparation for the annotation backends.

use regex::Regex;
use std::sync::OnceLock;

/// Service notices are only recognised when this short.
const SERVICE_POST_MAX_CHARS: usize = 32;

const SERVICE_PATTERNS: &[&str] = &[
    "live stream started",
    "стрим начался",
    "прямая трансляция",
    "эфир начался",
    "подключайтесь к трансляции",
    "прямой эфир",
];

/// Share of the tagging budget kept from the start of the text.
const HEAD_SHARE: f64 = 0.7;

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Short "stream started" style notices carry nothing worth tagging.
pub fn is_service_post(text: &str) -> bool {
    let cleaned = collapse_whitespace(text).to_lowercase();
    if cleaned.is_empty() || cleaned.chars().count() > SERVICE_POST_MAX_CHARS {
        return false;
    }
    SERVICE_PATTERNS.iter().any(|p| cleaned.contains(p))
}

/// Hashtags, currency pairs and upper-case tickers found in the text.
///
/// Passed to the tagger as hints and used verbatim when it returns no
/// tags. Order of first appearance, no duplicates.
pub fn extract_candidates(text: &str) -> Vec<String> {
    static HASHTAG: OnceLock<Regex> = OnceLock::new();
    static PAIR: OnceLock<Regex> = OnceLock::new();
    static TICKER: OnceLock<Regex> = OnceLock::new();

    let hashtag = HASHTAG.get_or_init(|| Regex::new(r"#([\w\-]+)").expect("valid regex"));
    let pair = PAIR.get_or_init(|| Regex::new(r"\b[A-Z]{2,5}/[A-Z]{2,5}\b").expect("valid regex"));
    let ticker = TICKER.get_or_init(|| Regex::new(r"\b[A-Z0-9]{3,}\b").expect("valid regex"));

    let mut out: Vec<String> = Vec::new();
    let mut push = |s: &str| {
        if !s.is_empty() && !out.iter().any(|o| o == s) {
            out.push(s.to_string());
        }
    };

    for cap in hashtag.captures_iter(text) {
        if let Some(m) = cap.get(1) {
            push(m.as_str());
        }
    }
    for m in pair.find_iter(text) {
        push(m.as_str());
    }
    for m in ticker.find_iter(text) {
        // Bare numbers are not tickers.
        if m.as_str().chars().any(|c| c.is_ascii_alphabetic()) {
            push(m.as_str());
        }
    }

    out
}

/// Collapse whitespace and fit the text into `max_chars`.
///
/// Long texts keep their head and tail joined by ` ... `, since posts
/// often end with the conclusion.
pub fn prepare_for_tagging(text: &str, max_chars: usize) -> String {
    let cleaned = collapse_whitespace(text);
    let len = cleaned.chars().count();
    if max_chars == 0 || len <= max_chars {
        return cleaned;
    }

    let head = (max_chars as f64 * HEAD_SHARE) as usize;
    let tail = max_chars - head;
    let head_part: String = cleaned.chars().take(head).collect();
    let tail_part: String = cleaned.chars().skip(len - tail).collect();
    format!("{} ... {}", head_part, tail_part)
}

/// Truncate to at most `max_chars` characters.
pub fn prepare_for_embedding(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if max_chars == 0 {
        return trimmed.to_string();
    }
    trimmed.chars().take(max_chars).collect()
}

/// Whitespace-separated word count.
pub fn word_count(text: &str) -> i64 {
    text.split_whitespace().count() as i64
}
