//! Small text helpers

use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
    static ref SENTENCE_END_REGEX: Regex = Regex::new(r"[.!?]+(\s+|$)").unwrap();
}

pub struct TextUtils;

impl TextUtils {
    /// Collapse runs of whitespace into single spaces
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        let normalized = WHITESPACE_REGEX.replace_all(text.trim(), " ");
        if normalized == text {
            Cow::Borrowed(text)
        } else {
            Cow::Owned(normalized.into_owned())
        }
    }

    /// Cut to at most `max_chars` characters, ending in "..." when shortened
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            return Cow::Borrowed(text);
        }
        if max_chars <= 3 {
            return Cow::Borrowed("...");
        }
        let kept: String = text.chars().take(max_chars - 3).collect();
        Cow::Owned(format!("{}...", kept.trim_end()))
    }

    /// Sentences of a text, trimmed, empty ones dropped
    pub fn sentences(text: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut start = 0;
        for m in SENTENCE_END_REGEX.find_iter(text) {
            let sentence = text[start..m.end()].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = m.end();
        }
        let tail = text[start..].trim();
        if !tail.is_empty() {
            out.push(tail);
        }
        out
    }

    pub fn first_sentence(text: &str) -> &str {
        Self::sentences(text).into_iter().next().unwrap_or("")
    }
}
