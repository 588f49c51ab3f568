//! Keyword topics, decisions and findings pulled out of message text

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

use super::text_utils::TextUtils;
use crate::memory::{Message, Role};

lazy_static! {
    static ref STOP_WORDS: Vec<&'static str> = vec![
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for",
        "of", "with", "by", "is", "am", "are", "was", "were", "be", "been",
        "being", "have", "has", "had", "do", "does", "did", "will", "would",
        "shall", "should", "may", "might", "must", "can", "could", "i", "you",
        "he", "she", "it", "we", "they", "me", "him", "her", "us", "them",
        "my", "your", "his", "its", "our", "their", "this", "that", "these",
        "those", "what", "how", "why", "when", "where", "which", "there",
        "then", "than", "just", "also", "some", "into", "from", "about", "like",
        "let", "lets", "need", "want", "use", "using", "get", "make", "sure",
        "yes", "okay", "thanks", "please",
    ];
    static ref WORD_REGEX: Regex = Regex::new(r"[A-Za-z][A-Za-z0-9_+#.-]*[A-Za-z0-9+#]|[A-Za-z]").unwrap();
    static ref DECISION_REGEX: Regex = Regex::new(
        r"(?i)\b(we decided|decided to|let's go with|going with|we will use|we'll use|agreed to|settled on|chose to)\b|\bdecision:"
    ).unwrap();
    static ref FINDING_REGEX: Regex = Regex::new(
        r"(?i)\b(found that|turns out|root cause|the issue was|the problem was|learned that|discovered|it appears that|fixed by)\b"
    ).unwrap();
}

/// Frequency-ranked keyword topics
pub struct TopicExtractor {
    max_topics: usize,
    min_word_length: usize,
}

impl Default for TopicExtractor {
    fn default() -> Self {
        Self {
            max_topics: 5,
            min_word_length: 4,
        }
    }
}

impl TopicExtractor {
    pub fn new(max_topics: usize, min_word_length: usize) -> Self {
        Self {
            max_topics,
            min_word_length,
        }
    }

    pub fn extract_from_text(&self, text: &str) -> Vec<String> {
        self.rank(std::iter::once(text))
    }

    /// Topics over a message range; system prompts are skipped
    pub fn extract_from_messages(&self, messages: &[Message]) -> Vec<String> {
        self.rank(
            messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| m.content.as_str()),
        )
    }

    fn rank<'a>(&self, texts: impl Iterator<Item = &'a str>) -> Vec<String> {
        // word -> (count, first position)
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        let mut position = 0usize;
        for text in texts {
            for m in WORD_REGEX.find_iter(text) {
                let word = m.as_str().to_lowercase();
                position += 1;
                if word.chars().count() < self.min_word_length || Self::is_stop_word(&word) {
                    continue;
                }
                let entry = counts.entry(word).or_insert((0, position));
                entry.0 += 1;
            }
        }

        let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
        ranked
            .into_iter()
            .take(self.max_topics)
            .map(|(word, _)| word)
            .collect()
    }

    pub fn is_stop_word(word: &str) -> bool {
        STOP_WORDS.contains(&word.to_lowercase().as_str())
    }
}

/// Sentences that record a choice
pub fn extract_decisions(messages: &[Message]) -> Vec<String> {
    matching_sentences(messages, &DECISION_REGEX)
}

/// Sentences that record something learned or diagnosed
pub fn extract_findings(messages: &[Message]) -> Vec<String> {
    matching_sentences(messages, &FINDING_REGEX)
}

fn matching_sentences(messages: &[Message], pattern: &Regex) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for message in messages.iter().filter(|m| m.role != Role::System) {
        for sentence in TextUtils::sentences(&message.content) {
            if pattern.is_match(sentence) {
                let cleaned = TextUtils::truncate_with_ellipsis(sentence, 200).into_owned();
                if !out.contains(&cleaned) {
                    out.push(cleaned);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_ranked_by_frequency() {
        let extractor = TopicExtractor::new(2, 4);
        let messages = vec![
            Message::user("The database migration failed on the database server"),
            Message::assistant("Run the migration again after fixing the database schema"),
        ];
        let topics = extractor.extract_from_messages(&messages);
        assert_eq!(topics, vec!["database".to_string(), "migration".to_string()]);
    }

    #[test]
    fn test_system_messages_ignored() {
        let extractor = TopicExtractor::default();
        let topics = extractor.extract_from_messages(&[Message::system("kubernetes kubernetes kubernetes")]);
        assert!(topics.is_empty());
    }

    #[test]
    fn test_stop_words_filtered() {
        assert!(TopicExtractor::is_stop_word("Would"));
        assert!(!TopicExtractor::is_stop_word("postgres"));
    }

    #[test]
    fn test_decisions_and_findings() {
        let messages = vec![
            Message::user("Should we use Postgres or SQLite?"),
            Message::assistant("We decided to use SQLite for the local cache. It turns out the lock was held by the writer."),
        ];
        let decisions = extract_decisions(&messages);
        let findings = extract_findings(&messages);
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].starts_with("We decided"));
        assert_eq!(findings.len(), 1);
        assert!(findings[0].contains("turns out"));
    }
}
