//! Text helpers shared by the extractive summarizer and the tier manager

pub mod text_utils;
pub mod topic_extractor;

pub use text_utils::TextUtils;
pub use topic_extractor::TopicExtractor;
