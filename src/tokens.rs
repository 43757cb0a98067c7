//! Token estimation
//!
//! A character-count heuristic (1 token ≈ 4 characters) used only for
//! admission control when building the outbound message list. The
//! [`TokenEstimator`] trait lets an exact tokenizer be swapped in without
//! touching the message builder.
//!
//! # Examples
//!
//! ```rust
//! use chat_pipeline::{CharRatioEstimator, TokenEstimator, estimate_tokens};
//!
//! assert_eq!(estimate_tokens("abcd"), 1);
//! assert_eq!(CharRatioEstimator::default().estimate("abcde"), 2);
//! ```

use crate::types::{WireContent, WireMessage};

/// Tokens charged per message for role formatting.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Flat charge per attached image. The payload bytes of a data URI say little
/// about its token cost, so they are not counted as text.
pub const IMAGE_TOKENS: usize = 85;

/// Approximates the token count of a piece of text.
///
/// Implementations must be deterministic and monotonic in text length.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// `ceil(chars / chars_per_token)`, counting Unicode scalar values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharRatioEstimator {
    chars_per_token: usize,
}

impl CharRatioEstimator {
    /// A ratio of zero is treated as one.
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

/// Estimate tokens for a piece of text with the default heuristic.
pub fn estimate_tokens(text: &str) -> usize {
    CharRatioEstimator::default().estimate(text)
}

/// Estimate tokens for one wire message, including role and image overhead.
pub fn estimate_message_tokens(estimator: &dyn TokenEstimator, message: &WireMessage) -> usize {
    let body = match &message.content {
        WireContent::Text(text) => estimator.estimate(text),
        content @ WireContent::Parts(_) => {
            estimator.estimate(&content.text()) + content.image_count() * IMAGE_TOKENS
        }
    };
    body + MESSAGE_OVERHEAD_TOKENS
}

/// Estimate tokens for a whole message list.
pub fn estimate_messages_tokens(estimator: &dyn TokenEstimator, messages: &[WireMessage]) -> usize {
    messages
        .iter()
        .map(|m| estimate_message_tokens(estimator, m))
        .sum()
}

/// Check if a message list is approaching a token limit
///
/// `true` if the estimate exceeds `limit * margin` (e.g. margin 0.9 = 90%).
pub fn is_approaching_limit(
    estimator: &dyn TokenEstimator,
    messages: &[WireMessage],
    limit: usize,
    margin: f32,
) -> bool {
    let estimated = estimate_messages_tokens(estimator, messages);
    let threshold = (limit as f32 * margin) as usize;
    estimated > threshold
}
