//! Context window management
//!
//! Turns a system prompt and an unbounded conversation history into the
//! size-bounded list of [`WireMessage`]s sent to the endpoint.
//!
//! # Rules
//!
//! - The system message always comes first, even when it alone exceeds the
//!   budget (in which case it is sent alone).
//! - Only the most recent `user` turn keeps its photos; earlier turns are
//!   rendered as plain text.
//! - History is admitted newest-first while the running estimate stays within
//!   the budget; the first turn that does not fit ends admission, so older
//!   turns are the ones dropped. Chronological order is preserved.
//!
//! # Examples
//!
//! ```rust
//! use chat_pipeline::{ConversationMessage, build_messages};
//!
//! let history = vec![
//!     ConversationMessage::user("Hi"),
//!     ConversationMessage::assistant("Hello! How can I help?"),
//!     ConversationMessage::user("Explain borrowing"),
//! ];
//!
//! let messages = build_messages("You are a tutor", &history, 8_000);
//! assert_eq!(messages.len(), 4);
//! ```

use crate::config::DEFAULT_CONTEXT_BUDGET;
use crate::tokens::{CharRatioEstimator, TokenEstimator, estimate_message_tokens};
use crate::types::{ContentPart, ConversationMessage, ConversationRole, WireContent, WireMessage};
use std::sync::Arc;

/// Builds bounded message lists with a pluggable estimator.
#[derive(Clone)]
pub struct MessageBuilder {
    estimator: Arc<dyn TokenEstimator>,
    budget: usize,
}

impl std::fmt::Debug for MessageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuilder")
            .field("budget", &self.budget)
            .finish()
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_BUDGET)
    }
}

impl MessageBuilder {
    /// Create a builder with the default estimator
    pub fn new(budget: usize) -> Self {
        Self {
            estimator: Arc::new(CharRatioEstimator::default()),
            budget,
        }
    }

    /// Set the token estimator
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    /// Render and truncate `history` under this builder's budget.
    pub fn build(&self, system_prompt: &str, history: &[ConversationMessage]) -> Vec<WireMessage> {
        let system = WireMessage::system(system_prompt);
        let mut used = estimate_message_tokens(self.estimator(), &system);

        if used > self.budget {
            log::debug!(
                "System prompt alone ({} tokens) exceeds budget of {}; sending it without history",
                used,
                self.budget
            );
            return vec![system];
        }

        let rendered = render_history(history);
        let mut accepted = 0;

        for message in rendered.iter().rev() {
            let cost = estimate_message_tokens(self.estimator(), message);
            if used + cost > self.budget {
                break;
            }
            used += cost;
            accepted += 1;
        }

        let dropped = rendered.len() - accepted;
        if dropped > 0 {
            log::debug!(
                "Dropped {} oldest message(s) to fit budget of {} tokens",
                dropped,
                self.budget
            );
        }

        let mut messages = Vec::with_capacity(accepted + 1);
        messages.push(system);
        messages.extend(rendered.into_iter().skip(dropped));
        messages
    }
}

/// Build the outbound message list with the default estimator.
pub fn build_messages(
    system_prompt: &str,
    history: &[ConversationMessage],
    max_tokens: usize,
) -> Vec<WireMessage> {
    MessageBuilder::new(max_tokens).build(system_prompt, history)
}

/// Render every history turn, keeping photos only on the latest user turn.
fn render_history(history: &[ConversationMessage]) -> Vec<WireMessage> {
    let latest_user = history
        .iter()
        .rposition(|m| m.role == ConversationRole::User);

    history
        .iter()
        .enumerate()
        .map(|(index, message)| {
            let keep_photos = Some(index) == latest_user && !message.photos.is_empty();
            let content = if keep_photos {
                let mut parts = Vec::with_capacity(message.photos.len() + 1);
                parts.push(ContentPart::text(&message.content));
                parts.extend(message.photos.iter().map(ContentPart::image));
                WireContent::Parts(parts)
            } else {
                WireContent::Text(message.content.clone())
            };

            WireMessage {
                role: message.role.into(),
                content,
            }
        })
        .collect()
}
