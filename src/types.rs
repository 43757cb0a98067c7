//! Core types for the chat pipeline
//!
//! Two families live here: the locally stored conversation record
//! ([`ConversationMessage`]) and the transport-level shapes exchanged with the
//! OpenAI-compatible endpoint ([`WireMessage`], [`ChatRequest`],
//! [`ChatResponse`], [`StreamChunk`]).

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ============================================================================
// CONVERSATION RECORDS
// ============================================================================

/// Author of a stored conversation turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    User,
    Assistant,
}

/// A reference to an already-preprocessed image, held as a data URI.
///
/// Images are downscaled and re-encoded before they reach the pipeline; only
/// `data:image/...` URIs are accepted since nothing is hosted externally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    /// Validate and wrap a `data:image/<type>;base64,<payload>` URI.
    pub fn from_data_uri(uri: impl Into<String>) -> Result<Self> {
        let uri = uri.into();
        let Some(rest) = uri.strip_prefix("data:image/") else {
            return Err(Error::invalid_input(
                "image reference must be a data:image/ URI",
            ));
        };
        match rest.split_once(";base64,") {
            Some((mime_subtype, payload)) if !mime_subtype.is_empty() && !payload.is_empty() => {
                Ok(Self(uri))
            }
            _ => Err(Error::invalid_input(
                "image data URI must be base64 encoded and non-empty",
            )),
        }
    }

    /// Build a data URI from raw base64 and a MIME type such as `image/jpeg`.
    pub fn from_base64(data: &str, mime_type: &str) -> Result<Self> {
        if !mime_type.starts_with("image/") {
            return Err(Error::invalid_input(format!(
                "unsupported MIME type for image: {}",
                mime_type
            )));
        }
        Self::from_data_uri(format!("data:{};base64,{}", mime_type, data))
    }

    pub fn url(&self) -> &str {
        &self.0
    }
}

/// One stored conversation turn. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub id: String,
    pub role: ConversationRole,
    pub content: String,
    /// Only ever populated on `user` turns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub photos: Vec<ImageRef>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: ConversationRole::User,
            content: content.into(),
            photos: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: ConversationRole::Assistant,
            content: content.into(),
            photos: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// A user turn carrying image attachments, in display order.
    pub fn user_with_photos(content: impl Into<String>, photos: Vec<ImageRef>) -> Self {
        Self {
            photos,
            ..Self::user(content)
        }
    }
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

/// Role of a transport-level message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl From<ConversationRole> for Role {
    fn from(role: ConversationRole) -> Self {
        match role {
            ConversationRole::User => Role::User,
            ConversationRole::Assistant => Role::Assistant,
        }
    }
}

/// `{ "url": "data:image/..." }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageUrl {
    pub url: String,
}

/// A single part of a multi-part message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(image: &ImageRef) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: image.url().to_string(),
            },
        }
    }
}

/// Message body: a plain string, or ordered parts when images are attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl WireContent {
    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        match self {
            WireContent::Text(text) => text.clone(),
            WireContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            WireContent::Text(_) => 0,
            WireContent::Parts(parts) => parts
                .iter()
                .filter(|p| matches!(p, ContentPart::ImageUrl { .. }))
                .count(),
        }
    }
}

/// One conversational turn as sent to the endpoint. Built fresh per call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireMessage {
    pub role: Role,
    pub content: WireContent,
}

impl WireMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: WireContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: WireContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: WireContent::Text(text.into()),
        }
    }
}

/// Chat-completions request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<WireMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: crate::config::DEFAULT_MAX_TOKENS,
            temperature: crate::config::DEFAULT_TEMPERATURE,
            stream: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Copy of this request with the streaming flag set.
    pub fn streaming(&self) -> Self {
        Self {
            stream: Some(true),
            ..self.clone()
        }
    }
}

/// Token accounting reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub prompt_tokens: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub completion_tokens: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_tokens: u32,
}

/// Endpoints send explicit `null` for absent fields (e.g. `content` on a
/// length-capped or refused reply); read it as the type's default.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseMessage {
    #[serde(default = "assistant_role", deserialize_with = "null_as_assistant")]
    pub role: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
}

fn assistant_role() -> String {
    "assistant".to_string()
}

fn null_as_assistant<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(assistant_role))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Choice {
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Non-streaming chat-completions response, or one synthesized from a stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub choices: Vec<Choice>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub usage: Usage,
}

impl ChatResponse {
    /// Content of the first choice, or `""`.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("")
    }
}

/// Incremental delta inside a streamed record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Payload of one `data: {...}` SSE record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// One entry of the append-only usage ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub estimated_cost_usd: f64,
}
