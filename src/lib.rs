//! # Chat Pipeline
//!
//! Client-side plumbing for multi-turn, multimodal conversations with an
//! OpenAI-compatible chat-completions endpoint.
//!
//! ## Overview
//!
//! A conversation history goes in; a model reply comes out. Between the two,
//! the crate takes care of:
//!
//! - **Token Estimation**: fast character-ratio heuristics, no tokenizer
//! - **Budget Truncation**: keep the newest turns that fit, system prompt first
//! - **Photo Placement**: images travel only with the latest user turn
//! - **Response Caching**: SHA-256 fingerprints with a seven-day TTL
//! - **Retries**: exponential backoff on 429 and 5xx, per-attempt timeouts
//! - **Streaming**: incremental SSE decoding that survives split reads
//! - **Usage Accounting**: one ledger record per live completion
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chat_pipeline::{ChatOptions, ChatPipeline, ConversationMessage, ResponseCache};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ChatOptions::builder()
//!         .model("gpt-4o-mini")
//!         .endpoint("https://api.openai.com/v1")
//!         .api_key(std::env::var("OPENAI_API_KEY")?)
//!         .build()?;
//!
//!     let pipeline = ChatPipeline::new(options)?.with_cache(ResponseCache::in_memory());
//!
//!     let history = vec![ConversationMessage::user("Suggest a soup for tonight")];
//!     let response = pipeline.respond("You are a cooking assistant", &history).await?;
//!     println!("{}", response.content());
//!     Ok(())
//! }
//! ```
//!
//! ## Streaming
//!
//! ```rust,no_run
//! use chat_pipeline::{ChatOptions, ChatPipeline, ConversationMessage};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = ChatPipeline::new(ChatOptions::from_env()?)?;
//! let history = vec![ConversationMessage::user("Tell me a short story")];
//!
//! let response = pipeline
//!     .respond_streaming("You are a storyteller", &history, |delta| print!("{}", delta))
//!     .await?;
//! println!("\n{} completion tokens", response.usage.completion_tokens);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **tokens**: Token estimation heuristics
//! - **context**: Message builder with budget truncation and photo placement
//! - **cache**: Fingerprinting, TTL logic, in-memory and file-backed stores
//! - **retry**: Exponential backoff retry loop
//! - **client**: HTTP client with retry, timeout and optional bearer auth
//! - **stream**: SSE line decoding and response assembly
//! - **usage**: Pricing and the usage ledger
//! - **pipeline**: Orchestration of all of the above
//! - **types**: Conversation and wire types
//! - **config**: Options, providers and environment resolution
//! - **error**: Error types and classification

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Response cache keyed by conversation fingerprint, with pluggable stores.
mod cache;

/// Retrying HTTP client for chat-completions calls.
mod client;

/// Options builder, provider presets and environment lookups.
mod config;

/// Message builder: budget truncation and photo placement.
mod context;

/// Error types and status classification.
mod error;

/// Cache-first, coalescing orchestration of a full request.
mod pipeline;

/// Incremental SSE decoding and response assembly.
mod stream;

/// Token estimation heuristics.
mod tokens;

/// Conversation, wire and response types.
mod types;

/// Usage ledger and cost estimation.
mod usage;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// Retry utilities with exponential backoff and jitter.
/// Public as a module so callers can reuse the retry loop for their own operations.
pub mod retry;

// --- Pipeline & Client ---

pub use client::{ChatClient, chat_completions_url};
pub use pipeline::ChatPipeline;

// --- Configuration ---

pub use config::{
    API_KEY_ENV, ChatOptions, ChatOptionsBuilder, DEFAULT_CONTEXT_BUDGET, DEFAULT_MAX_TOKENS,
    DEFAULT_TEMPERATURE, DEFAULT_TIMEOUT, ENDPOINT_ENV, MODEL_ENV, Provider, get_api_key,
    get_endpoint, get_model,
};

// --- Context Management ---

pub use context::{MessageBuilder, build_messages};
pub use tokens::{
    CharRatioEstimator, IMAGE_TOKENS, MESSAGE_OVERHEAD_TOKENS, TokenEstimator, estimate_message_tokens,
    estimate_messages_tokens, estimate_tokens, is_approaching_limit,
};

// --- Caching ---

pub use cache::{
    CacheEntry, CacheStore, Clock, DEFAULT_TTL_DAYS, FileCacheStore, ManualClock, MemoryCacheStore,
    ResponseCache, SystemClock, build_cache_key,
};

// --- Streaming ---

pub use stream::{
    AssembledResponse, ResponseStream, SseLineDecoder, SseRecord, StreamAssembler, StreamEvent,
    parse_sse_line,
};

// --- Usage ---

pub use usage::{MemoryUsageLedger, Pricing, UsageLedger};

// --- Error Handling ---

pub use error::{Error, ErrorKind, Result};

// --- Core Types ---

pub use types::{
    ChatRequest, ChatResponse, Choice, ContentPart, ConversationMessage, ConversationRole,
    ImageRef, ImageUrl, ResponseMessage, Role, StreamChoice, StreamChunk, StreamDelta, Usage,
    UsageRecord, WireContent, WireMessage,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types.
/// Import with `use chat_pipeline::prelude::*;`.
pub mod prelude {
    pub use crate::{
        ChatClient, ChatOptions, ChatPipeline, ChatResponse, ConversationMessage, Error, ImageRef,
        ResponseCache, Result, WireMessage,
    };
}
