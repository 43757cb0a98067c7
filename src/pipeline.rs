//! End-to-end chat pipeline
//!
//! [`ChatPipeline`] composes the other parts of the crate into a single call:
//!
//! ```text
//! history ──► MessageBuilder ──► fingerprint ──► ResponseCache ──hit──► response
//!                                                      │
//!                                                     miss
//!                                                      ▼
//!                                   ChatClient (retry + timeout)
//!                                                      │
//!                                   cache write-back + usage record
//! ```
//!
//! Non-streaming calls consult the cache first. Concurrent calls for the
//! same fingerprint are coalesced: one goes to the network, the others wait
//! and then read its cached result. Streaming calls always go live, and the
//! assembled response is written back so later non-streaming calls hit. A
//! stream that closes before the reply is finished is returned to the
//! caller but not cached.
//!
//! Cache hits are not recorded in the usage ledger.
//!
//! # Examples
//!
//! ```rust,no_run
//! use chat_pipeline::{ChatOptions, ChatPipeline, ConversationMessage, ResponseCache};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ChatOptions::builder()
//!     .model("gpt-4o-mini")
//!     .endpoint("https://api.openai.com/v1")
//!     .build()?;
//! let pipeline = ChatPipeline::new(options)?.with_cache(ResponseCache::in_memory());
//!
//! let history = vec![ConversationMessage::user("What's in season in October?")];
//! let response = pipeline
//!     .respond_streaming("You are a cooking assistant", &history, |delta| print!("{}", delta))
//!     .await?;
//! println!("\n[{} tokens]", response.usage.total_tokens);
//! # Ok(())
//! # }
//! ```

use crate::cache::{ResponseCache, build_cache_key};
use crate::client::ChatClient;
use crate::config::ChatOptions;
use crate::context::MessageBuilder;
use crate::stream::AssembledResponse;
use crate::types::{ChatRequest, ChatResponse, ConversationMessage};
use crate::usage::UsageLedger;
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type InFlight = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

pub struct ChatPipeline {
    client: ChatClient,
    options: ChatOptions,
    builder: MessageBuilder,
    cache: Option<ResponseCache>,
    ledger: Option<Arc<dyn UsageLedger>>,

    /// One gate per fingerprint with a non-streaming call in progress.
    in_flight: InFlight,
}

impl std::fmt::Debug for ChatPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatPipeline")
            .field("client", &self.client)
            .field("builder", &self.builder)
            .field("cache", &self.cache)
            .field("ledger", &self.ledger.is_some())
            .finish()
    }
}

impl ChatPipeline {
    /// Create a pipeline with a client built from `options`.
    pub fn new(options: ChatOptions) -> Result<Self> {
        let client = ChatClient::new(&options)?;
        Ok(Self::with_client(client, options))
    }

    /// Use a pre-configured client instead of building one from `options`.
    pub fn with_client(client: ChatClient, options: ChatOptions) -> Self {
        Self {
            client,
            builder: MessageBuilder::new(options.context_budget),
            options,
            cache: None,
            ledger: None,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Enable the response cache.
    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Record usage of live calls into `ledger`.
    pub fn with_ledger(mut self, ledger: Arc<dyn UsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Replace the message builder (budget and estimator).
    pub fn with_message_builder(mut self, builder: MessageBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Get the underlying client
    pub fn client(&self) -> &ChatClient {
        &self.client
    }

    /// Get the pipeline options
    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    /// Get the response cache, if one is configured
    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    /// The request that would be sent for this conversation.
    pub fn build_request(&self, system_prompt: &str, history: &[ConversationMessage]) -> ChatRequest {
        let messages = self.builder.build(system_prompt, history);
        ChatRequest::new(self.options.model.clone(), messages)
            .with_max_tokens(self.options.max_tokens)
            .with_temperature(self.options.temperature)
    }

    /// Non-streaming response, served from cache when possible.
    pub async fn respond(
        &self,
        system_prompt: &str,
        history: &[ConversationMessage],
    ) -> Result<ChatResponse> {
        let request = self.build_request(system_prompt, history);

        let Some(cache) = &self.cache else {
            let raw = self.client.call_raw(&request).await?;
            let response: ChatResponse = serde_json::from_str(&raw)?;
            self.record_usage(&response).await;
            return Ok(response);
        };

        let key = build_cache_key(&request.messages);
        if let Some(hit) = cached_response(cache, &key).await? {
            return Ok(hit);
        }

        let _flight = self.acquire(&key).await;

        // Another caller may have filled the entry while we waited.
        if let Some(hit) = cached_response(cache, &key).await? {
            return Ok(hit);
        }

        let raw = self.client.call_raw(&request).await?;
        let response: ChatResponse = serde_json::from_str(&raw)?;

        if let Err(e) = cache.put(&key, raw).await {
            log::warn!("Failed to write cache entry: {}", e);
        }
        self.record_usage(&response).await;

        Ok(response)
    }

    /// Streaming response. `on_chunk` receives each text delta in order; the
    /// assembled response is returned and, if the stream finished cleanly,
    /// written back to the cache.
    pub async fn respond_streaming<F>(
        &self,
        system_prompt: &str,
        history: &[ConversationMessage],
        on_chunk: F,
    ) -> Result<ChatResponse>
    where
        F: FnMut(&str),
    {
        let request = self.build_request(system_prompt, history);
        let stream = self.client.call_streaming(&request).await?;
        let AssembledResponse { response, complete } = stream.assemble_with(on_chunk).await?;

        if !complete {
            log::warn!("Not caching truncated streaming response");
        } else if let Some(cache) = &self.cache {
            let key = build_cache_key(&request.messages);
            let raw = serde_json::to_string(&response)?;
            if let Err(e) = cache.put(&key, raw).await {
                log::warn!("Failed to write cache entry: {}", e);
            }
        }
        self.record_usage(&response).await;

        Ok(response)
    }

    async fn record_usage(&self, response: &ChatResponse) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let record = self.options.pricing.record(&response.usage, Utc::now());
        if let Err(e) = ledger.record(record).await {
            log::warn!("Failed to record usage: {}", e);
        }
    }

    async fn acquire(&self, key: &str) -> FlightPermit<'_> {
        let gate = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();

        FlightPermit {
            in_flight: &self.in_flight,
            key: key.to_string(),
            permit: Some(gate.lock_owned().await),
        }
    }
}

/// Holds the per-fingerprint gate; the map entry is dropped with the last holder.
struct FlightPermit<'a> {
    in_flight: &'a InFlight,
    key: String,
    permit: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightPermit<'_> {
    fn drop(&mut self) {
        self.permit.take();
        if let Ok(mut map) = self.in_flight.lock() {
            let idle = map
                .get(&self.key)
                .is_some_and(|gate| Arc::strong_count(gate) == 1);
            if idle {
                map.remove(&self.key);
            }
        }
    }
}

/// A cached payload that no longer parses is treated as a miss.
async fn cached_response(cache: &ResponseCache, key: &str) -> Result<Option<ChatResponse>> {
    let Some(raw) = cache.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(response) => Ok(Some(response)),
        Err(e) => {
            log::warn!("Ignoring malformed cache entry: {}", e);
            Ok(None)
        }
    }
}
