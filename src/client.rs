//! Retrying HTTP client for the chat-completions endpoint
//!
//! [`ChatClient`] POSTs a [`ChatRequest`] as JSON and classifies the outcome:
//!
//! - **2xx**: the body is returned (raw, parsed, or as a [`ResponseStream`])
//! - **429 / 5xx**: retried with exponential backoff, up to
//!   [`RetryConfig::max_retries`] times
//! - **other 4xx**: terminal, `retryable = false`
//! - **network failure / timeout**: propagated immediately as a transport error
//!
//! Each attempt runs under its own timeout window. When it fires the attempt
//! future is dropped, which aborts the in-flight request.
//!
//! ## Request Flow
//!
//! ```text
//! ChatRequest ──serialize once──► attempt 0 ──► 2xx ──► body / stream
//!                                    │
//!                                    ├─ 429/5xx ──► sleep(base * 2^(n-1)) ──► attempt n
//!                                    ├─ other 4xx ──► Err(Api { retryable: false })
//!                                    └─ transport/timeout ──► Err(Http | Timeout)
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use chat_pipeline::{ChatClient, ChatOptions, ChatRequest, WireMessage};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ChatOptions::builder()
//!     .model("gpt-4o-mini")
//!     .endpoint("https://api.openai.com/v1")
//!     .api_key("sk-...")
//!     .build()?;
//! let client = ChatClient::new(&options)?;
//!
//! let request = ChatRequest::new(
//!     "gpt-4o-mini",
//!     vec![WireMessage::system("Be brief"), WireMessage::user("Hi")],
//! );
//! let response = client.call(&request).await?;
//! println!("{}", response.content());
//! # Ok(())
//! # }
//! ```

use crate::config::ChatOptions;
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::stream::ResponseStream;
use crate::types::{ChatRequest, ChatResponse};
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;

const COMPLETIONS_PATH: &str = "/chat/completions";

/// Resolve a base URL or full URL to the chat-completions URL.
///
/// `https://api.openai.com/v1` becomes `https://api.openai.com/v1/chat/completions`;
/// a URL that already ends in `/chat/completions` (such as a relay route) is
/// used as-is.
pub fn chat_completions_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.ends_with(COMPLETIONS_PATH) {
        trimmed.to_string()
    } else {
        format!("{}{}", trimmed, COMPLETIONS_PATH)
    }
}

/// HTTP client with retry, backoff and per-attempt timeout.
#[derive(Clone)]
pub struct ChatClient {
    /// Reused across calls for connection pooling.
    http_client: reqwest::Client,

    url: String,

    /// Sent as a bearer token when present.
    api_key: Option<String>,

    /// Bound on each individual attempt.
    timeout: Duration,

    retry: RetryConfig,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ChatClient {
    /// Creates a client from the endpoint, credential, timeout and retry
    /// policy in `options`.
    pub fn new(options: &ChatOptions) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url: chat_completions_url(&options.endpoint),
            api_key: options.api_key.clone(),
            timeout: options.timeout,
            retry: options.retry.clone(),
        })
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Non-streaming call returning the raw JSON body.
    pub async fn call_raw(&self, request: &ChatRequest) -> Result<String> {
        let body = encode(request, false)?;

        retry_with_backoff(&self.retry, |attempt| {
            let body = body.clone();
            async move {
                self.with_attempt_timeout(attempt, async {
                    let response = self.send_once(body).await?;
                    response.text().await.map_err(map_transport)
                })
                .await
            }
        })
        .await
    }

    /// Non-streaming call parsed into a [`ChatResponse`].
    pub async fn call(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let raw = self.call_raw(request).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Streaming call. Status errors are classified and retried exactly as
    /// in [`call`](Self::call) before any of the body is consumed; the timeout
    /// covers each attempt up to the response headers.
    pub async fn call_streaming(&self, request: &ChatRequest) -> Result<ResponseStream> {
        let body = encode(request, true)?;

        let response = retry_with_backoff(&self.retry, |attempt| {
            let body = body.clone();
            async move {
                self.with_attempt_timeout(attempt, self.send_once(body))
                    .await
            }
        })
        .await?;

        Ok(ResponseStream::from_response(response))
    }

    async fn with_attempt_timeout<T>(
        &self,
        attempt: u32,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "Attempt {} to {} timed out after {:?}",
                    attempt + 1,
                    self.url,
                    self.timeout
                );
                Err(Error::timeout())
            }
        }
    }

    /// One POST. Non-2xx statuses become classified [`Error::Api`]s.
    async fn send_once(&self, body: Vec<u8>) -> Result<reqwest::Response> {
        log::debug!("POST {} ({} bytes)", self.url, body.len());

        let mut builder = self
            .http_client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(map_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_else(|e| {
            log::warn!("Failed to read error response body: {}", e);
            String::new()
        });
        let err = Error::from_status(status.as_u16(), body);
        log::debug!("{}", err);
        Err(err)
    }
}

fn encode(request: &ChatRequest, stream: bool) -> Result<Vec<u8>> {
    let mut request = request.clone();
    request.stream = stream.then_some(true);
    Ok(serde_json::to_vec(&request)?)
}

fn map_transport(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::timeout()
    } else {
        Error::Http(err)
    }
}
