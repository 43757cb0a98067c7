//! Incremental assembly of server-sent event (SSE) responses.
//!
//! The endpoint streams a `text/event-stream` body:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! data: {"choices":[{"delta":{"content":"lo"}}],"usage":{"prompt_tokens":9,"completion_tokens":2,"total_tokens":11}}
//!
//! data: [DONE]
//! ```
//!
//! Reads from the network do not respect line boundaries, so
//! [`SseLineDecoder`] keeps the trailing partial line (as raw bytes, which
//! also covers split UTF-8 sequences) until the rest arrives. Each complete
//! line is parsed by [`parse_sse_line`] and fed to a [`StreamAssembler`],
//! which accumulates text and the last-seen usage.
//!
//! ```text
//! bytes ──► SseLineDecoder ──► parse_sse_line ──► StreamAssembler
//!                                                    │
//!                         StreamEvent::Delta(text) ◄─┤ (in arrival order)
//!                         StreamEvent::Done(resp)  ◄─┘ (once, last)
//! ```
//!
//! Malformed records are skipped with a warning; they never end the stream.
//! A body that closes before `[DONE]` and without any `finish_reason` ends
//! with [`StreamEvent::Truncated`] instead of [`StreamEvent::Done`].

use crate::types::{ChatResponse, Choice, ResponseMessage, StreamChunk, Usage};
use crate::{Error, Result};
use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

const DONE_SENTINEL: &str = "[DONE]";

/// Splits a byte stream into lines, carrying incomplete lines across reads.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read; returns every line completed by it (without `\n`/`\r\n`).
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..].iter().position(|&b| b == b'\n') {
            let end = consumed + offset;
            lines.push(decode_line(&self.buffer[consumed..end]));
            consumed = end + 1;
        }
        self.buffer.drain(..consumed);
        lines
    }

    /// Flush a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = decode_line(&self.buffer);
        self.buffer.clear();
        Some(line)
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// One meaningful SSE line.
#[derive(Debug)]
pub enum SseRecord {
    /// `data: [DONE]`
    Done,
    Chunk(StreamChunk),
}

/// Parse a single line. Returns `None` for blank lines, comments, other
/// fields and malformed JSON.
pub fn parse_sse_line(line: &str) -> Option<SseRecord> {
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data).trim();

    if data == DONE_SENTINEL {
        return Some(SseRecord::Done);
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => Some(SseRecord::Chunk(chunk)),
        Err(e) => {
            log::warn!("Skipping malformed stream record: {}", e);
            None
        }
    }
}

/// Accumulates deltas and usage into a single logical response.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    id: Option<String>,
    text: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    saw_done: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one record; returns the content delta it carried, if any.
    pub fn apply(&mut self, chunk: StreamChunk) -> Option<String> {
        if self.id.is_none() {
            self.id = chunk.id.filter(|id| !id.is_empty());
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let choice = chunk.choices.into_iter().next()?;
        if choice.finish_reason.is_some() {
            self.finish_reason = choice.finish_reason;
        }

        let delta = choice.delta.content.filter(|c| !c.is_empty())?;
        self.text.push_str(&delta);
        Some(delta)
    }

    /// Text accumulated so far.
    pub fn content(&self) -> &str {
        &self.text
    }

    /// Record the `[DONE]` terminator.
    pub fn mark_done(&mut self) {
        self.saw_done = true;
    }

    /// Whether the endpoint signalled the end of the reply, either with
    /// `[DONE]` or a `finish_reason`.
    pub fn is_complete(&self) -> bool {
        self.saw_done || self.finish_reason.is_some()
    }

    /// Synthesize the final response; usage defaults to zeros.
    pub fn finish(self) -> ChatResponse {
        ChatResponse {
            id: self.id.unwrap_or_default(),
            choices: vec![Choice {
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: self.text,
                },
                finish_reason: self.finish_reason,
            }],
            usage: self.usage.unwrap_or_default(),
        }
    }
}

/// An item produced by a [`ResponseStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental text, in arrival order.
    Delta(String),
    /// The assembled response. Always the last item of a successful stream.
    Done(ChatResponse),
    /// The body closed before the reply was finished; holds what arrived.
    /// Last item, in place of `Done`.
    Truncated(ChatResponse),
}

/// Outcome of driving a [`ResponseStream`] to its end.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledResponse {
    pub response: ChatResponse,
    /// `false` when the body ended early (see [`StreamEvent::Truncated`]).
    pub complete: bool,
}

/// A finite, non-restartable sequence of content deltas ending with the
/// assembled response.
///
/// Dropping the stream cancels the underlying read.
pub struct ResponseStream {
    inner: Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>,
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream").finish_non_exhaustive()
    }
}

struct AssemblyState<S> {
    body: Pin<Box<S>>,
    decoder: SseLineDecoder,
    assembler: Option<StreamAssembler>,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl<S> AssemblyState<S> {
    /// Returns `true` once the terminal record is seen.
    fn handle_line(&mut self, line: &str) -> bool {
        match parse_sse_line(line) {
            Some(SseRecord::Done) => {
                if let Some(assembler) = self.assembler.as_mut() {
                    assembler.mark_done();
                }
                true
            }
            Some(SseRecord::Chunk(chunk)) => {
                if let Some(assembler) = self.assembler.as_mut() {
                    if let Some(delta) = assembler.apply(chunk) {
                        self.pending.push_back(StreamEvent::Delta(delta));
                    }
                }
                false
            }
            None => false,
        }
    }

    fn complete(&mut self) {
        if let Some(assembler) = self.assembler.take() {
            let event = if assembler.is_complete() {
                StreamEvent::Done(assembler.finish())
            } else {
                log::warn!(
                    "Stream closed before completion after {} chars",
                    assembler.content().len()
                );
                StreamEvent::Truncated(assembler.finish())
            };
            self.pending.push_back(event);
        }
        self.finished = true;
    }
}

impl ResponseStream {
    /// Assemble any byte stream (e.g. a response body) into events.
    pub fn from_body<S, B>(body: S) -> Self
    where
        S: Stream<Item = Result<B>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
    {
        let state = AssemblyState {
            body: Box::pin(body),
            decoder: SseLineDecoder::new(),
            assembler: Some(StreamAssembler::new()),
            pending: VecDeque::new(),
            finished: false,
        };

        let events = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.finished {
                    return None;
                }

                match state.body.next().await {
                    Some(Ok(bytes)) => {
                        for line in state.decoder.push(bytes.as_ref()) {
                            if state.handle_line(&line) {
                                state.complete();
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        state.pending.clear();
                        return Some((Err(e), state));
                    }
                    None => {
                        if let Some(line) = state.decoder.finish() {
                            state.handle_line(&line);
                        }
                        state.complete();
                    }
                }
            }
        });

        Self {
            inner: Box::pin(events),
        }
    }

    /// Assemble the body of a successful streaming HTTP response.
    pub fn from_response(response: reqwest::Response) -> Self {
        Self::from_body(response.bytes_stream().map(|r| r.map_err(Error::from)))
    }

    /// Drive the stream to its end, invoking `on_chunk` for each delta in
    /// arrival order, and report whether the reply arrived in full.
    pub async fn assemble_with<F>(mut self, mut on_chunk: F) -> Result<AssembledResponse>
    where
        F: FnMut(&str),
    {
        while let Some(event) = self.next().await {
            match event? {
                StreamEvent::Delta(text) => on_chunk(&text),
                StreamEvent::Done(response) => {
                    return Ok(AssembledResponse {
                        response,
                        complete: true,
                    });
                }
                StreamEvent::Truncated(response) => {
                    return Ok(AssembledResponse {
                        response,
                        complete: false,
                    });
                }
            }
        }
        Err(Error::stream("stream ended without a final response"))
    }

    /// Drive the stream to its end, invoking `on_chunk` for each delta in
    /// arrival order, and return the assembled response. A truncated reply
    /// is returned as-is.
    pub async fn collect_with<F>(self, on_chunk: F) -> Result<ChatResponse>
    where
        F: FnMut(&str),
    {
        self.assemble_with(on_chunk)
            .await
            .map(|assembled| assembled.response)
    }

    /// Drive the stream to completion, discarding deltas.
    pub async fn collect(self) -> Result<ChatResponse> {
        self.collect_with(|_| {}).await
    }
}

impl Stream for ResponseStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
