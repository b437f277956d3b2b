//! Typed completion client
//!
//! Speaks the upstream's OpenAI-compatible completion API: one JSON request
//! in, either one JSON document or a server-sent event stream of JSON chunks
//! out. Non-2xx answers surface as `ClientError::Status` with the raw body so
//! callers can relay and inspect them.

use bytes::Bytes;
use common::Secret;
use futures_util::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;
use tracing::debug;

/// Lazy sequence of decoded stream chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value, ClientError>> + Send>>;

/// Completion endpoints the client implements, relative to the base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    Completions,
}

impl Endpoint {
    /// Match an exact relative path (no query string).
    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/chat/completions" => Some(Endpoint::ChatCompletions),
            "/completions" => Some(Endpoint::Completions),
            _ => None,
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "/chat/completions",
            Endpoint::Completions => "/completions",
        }
    }
}

/// Completion request envelope.
///
/// Common parameters are typed; anything else the client sent (provider
/// routing, transforms, vendor extensions) lands in `extra_body` and is
/// serialized back untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra_body: Map<String, Value>,
}

impl CompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream == Some(true)
    }
}

/// Errors from the completion client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The upstream answered, but not with 2xx.
    #[error("upstream returned {status}")]
    Status {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    /// A stream chunk carried an `error` object.
    #[error("upstream error in stream")]
    Stream { body: Bytes },

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode: {0}")]
    Decode(String),
}

/// Client for the upstream completion endpoints.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    http: Client,
    base_url: String,
}

impl CompletionClient {
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Non-streaming completion; returns the upstream JSON document.
    pub async fn create(
        &self,
        endpoint: Endpoint,
        request: &CompletionRequest,
        api_key: Option<&Secret<String>>,
    ) -> Result<Value, ClientError> {
        let response = self.send(endpoint, request, api_key).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Streaming completion.
    ///
    /// Resolves once the upstream has answered 2xx; chunks are decoded as they
    /// arrive. The stream ends after `data: [DONE]`, at end of body, or after
    /// yielding the first error.
    pub async fn create_stream(
        &self,
        endpoint: Endpoint,
        request: &CompletionRequest,
        api_key: Option<&Secret<String>>,
    ) -> Result<ChunkStream, ClientError> {
        let response = self.send(endpoint, request, api_key).await?;
        let mut upstream = Box::pin(response.bytes_stream());

        let chunks = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut eof = false;
            'read: loop {
                match upstream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        yield Err(ClientError::Transport(e));
                        break;
                    }
                    None => {
                        if !buffer.is_empty() {
                            buffer.push(b'\n');
                        }
                        eof = true;
                    }
                }

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match decode_line(&line) {
                        Line::Skip => {}
                        Line::Done => break 'read,
                        Line::Chunk(chunk) => {
                            yield Ok(chunk);
                        }
                        Line::Error(body) => {
                            yield Err(ClientError::Stream { body });
                            break 'read;
                        }
                        Line::Malformed(reason) => {
                            yield Err(ClientError::Decode(reason));
                            break 'read;
                        }
                    }
                }

                if eof {
                    break;
                }
            }
        };

        Ok(Box::pin(chunks))
    }

    async fn send(
        &self,
        endpoint: Endpoint,
        request: &CompletionRequest,
        api_key: Option<&Secret<String>>,
    ) -> Result<reqwest::Response, ClientError> {
        let url = format!("{}{}", self.base_url, endpoint.path());
        debug!(url = %url, stream = request.is_stream(), "sending completion request");

        let mut builder = self.http.post(&url).json(request);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key.expose());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            return Err(ClientError::Status {
                status,
                headers,
                body,
            });
        }
        Ok(response)
    }
}

/// One decoded event-stream line.
#[derive(Debug, PartialEq)]
enum Line {
    Skip,
    Done,
    Chunk(Value),
    Error(Bytes),
    Malformed(String),
}

fn decode_line(raw: &[u8]) -> Line {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let Some(payload) = line.strip_prefix(b"data:") else {
        // blank separators, comments, event/id/retry fields
        return Line::Skip;
    };
    let payload = payload.trim_ascii_start();
    if payload == b"[DONE]" {
        return Line::Done;
    }

    match serde_json::from_slice::<Value>(payload) {
        Ok(chunk) if chunk.get("error").is_some() => Line::Error(Bytes::copy_from_slice(payload)),
        Ok(chunk) => Line::Chunk(chunk),
        Err(e) => Line::Malformed(e.to_string()),
    }
}
