//! Structured relay: completion calls through the typed client.
//!
//! Streamed chunks are re-encoded as `data: <json>\n\n` frames followed by a
//! closing `data: [DONE]\n\n`. An error chunk ends the stream with
//! `RelayError::Stream` and no `[DONE]`.

use crate::client::{ChunkStream, ClientError, CompletionClient, CompletionRequest, Endpoint};
use crate::headers::response_headers;
use crate::{FrameStream, Relay, RelayError, RelayResponse, Result, UpstreamCall, path_only};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderValue};
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

pub struct StructuredRelay {
    client: CompletionClient,
}

impl StructuredRelay {
    pub fn new(client: CompletionClient) -> Self {
        Self { client }
    }

    async fn relay(&self, call: UpstreamCall) -> Result<RelayResponse> {
        let path = path_only(&call.path);
        let endpoint = Endpoint::from_path(path)
            .ok_or_else(|| RelayError::UnsupportedEndpoint(path.to_string()))?;
        let request = parse_request(&call.body)?;
        let key = call.credential.as_ref();

        debug!(
            endpoint = endpoint.path(),
            model = request.model.as_deref().unwrap_or(""),
            stream = request.is_stream(),
            "structured completion"
        );

        if request.is_stream() {
            match self.client.create_stream(endpoint, &request, key).await {
                Ok(chunks) => Ok(RelayResponse::Streaming {
                    status: StatusCode::OK,
                    headers: event_stream_headers(),
                    frames: event_frames(chunks),
                }),
                Err(e) => upstream_failure(e),
            }
        } else {
            match self.client.create(endpoint, &request, key).await {
                Ok(body) => {
                    let mut headers = HeaderMap::new();
                    headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                    Ok(RelayResponse::Buffered {
                        status: StatusCode::OK,
                        headers,
                        body: Bytes::from(body.to_string()),
                    })
                }
                Err(e) => upstream_failure(e),
            }
        }
    }
}

impl Relay for StructuredRelay {
    fn id(&self) -> &str {
        "structured"
    }

    fn check(&self, path: &str, body: &[u8]) -> Result<()> {
        if Endpoint::from_path(path).is_none() {
            return Err(RelayError::UnsupportedEndpoint(path.to_string()));
        }
        parse_request(body).map(|_| ())
    }

    fn dispatch(
        &self,
        call: UpstreamCall,
    ) -> Pin<Box<dyn Future<Output = Result<RelayResponse>> + Send + '_>> {
        Box::pin(self.relay(call))
    }
}

fn parse_request(body: &[u8]) -> Result<CompletionRequest> {
    serde_json::from_slice(body).map_err(|e| RelayError::InvalidRequest(e.to_string()))
}

/// Non-2xx answers are relayed as data; everything else had no usable response.
fn upstream_failure(err: ClientError) -> Result<RelayResponse> {
    match err {
        ClientError::Status {
            status,
            headers,
            body,
        } => Ok(RelayResponse::Buffered {
            status,
            headers: response_headers(&headers),
            body,
        }),
        other => Err(RelayError::Transport(other.to_string())),
    }
}

fn event_stream_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers
}

fn data_frame(payload: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\n\n");
    Bytes::from(frame)
}

fn event_frames(mut chunks: ChunkStream) -> FrameStream {
    Box::pin(async_stream::stream! {
        let mut failed = false;
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => {
                    yield Ok(data_frame(chunk.to_string().as_bytes()));
                }
                Err(ClientError::Stream { body }) => {
                    yield Err(RelayError::Stream { body });
                    failed = true;
                    break;
                }
                Err(e) => {
                    yield Err(RelayError::Transport(e.to_string()));
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            yield Ok(Bytes::from_static(DONE_FRAME));
        }
    })
}

/// Encode a mid-stream error body as the final frame sent to the client.
pub fn error_frame(body: &[u8]) -> Bytes {
    data_frame(body)
}
