//! Passthrough relay: raw bytes in, raw bytes out.
//!
//! Method, path, query and body go upstream untouched; only transport headers
//! and the client's `Authorization` are replaced. Event-stream answers are
//! relayed frame by frame through `FrameSplitter`, everything else is
//! buffered.

use crate::framer::FrameSplitter;
use crate::headers::{is_event_stream, outbound_headers, response_headers};
use crate::{FrameStream, Relay, RelayError, RelayResponse, Result, UpstreamCall};
use futures_util::StreamExt;
use reqwest::Client;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

pub struct PassthroughRelay {
    http: Client,
    base_url: String,
}

impl PassthroughRelay {
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn relay(&self, call: UpstreamCall) -> Result<RelayResponse> {
        let url = format!("{}{}", self.base_url, call.path);
        let headers = outbound_headers(&call.headers, call.credential.as_ref())?;

        debug!(method = %call.method, url = %url, "relaying upstream");
        let response = self
            .http
            .request(call.method, &url)
            .headers(headers)
            .body(call.body)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status();
        let headers = response_headers(response.headers());

        if status.is_success() && is_event_stream(&headers) {
            return Ok(RelayResponse::Streaming {
                status,
                headers,
                frames: split_frames(response),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        Ok(RelayResponse::Buffered {
            status,
            headers,
            body,
        })
    }
}

impl Relay for PassthroughRelay {
    fn id(&self) -> &str {
        "passthrough"
    }

    fn dispatch(
        &self,
        call: UpstreamCall,
    ) -> Pin<Box<dyn Future<Output = Result<RelayResponse>> + Send + '_>> {
        Box::pin(self.relay(call))
    }
}

/// Re-chunk an upstream event stream on frame boundaries.
fn split_frames(response: reqwest::Response) -> FrameStream {
    let mut upstream = Box::pin(response.bytes_stream());
    Box::pin(async_stream::stream! {
        let mut splitter = FrameSplitter::new();
        let mut broken = false;
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    for frame in splitter.push(&chunk) {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    yield Err(RelayError::Transport(e.to_string()));
                    broken = true;
                    break;
                }
            }
        }
        if !broken && let Some(rest) = splitter.finish() {
            yield Ok(rest);
        }
    })
}
