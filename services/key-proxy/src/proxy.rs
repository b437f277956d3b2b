//! Request forwarding
//!
//! Classifies the inbound path, checks the access key, takes an upstream key
//! from the pool and hands the call to the matching relay. Upstream answers go
//! back verbatim (error statuses included); rate-limit answers additionally
//! park the key that was used, whether they arrive as a status or inside a
//! running stream.

use crate::access::AccessControl;
use crate::catalog;
use crate::error::RequestError;
use crate::metrics;
use crate::route::{Route, upstream_path};
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use key_pool::{Credential, KeyPool, extract_signal};
use relay::{FrameStream, Relay, RelayError, RelayResponse, UpstreamCall};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Models that get the preventive per-key cooldown.
const GOOGLE_MODEL_PREFIX: &str = "google/";

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub pool: Arc<KeyPool>,
    pub access: AccessControl,
    /// Serves `Route::Completion`.
    pub structured: Arc<dyn Relay>,
    /// Serves every other route.
    pub passthrough: Arc<dyn Relay>,
    pub free_only: bool,
    pub google_model_cooldown: Duration,
}

/// Forward one inbound request under the API prefix.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn forward(state: &ProxyState, request: Request<Body>, request_id: String) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let route = Route::classify(request.uri().path());

    let response = match handle(state, route, request, &request_id).await {
        Ok(response) => response,
        Err(err @ RequestError::Upstream(_)) => {
            error!(error = %err, "upstream request failed");
            err.into_response(&request_id)
        }
        Err(err) => {
            warn!(error = %err, "request rejected");
            err.into_response(&request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        route.label(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn handle(
    state: &ProxyState,
    route: Route,
    request: Request<Body>,
    request_id: &str,
) -> Result<Response, RequestError> {
    let (parts, body) = request.into_parts();

    if route.needs_credential() {
        let authorization = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !state.access.verify(authorization) {
            return Err(RequestError::Unauthorized);
        }
    }

    let relay = match route {
        Route::Completion => &state.structured,
        _ => &state.passthrough,
    };

    let target = upstream_path(
        parts
            .uri
            .path_and_query()
            .map_or(parts.uri.path(), |pq| pq.as_str()),
    );

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| RequestError::BadRequest(format!("invalid request body: {e}")))?;

    relay.check(&upstream_path(parts.uri.path()), &body)?;

    let cooldown = match route {
        Route::Completion => completion_cooldown(&body, state.google_model_cooldown),
        _ => Duration::ZERO,
    };

    let credential = if route.needs_credential() {
        let key = state.pool.acquire_with_cooldown(cooldown).await;
        debug!(key = %key.hint(), relay = relay.id(), "key acquired");
        Some(key)
    } else {
        None
    };

    let call = UpstreamCall {
        method: parts.method,
        path: target,
        headers: parts.headers,
        body,
        credential: credential.clone(),
    };

    match relay.dispatch(call).await {
        Ok(RelayResponse::Buffered {
            status,
            headers,
            body,
        }) => {
            if !status.is_success() {
                metrics::record_upstream_error("status");
                warn!(status = status.as_u16(), "upstream returned error status");
                if let Some(key) = &credential {
                    report_failure(&state.pool, key, &body, Some(&headers)).await;
                }
            }
            let body = if route == Route::Catalog && state.free_only && status.is_success() {
                catalog::filter_free_only(&body)
            } else {
                body
            };
            Ok(build_response(status, headers, Body::from(body)))
        }
        Ok(RelayResponse::Streaming {
            status,
            headers,
            frames,
        }) => {
            debug!(status = status.as_u16(), "relaying upstream stream");
            let frames = relay_frames(
                frames,
                Arc::clone(&state.pool),
                credential,
                request_id.to_string(),
            );
            Ok(build_response(status, headers, Body::from_stream(frames)))
        }
        Err(err) => {
            if matches!(err, RelayError::Transport(_)) {
                metrics::record_upstream_error("transport");
            }
            Err(err.into())
        }
    }
}

/// Preventive cooldown for a completion body the relay already accepted.
fn completion_cooldown(body: &[u8], google_cooldown: Duration) -> Duration {
    let is_google = serde_json::from_slice::<Value>(body)
        .ok()
        .as_ref()
        .and_then(|request| request.get("model"))
        .and_then(Value::as_str)
        .is_some_and(|model| model.starts_with(GOOGLE_MODEL_PREFIX));
    if is_google {
        google_cooldown
    } else {
        Duration::ZERO
    }
}

/// Park `key` if the upstream error says it is rate limited.
async fn report_failure(
    pool: &KeyPool,
    key: &Credential,
    body: &[u8],
    headers: Option<&HeaderMap>,
) {
    let signal = extract_signal(body, headers);
    if signal.limited {
        pool.penalize(key, signal.resume_at).await;
    } else {
        debug!(key = %key.hint(), "upstream error is not a rate limit, key stays eligible");
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Marks a relayed stream as abandoned unless it ran to completion.
struct StreamWatch {
    request_id: String,
    finished: bool,
}

impl StreamWatch {
    fn new(request_id: String) -> Self {
        Self {
            request_id,
            finished: false,
        }
    }
}

impl Drop for StreamWatch {
    fn drop(&mut self) {
        if !self.finished {
            info!(request_id = %self.request_id, "client disconnected mid-stream, upstream read aborted");
            metrics::record_stream_disconnect();
        }
    }
}

/// Client-facing body stream.
///
/// A mid-stream rate-limit error penalizes the key and goes out as the final
/// frame; a broken upstream ends the body early. Dropping the stream (client
/// gone) drops the upstream reader with it.
fn relay_frames(
    mut frames: FrameStream,
    pool: Arc<KeyPool>,
    credential: Option<Credential>,
    request_id: String,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        let mut watch = StreamWatch::new(request_id);
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(frame) => {
                    yield Ok::<Bytes, Infallible>(frame);
                }
                Err(RelayError::Stream { body }) => {
                    warn!(request_id = %watch.request_id, "upstream reported an error mid-stream");
                    metrics::record_upstream_error("stream");
                    if let Some(key) = &credential {
                        report_failure(&pool, key, &body, None).await;
                    }
                    yield Ok(relay::error_frame(&body));
                    break;
                }
                Err(err) => {
                    error!(request_id = %watch.request_id, error = %err, "upstream stream broke");
                    metrics::record_upstream_error("transport");
                    break;
                }
            }
        }
        watch.finished = true;
    }
}
