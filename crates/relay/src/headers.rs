//! Header filtering between the inbound request, the upstream and the client

use common::Secret;
use reqwest::header::{self, HeaderMap, HeaderValue};

use crate::{RelayError, Result};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers that never reach the upstream verbatim.
///
/// `accept-encoding` is dropped so the upstream answers uncompressed and event
/// streams can be split on frame boundaries.
const REQUEST_ONLY_HEADERS: &[&str] = &["host", "content-length", "accept-encoding"];

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Headers to send upstream for a passthrough call.
///
/// Transport headers and the client's `Authorization` are removed; the pool
/// key, when there is one, becomes the new bearer token.
pub fn outbound_headers(inbound: &HeaderMap, credential: Option<&Secret<String>>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str)
            || REQUEST_ONLY_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name_str))
            || *name == header::AUTHORIZATION
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(credential) = credential {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|e| RelayError::InvalidRequest(format!("invalid key value: {e}")))?;
        value.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, value);
    }
    Ok(headers)
}

/// Upstream response headers safe to hand back to the client.
///
/// `content-length` is recomputed by the server for buffered bodies and must
/// not be sent for streamed ones.
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if is_hop_by_hop(name.as_str()) || *name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Whether the upstream answered with a server-sent event stream.
pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("text/event-stream"))
}
