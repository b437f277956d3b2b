//! Rate-limit detection for upstream error responses
//!
//! Decides whether an upstream error body means "this key is rate limited"
//! and, if so, recovers the raw resume timestamp the upstream attached. Pure
//! function of its input: unparsable bodies are simply "no signal".

use reqwest::header::HeaderMap;
use serde_json::{Map, Value};

/// Error `type`/`code` value the upstream uses for rate limiting.
const RATE_LIMIT_SENTINEL: &str = "rate_limit_exceeded";

/// Numeric `code` carried by OpenRouter-style rate-limit envelopes.
const RATE_LIMIT_CODE: u64 = 429;

/// Case-sensitive phrases that mark a string error as rate limiting.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "Rate limit exceeded",
    "rate limit exceeded",
    "rate_limit_exceeded",
    "Too Many Requests",
];

/// Headers that may carry the resume timestamp, in lookup order.
const RESUME_HEADERS: &[&str] = &["x-ratelimit-reset", "retry-after"];

/// Verdict extracted from one upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSignal {
    pub limited: bool,
    /// Raw resume timestamp, unit unresolved (see `KeyPool::penalize`).
    pub resume_at: Option<u64>,
}

/// Inspect an upstream error body (and optionally its HTTP headers).
///
/// The `error` field counts as rate limiting when it is an object whose
/// `type` or `code` is the rate-limit sentinel, or a string (or an object
/// `message`) containing one of the known phrases. The resume timestamp is
/// looked up in the error's own header map first, then in `headers`.
pub fn extract_signal(body: &[u8], headers: Option<&HeaderMap>) -> RateLimitSignal {
    let Ok(parsed) = serde_json::from_slice::<Value>(body) else {
        return RateLimitSignal::default();
    };
    let Some(error) = parsed.get("error") else {
        return RateLimitSignal::default();
    };
    if !is_rate_limited(error) {
        return RateLimitSignal::default();
    }

    let raw = error_header_value(error).or_else(|| headers.and_then(response_header_value));
    RateLimitSignal {
        limited: true,
        resume_at: raw.as_deref().and_then(parse_hint),
    }
}

fn is_rate_limited(error: &Value) -> bool {
    match error {
        Value::String(message) => mentions_rate_limit(message),
        Value::Object(fields) => {
            is_sentinel(fields.get("type"))
                || is_sentinel(fields.get("code"))
                || fields
                    .get("message")
                    .and_then(Value::as_str)
                    .is_some_and(mentions_rate_limit)
        }
        _ => false,
    }
}

fn is_sentinel(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(s)) => s == RATE_LIMIT_SENTINEL,
        Some(Value::Number(n)) => n.as_u64() == Some(RATE_LIMIT_CODE),
        _ => false,
    }
}

fn mentions_rate_limit(message: &str) -> bool {
    RATE_LIMIT_PATTERNS.iter().any(|p| message.contains(p))
}

/// Resume header from `error.metadata.headers`, falling back to `error.headers`.
fn error_header_value(error: &Value) -> Option<String> {
    let maps = [
        error.pointer("/metadata/headers").and_then(Value::as_object),
        error.get("headers").and_then(Value::as_object),
    ];
    maps.into_iter().flatten().find_map(json_header_value)
}

fn json_header_value(map: &Map<String, Value>) -> Option<String> {
    RESUME_HEADERS.iter().find_map(|name| {
        map.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    })
}

fn response_header_value(headers: &HeaderMap) -> Option<String> {
    RESUME_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
    })
}

/// Non-negative number, integer or decimal; anything else is no hint.
fn parse_hint(raw: &str) -> Option<u64> {
    let value: f64 = raw.trim().parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value as u64)
}
