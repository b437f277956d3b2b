//! Free-tier model catalog filter

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

/// Keep only models whose every pricing value is zero.
///
/// Expects `{"data": [...]}`; other top-level fields are preserved. The body
/// is returned unchanged when it cannot be parsed or when nothing would be
/// left after filtering.
pub fn filter_free_only(body: &Bytes) -> Bytes {
    let Ok(mut doc) = serde_json::from_slice::<Value>(body) else {
        return body.clone();
    };
    let Some(models) = doc.get_mut("data").and_then(Value::as_array_mut) else {
        return body.clone();
    };

    let total = models.len();
    models.retain(is_free);
    if models.is_empty() {
        debug!(total, "no free models in catalog, returning it unfiltered");
        return body.clone();
    }

    debug!(kept = models.len(), total, "filtered catalog to free models");
    Bytes::from(doc.to_string())
}

fn is_free(model: &Value) -> bool {
    model
        .get("pricing")
        .and_then(Value::as_object)
        .is_some_and(|pricing| !pricing.is_empty() && pricing.values().all(is_zero))
}

fn is_zero(price: &Value) -> bool {
    match price {
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.trim().parse::<f64>().is_ok_and(|p| p == 0.0),
        _ => false,
    }
}
