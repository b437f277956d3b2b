//! Client access key check

use common::Secret;
use subtle::ConstantTimeEq;

/// Gate for non-public routes.
///
/// With no key configured every request is let through.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    key: Option<Secret<String>>,
}

impl AccessControl {
    pub fn new(key: Option<Secret<String>>) -> Self {
        Self { key }
    }

    pub fn is_open(&self) -> bool {
        self.key.is_none()
    }

    /// Check an `Authorization` header value: `Bearer <key>` or the bare key.
    pub fn verify(&self, authorization: Option<&str>) -> bool {
        let Some(key) = &self.key else {
            return true;
        };
        let Some(value) = authorization else {
            return false;
        };

        let value = value.trim();
        let presented = match value.split_once(' ') {
            Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => token.trim(),
            _ => value,
        };
        presented.as_bytes().ct_eq(key.expose().as_bytes()).into()
    }
}
