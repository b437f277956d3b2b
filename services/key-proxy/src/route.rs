//! Inbound path classification

/// Versioned API prefix; everything under it is relayed upstream.
pub const API_PREFIX: &str = "/api/v1";

/// How a request under `API_PREFIX` is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// No access check, no upstream key.
    Public,
    /// Typed completion request through the structured relay.
    Completion,
    /// Model listing, optionally filtered to free models.
    Catalog,
    /// Anything else, passed through byte for byte.
    Generic,
}

/// Prefix table, checked in order; first match wins.
const ROUTES: &[(&str, Route)] = &[
    ("/api/v1/providers", Route::Public),
    ("/api/v1/chat/completions", Route::Completion),
    ("/api/v1/completions", Route::Completion),
    ("/api/v1/models", Route::Catalog),
];

impl Route {
    pub fn classify(path: &str) -> Route {
        ROUTES
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix))
            .map_or(Route::Generic, |(_, route)| *route)
    }

    pub fn needs_credential(self) -> bool {
        self != Route::Public
    }

    /// Metric label.
    pub fn label(self) -> &'static str {
        match self {
            Route::Public => "public",
            Route::Completion => "completion",
            Route::Catalog => "catalog",
            Route::Generic => "generic",
        }
    }
}

/// Path and query relative to the upstream base URL.
///
/// `/api/v1/chat/completions?x=1` becomes `/chat/completions?x=1`.
pub fn upstream_path(path_and_query: &str) -> String {
    let rest = path_and_query
        .strip_prefix(API_PREFIX)
        .unwrap_or(path_and_query);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    }
}
