//! Error types for pool construction

/// Errors from pool operations.
///
/// Acquisition and penalization never fail; the only error is building a
/// pool that could never hand out a key.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key pool requires at least one credential")]
    NoCredentials,
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
