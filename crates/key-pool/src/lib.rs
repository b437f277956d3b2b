//! Credential pool for an upstream LLM API
//!
//! Spreads requests across several API keys round-robin and parks keys that
//! the upstream reports as rate limited. Callers hold no lock while a key is
//! in use; the pool only tracks which keys are eligible and when penalized
//! keys come back.
//!
//! Key lifecycle:
//! 1. Keys are loaded once at startup, all eligible
//! 2. `acquire` hands out the next eligible key in rotation order
//! 3. Upstream answers with a rate-limit error → `extract_signal` reads it and
//!    `penalize` parks the key until the reported (or default) resume time
//! 4. Resume time passes → the key is eligible again on the next scan
//! 5. Every key parked → `acquire` sleeps until the soonest resume time

pub mod error;
pub mod pool;
pub mod signal;

pub use error::{Error, Result};
pub use pool::{Credential, KeyPool};
pub use signal::{RateLimitSignal, extract_signal};
