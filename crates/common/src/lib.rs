//! Common types shared by the key-rotation proxy crates

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
