//! Error definitions for the mapping module

use thiserror::Error;

/// Errors raised while loading or applying a binding table
#[derive(Debug, Error)]
pub enum MappingError {
    /// The binding file could not be read
    #[error("Failed to read binding file: {0}")]
    Io(#[from] std::io::Error),

    /// The binding file is not valid TOML at all
    #[error("Malformed binding file: {0}")]
    Malformed(String),

    /// A single `[[binding]]` entry was rejected
    #[error("Invalid binding entry #{index}: {reason}")]
    InvalidEntry { index: usize, reason: String },
}
