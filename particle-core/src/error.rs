//! Error types for particle

use thiserror::Error;

/// Errors raised while loading configuration or setting up the client
///
/// Send failures are not represented here; they belong to the transport.
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration file could not be read
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A file or override did not hold valid JSON of the expected shape
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// One or more configuration values were rejected, joined with `; `
    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
