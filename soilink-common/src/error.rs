use thiserror::Error;

/// Common error type for soilink components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using soilink's Error.
pub type Result<T> = std::result::Result<T, Error>;
