//! Error types for Destilar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    #[error("Missing checkpoint: {0}")]
    MissingCheckpoint(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Data source error: {0}")]
    DataSource(String),

    #[error("Attack generator error: {0}")]
    Attack(String),
}

pub type Result<T> = std::result::Result<T, Error>;
