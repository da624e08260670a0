// core/src/error.rs
//
// Error type shared by every model reader, estimator and network client.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LmError {
    /// Malformed model, count, vocabulary or parameter file.
    #[error("{file}:{line}: {message}")]
    Format {
        file: String,
        line: usize,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("binary model codec: {0}")]
    Binary(#[from] bincode::Error),

    #[error("vocabulary index: {0}")]
    Fst(#[from] fst::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or missing answer from a remote model server.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("estimation failed: {0}")]
    Estimation(String),
}

impl LmError {
    pub fn format(file: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        LmError::Format {
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for LmError {
    fn from(e: toml::de::Error) -> Self {
        LmError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for LmError {
    fn from(e: toml::ser::Error) -> Self {
        LmError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LmError>;
