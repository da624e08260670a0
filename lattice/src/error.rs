// lattice/src/error.rs
//
// Errors raised while reading, rewriting or searching a lattice. Format
// errors from the line readers arrive wrapped in `LmError` and keep their
// file and line.

use libngram_core::LmError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LatticeError {
    #[error(transparent)]
    Lm(#[from] LmError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON output: {0}")]
    Json(#[from] serde_json::Error),

    /// Structural problem: missing initial/final node, cycles, unreachable
    /// nodes, self-loops on the end points.
    #[error("malformed lattice {lattice}: {message}")]
    Malformed { lattice: String, message: String },

    /// Expansion or reduction would grow the lattice past its node limit.
    #[error("lattice {lattice} exceeds {limit} nodes")]
    NodeLimit { lattice: String, limit: usize },

    #[error("time limit exceeded")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl LatticeError {
    pub fn malformed(lattice: &str, message: impl Into<String>) -> Self {
        LatticeError::Malformed {
            lattice: lattice.to_string(),
            message: message.into(),
        }
    }

    /// Resource-bound failures: the item is skipped, the batch goes on.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            LatticeError::NodeLimit { .. } | LatticeError::Timeout | LatticeError::Cancelled
        )
    }
}

impl From<toml::de::Error> for LatticeError {
    fn from(e: toml::de::Error) -> Self {
        LatticeError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for LatticeError {
    fn from(e: toml::ser::Error) -> Self {
        LatticeError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LatticeError>;
