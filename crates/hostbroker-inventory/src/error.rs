//! Error types for hostbroker-inventory

use thiserror::Error;

/// Errors that can occur during inventory operations
#[derive(Error, Debug, Clone)]
pub enum InventoryError {
    /// Reading or writing the inventory file failed
    #[error("inventory I/O error on {path}: {message}")]
    Io {
        /// File involved
        path: String,
        /// Underlying error
        message: String,
    },

    /// The inventory file is not a YAML sequence of maps
    #[error("inventory parse error: {0}")]
    ParseError(String),

    /// Entries could not be serialized
    #[error("inventory serialize error: {0}")]
    SerializeError(String),

    /// A filter expression could not be parsed
    #[error("invalid filter {filter:?}: {message}")]
    InvalidFilter {
        /// The offending expression
        filter: String,
        /// What is wrong with it
        message: String,
    },
}

impl InventoryError {
    pub(crate) fn io(path: &std::path::Path, err: &std::io::Error) -> Self {
        InventoryError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}
