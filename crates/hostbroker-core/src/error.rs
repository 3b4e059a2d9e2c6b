//! Core error types for hostbroker-core

use hostbroker_exec::ExecError;
use hostbroker_inventory::InventoryError;
use thiserror::Error;

/// Errors surfaced by the broker and its providers
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Settings are missing or invalid
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A backend rejected our credentials
    #[error("{provider} authentication failed: {message}")]
    Authentication {
        /// Provider name
        provider: String,
        /// Backend message
        message: String,
    },

    /// The caller is not allowed to perform the operation
    #[error("permission denied: {0}")]
    Permission(String),

    /// A backend call failed
    #[error("{provider} encountered the following error: {message}")]
    Provider {
        /// Provider name
        provider: String,
        /// Backend message
        message: String,
    },

    /// Something went wrong with a specific host
    #[error("{host}: {message}")]
    Host {
        /// Hostname, or name when there is no hostname
        host: String,
        /// What went wrong
        message: String,
    },

    /// The request itself is wrong (unknown nick, ambiguous action, ...)
    #[error("{0}")]
    User(String),

    /// The provider does not offer this operation
    #[error("{operation} is not implemented for {provider}")]
    NotImplemented {
        /// Provider name
        provider: String,
        /// Operation name
        operation: String,
    },

    /// Inventory file failure
    #[error("inventory error: {0}")]
    Inventory(#[from] InventoryError),

    /// Session failure
    #[error("session error: {0}")]
    Session(#[from] ExecError),

    /// A worker could not run or report back
    #[error("worker error: {0}")]
    Worker(String),

    /// Some operations in a fan-out failed
    #[error("{} of {total} operations failed: {}", .errors.len(), summarize(.errors))]
    Batch {
        /// Number of operations attempted
        total: usize,
        /// Every failure, in task order
        errors: Vec<BrokerError>,
    },
}

fn summarize(errors: &[BrokerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl BrokerError {
    /// Shorthand for `BrokerError::Provider`
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        BrokerError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Shorthand for `BrokerError::NotImplemented`
    pub fn not_implemented(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        BrokerError::NotImplemented {
            provider: provider.into(),
            operation: operation.into(),
        }
    }

    /// Process exit code for this error
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            BrokerError::Authentication { .. } => 5,
            BrokerError::Permission(_) => 6,
            BrokerError::Provider { .. } => 7,
            BrokerError::Configuration(_) => 8,
            BrokerError::NotImplemented { .. } => 9,
            BrokerError::Host { .. } => 10,
            BrokerError::User(_) => 11,
            BrokerError::Batch { errors, .. } => errors.first().map_or(1, BrokerError::exit_code),
            BrokerError::Inventory(_) | BrokerError::Session(_) | BrokerError::Worker(_) => 1,
        }
    }
}
