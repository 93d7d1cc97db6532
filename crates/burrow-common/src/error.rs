//! Unified error types for the burrow workspace.
//!
//! Every library crate returns [`BurrowError`]; the CLI wraps it in
//! `anyhow` at the top level.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BurrowError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value or user-supplied option is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A resource with the requested name is already present.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the existing resource.
        kind: &'static str,
        /// Identifier of the existing resource.
        id: String,
    },

    /// A privileged kernel operation was refused or failed.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// An external host tool (`ip`, `iptables`, `nsenter`) failed.
    #[error("command `{command}` failed: {message}")]
    Command {
        /// The command line that was run.
        command: String,
        /// Exit status or spawn error description.
        message: String,
    },

    /// A container status change that the lifecycle does not allow.
    #[error("invalid status transition for {name}: {from} -> {to}")]
    InvalidTransition {
        /// Container name.
        name: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Every usable address in a subnet is already allocated.
    #[error("address pool exhausted for subnet {subnet}")]
    AddressPoolExhausted {
        /// Subnet in CIDR notation.
        subnet: String,
    },
}

impl BurrowError {
    /// Builds an [`BurrowError::Io`] for the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a [`BurrowError::Config`] from any displayable message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns `true` if this is an I/O error whose kind is `NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            Self::NotFound { .. } => true,
            _ => false,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BurrowError>;
