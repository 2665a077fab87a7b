//! Shared error types for the devlink system.

use thiserror::Error;

/// Top-level error type for devlink.
#[derive(Error, Debug)]
pub enum DevlinkError {
    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The transport link failed or is closed.
    #[error("Link error: {0}")]
    Link(String),

    /// A remote object could not be constructed.
    #[error("Construction failed for '{alias}': {reason}")]
    Construction {
        /// The alias whose Init failed.
        alias: String,
        /// Why it failed.
        reason: String,
    },

    /// A query was answered with an Error envelope.
    #[error("Remote error on {alias}.{property}: {message}")]
    Remote {
        /// Target alias.
        alias: String,
        /// Property or method name.
        property: String,
        /// Peer-provided description.
        message: String,
    },

    /// A query got no reply in time.
    #[error("Query timed out: {0}")]
    Timeout(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid user input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Alias for Result with DevlinkError.
pub type DevlinkResult<T> = Result<T, DevlinkError>;
