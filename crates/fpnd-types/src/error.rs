//! Shared error types for the fpnd agent.

use thiserror::Error;

/// Top-level error type for the fpnd agent.
#[derive(Error, Debug)]
pub enum FpndError {
    /// The local node status API could not be reached.
    #[error("Node API connection error: {0}")]
    Connection(String),

    /// An external command could not be executed or reported failure.
    #[error("Command failed: {command} ({reason})")]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// Why it failed.
        reason: String,
    },

    /// A rendezvous listing was expected to be non-empty but was empty.
    #[error("Moon result should not be empty")]
    EmptyRendezvousResult,

    /// A state key outside the fixed node-state schema was named.
    #[error("Unknown state key: {0}")]
    UnknownStateKey(String),

    /// A reconciliation cycle was requested while another is still running.
    #[error("Reconciliation cycle already in flight")]
    CycleInFlight,

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A messaging exchange with a peer daemon failed.
    #[error("Messaging error: {0}")]
    Messaging(String),

    /// Failed to decode data returned by a collaborator.
    #[error("Decode error: {0}")]
    Decode(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for FpndError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Alias for Result with FpndError.
pub type FpndResult<T> = Result<T, FpndError>;
