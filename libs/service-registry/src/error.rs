//! Error types for registry operations.
//!
//! Every remote outcome is an explicit value so the retry executor can
//! classify failures with [`RegistryError::is_retryable`] instead of
//! matching on adapter internals.

use thiserror::Error;

/// Top-level error type for the service-registry crate.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// Network or transport-level failure talking to the ensemble.
    #[error("transport error: {0}")]
    Transport(String),

    /// A remote call did not complete in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The session dropped or is not yet re-established mid-call.
    #[error("connection loss: {0}")]
    ConnectionLoss(String),

    /// Node creation raced with another writer.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// The node (or its parent) vanished between check and write.
    #[error("no node: {0}")]
    NoNode(String),

    /// The ensemble rejected the call for this identity.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed input that can never succeed remotely.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error (e.g. malformed base path).
    #[error("configuration error: {0}")]
    Config(String),

    /// Codec error during serialization or deserialization.
    #[error("codec error: {0}")]
    Codec(String),

    /// The connection manager has no live session.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The connection manager was closed.
    #[error("connection manager closed")]
    Closed,

    /// A retry loop observed close and stopped.
    #[error("operation cancelled")]
    Cancelled,

    /// Retry policy gave up on a transient failure.
    #[error("operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<RegistryError>,
    },

    /// Some records in a reconciliation pass failed; the rest were applied.
    #[error("registration pass partially failed: {failed} of {total} records failed")]
    PartialReconcile {
        failed: usize,
        total: usize,
        failures: Vec<RecordFailure>,
    },
}

/// One record that could not be reconciled.
#[derive(Debug, Clone)]
pub struct RecordFailure {
    /// Full node path, or the contract identity if no path could be derived.
    pub target: String,
    pub error: RegistryError,
}

impl RegistryError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry (transport, timeout, connection loss, or a
    /// node-existence conflict).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::Transport(_)
                | RegistryError::Timeout(_)
                | RegistryError::ConnectionLoss(_)
                | RegistryError::NodeExists(_)
                | RegistryError::NoNode(_)
        )
    }

    /// Returns true if this error is a create/update race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RegistryError::NodeExists(_) | RegistryError::NoNode(_))
    }

    /// Returns true if the error came from closing the connection manager.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, RegistryError::Closed | RegistryError::Cancelled)
    }
}

/// Shorthand result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
