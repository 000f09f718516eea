//! Coordination-store client interface consumed by the registry.
//!
//! This module defines `CoordinationAdapter`, the small capability set the
//! connection manager and registration engine need from an ensemble client.
//! Implementations own the wire protocol; the registry only sees these calls
//! and the session events they emit.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RegistryResult;

/// Opaque identifier of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Node lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Survives the session that created it.
    Persistent,
    /// Deleted by the store when the owning session ends.
    Ephemeral,
}

/// Result of a create call that reached the ensemble.
///
/// Failures travel as `Err(RegistryError)`; a node that is already present
/// is an expected outcome rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Notifications about the session established by [`CoordinationAdapter::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The ensemble expired the session.
    Expired,
    /// The connection dropped and the session cannot be resumed.
    ConnectionLost(String),
}

/// A freshly established session and its event stream.
///
/// The adapter drops the sender when the session ends, which the connection
/// manager treats the same as an explicit loss event.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Abstract coordination-store client.
///
/// Implementations must be cheap to share behind an `Arc`; the connection
/// manager is the only caller of `connect` and `close`.
#[async_trait]
pub trait CoordinationAdapter: Send + Sync + fmt::Debug + 'static {
    /// Establish a new session with the ensemble, asking for
    /// `session_timeout` as the negotiated session lifetime.
    async fn connect(&self, session_timeout: Duration) -> RegistryResult<Session>;

    /// Id of the current session, if one is live.
    async fn session_id(&self) -> RegistryResult<SessionId>;

    /// Create `path` and any missing ancestors as persistent nodes.
    /// Succeeds if the path already exists.
    async fn ensure_persistent_path(&self, path: &str) -> RegistryResult<()>;

    /// Whether a node exists at `path`.
    async fn exists(&self, path: &str) -> RegistryResult<bool>;

    /// Create a single node. The parent must exist.
    async fn create_node(
        &self,
        path: &str,
        mode: CreateMode,
        payload: Vec<u8>,
    ) -> RegistryResult<CreateOutcome>;

    /// Overwrite the payload of an existing node.
    async fn set_data(&self, path: &str, payload: Vec<u8>) -> RegistryResult<()>;

    /// End the current session and release the client handle.
    async fn close(&self) -> RegistryResult<()>;
}
