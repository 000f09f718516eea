//! # service-registry
//!
//! Publishes the endpoints of a running process as ephemeral nodes in a
//! session-based coordination store, so that consumers can discover them
//! and the store removes them automatically when the process goes away.
//!
//! This library provides:
//! - **Connection manager** that owns the session, reconnects with backoff
//!   after expiry, and exposes the connection state as a watch channel.
//! - **Registration engine** that, on every new session, reconciles the
//!   desired endpoints against the store under
//!   `<base_path>/<service>/<session>`.
//! - **Retry executor** that classifies failures and bounds attempts.
//! - **Adapter trait** over the store, with an in-memory implementation.
//!
//! ## Layout
//!
//! ```text
//! /services                 persistent
//!   /OrderApi               persistent, one per contract
//!     /s-1001               ephemeral, owned by session s-1001
//! ```

pub mod adapter;
pub mod client;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod naming;
pub mod register;
pub mod registry;
pub mod retry;

// Re-export key types for convenient access
pub use adapter::{CoordinationAdapter, CreateMode, CreateOutcome, Session, SessionEvent, SessionId};
pub use client::{
    ConnectedHandler, ConnectionManager, ConnectionSettings, ConnectionState, ConnectionStatus,
};
pub use error::{RecordFailure, RegistryError, RegistryResult};
pub use memory::MemoryCoordinator;
pub use models::{EndpointDescriptor, JsonSerializer, RecordSerializer, RegistrationRecord};
pub use naming::NodeNaming;
pub use register::{EndpointProvider, PassOutcome, PassStatus, ReconcileReport, ServiceRegister};
pub use registry::ServiceRegistry;
pub use retry::{Backoff, RetryPolicy};
