//! Connection manager: session lifecycle over a [`CoordinationAdapter`].
//!
//! One manager owns one adapter handle and drives the state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Expired -> Connecting -> ...
//!        \____________\______________\___________\______-> Closed
//! ```
//!
//! from a single background task. Every time a new session is established the
//! injected [`ConnectedHandler`] runs exactly once, inside that task, so two
//! handler runs never overlap and a session never sees the handler twice.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use registry_config::RegistryConfig;

use crate::adapter::{CoordinationAdapter, Session, SessionEvent, SessionId};
use crate::error::{RegistryError, RegistryResult};
use crate::metrics::{REGISTRY_CONNECT_ATTEMPTS, REGISTRY_CONNECTED, REGISTRY_SESSION_EXPIRED};
use crate::retry::{Backoff, RetryPolicy};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Initial state; `open` has not been called.
    Disconnected,
    /// Trying to establish a session.
    Connecting,
    /// A session is live.
    Connected,
    /// The last session was lost; its ephemeral nodes are gone.
    Expired,
    /// Shut down. Terminal.
    Closed,
}

impl ConnectionState {
    /// Legal edges of the state machine.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Expired)
                | (Expired, Connecting)
                | (Disconnected | Connecting | Connected | Expired, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Expired => write!(f, "expired"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Observable state plus the live session, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Set only while `state` is `Connected`.
    pub session: Option<SessionId>,
}

/// Receives one call per newly established session.
#[async_trait]
pub trait ConnectedHandler: Send + Sync + 'static {
    async fn on_connected(&self, conn: &ConnectionManager, session: &SessionId);
}

/// Session, retry and reconnect tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Policy applied by [`ConnectionManager::execute`].
    pub retry: RetryPolicy,
    /// Delay between attempts to establish a session. Reconnects never give up.
    pub reconnect: Backoff,
    /// Bound on a single `connect` call; a hung attempt counts as a failure.
    pub connect_timeout: Duration,
    /// Session lifetime requested from the ensemble on every connect.
    pub session_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reconnect: Backoff::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
            connect_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&RegistryConfig> for ConnectionSettings {
    fn from(cfg: &RegistryConfig) -> Self {
        Self {
            retry: RetryPolicy::from(cfg.retry()),
            reconnect: Backoff::from(cfg.reconnect()),
            connect_timeout: cfg.connect_timeout(),
            session_timeout: cfg.session_timeout(),
        }
    }
}

struct Inner {
    adapter: Arc<dyn CoordinationAdapter>,
    handler: Arc<dyn ConnectedHandler>,
    settings: ConnectionSettings,
    status: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the coordination session for one registry instance.
///
/// Cheap to clone; all clones share the same session and state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state. Call [`open`] to start.
    ///
    /// [`open`]: ConnectionManager::open
    pub fn new(
        adapter: Arc<dyn CoordinationAdapter>,
        settings: ConnectionSettings,
        handler: Arc<dyn ConnectedHandler>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            session: None,
        });
        Self {
            inner: Arc::new(Inner {
                adapter,
                handler,
                settings,
                status,
                cancel: CancellationToken::new(),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Start connecting in the background.
    ///
    /// Fails if the manager was already opened or has been closed.
    pub async fn open(&self) -> RegistryResult<()> {
        let mut driver = self.inner.driver.lock().await;
        match self.state() {
            ConnectionState::Closed => return Err(RegistryError::Closed),
            ConnectionState::Disconnected if driver.is_none() => {}
            state => {
                return Err(RegistryError::Config(format!(
                    "connection manager already opened (state {state})"
                )));
            }
        }
        self.transition(ConnectionState::Connecting, None);
        let this = self.clone();
        *driver = Some(tokio::spawn(async move { this.drive().await }));
        Ok(())
    }

    /// Shut down: stop in-flight retries, release the adapter, move to `Closed`.
    ///
    /// Calling it again is a no-op.
    pub async fn close(&self) -> RegistryResult<()> {
        self.inner.cancel.cancel();
        let driver = self.inner.driver.lock().await.take();
        if let Some(driver) = driver {
            if let Err(err) = driver.await {
                warn!(?err, "connection driver ended abnormally");
            }
        }
        if self.state().is_terminal() {
            return Ok(());
        }
        self.transition(ConnectionState::Closed, None);
        REGISTRY_CONNECTED.set(0);
        let res = self.inner.adapter.close().await;
        info!("connection manager closed");
        res
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    /// Current state and session.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Id of the live session, as tracked by this manager.
    pub fn session_id(&self) -> RegistryResult<SessionId> {
        let status = self.inner.status.borrow();
        match (status.state, &status.session) {
            (ConnectionState::Connected, Some(id)) => Ok(id.clone()),
            (ConnectionState::Closed, _) => Err(RegistryError::Closed),
            (state, _) => Err(RegistryError::NotConnected(format!(
                "connection state is {state}"
            ))),
        }
    }

    /// Re-read the session id from the adapter and check it is still the
    /// one this manager considers live. Never retried.
    pub async fn current_session(&self) -> RegistryResult<SessionId> {
        let tracked = self.session_id()?;
        let live = self.inner.adapter.session_id().await.map_err(|e| {
            RegistryError::NotConnected(format!("failed to read session id: {e}"))
        })?;
        if live != tracked {
            return Err(RegistryError::NotConnected(format!(
                "session changed from {tracked} to {live}"
            )));
        }
        Ok(live)
    }

    /// Wait until a session is live, or fail after `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> RegistryResult<SessionId> {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    match (status.state, &status.session) {
                        (ConnectionState::Connected, Some(id)) => return Ok(id.clone()),
                        (ConnectionState::Closed, _) => return Err(RegistryError::Closed),
                        _ => {}
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(RegistryError::Closed);
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            RegistryError::Timeout(format!("no session established within {timeout:?}"))
        })?
    }

    /// The adapter, borrowed for a single call. Do not hold on to session
    /// specific state across reconnects.
    pub fn adapter(&self) -> &dyn CoordinationAdapter {
        self.inner.adapter.as_ref()
    }

    /// Run `op` under the configured retry policy. Stops with
    /// [`RegistryError::Cancelled`] once the manager is closed.
    pub async fn execute<T, F, Fut>(&self, op: F) -> RegistryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RegistryResult<T>>,
    {
        self.inner
            .settings
            .retry
            .execute(&self.inner.cancel, op)
            .await
    }

    /// Apply `next` if it is a legal edge from the current state.
    fn transition(&self, next: ConnectionState, session: Option<SessionId>) -> bool {
        let mut applied = false;
        self.inner.status.send_if_modified(|status| {
            if !status.state.can_transition_to(next) {
                debug!(from = %status.state, to = %next, "ignoring illegal state transition");
                return false;
            }
            debug!(from = %status.state, to = %next, "connection state transition");
            status.state = next;
            status.session = session;
            applied = true;
            true
        });
        applied
    }

    /// One `connect` call bounded by the connect timeout.
    async fn connect_once(&self) -> RegistryResult<Session> {
        let ConnectionSettings {
            connect_timeout,
            session_timeout,
            ..
        } = self.inner.settings;
        tokio::time::timeout(connect_timeout, self.inner.adapter.connect(session_timeout))
            .await
            .map_err(|_| {
                RegistryError::Timeout(format!("connect did not finish within {connect_timeout:?}"))
            })?
    }

    /// Background loop: connect, notify, wait for loss, repeat until closed.
    async fn drive(self) {
        let cancel = self.inner.cancel.clone();
        let mut failures = 0u32;
        loop {
            REGISTRY_CONNECT_ATTEMPTS.inc();
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                res = self.connect_once() => res,
            };
            let Session { id, mut events } = match res {
                Ok(session) => session,
                Err(err) => {
                    failures += 1;
                    let delay = self.inner.settings.reconnect.jittered(failures);
                    let retry_in_ms = delay.as_millis();
                    if err.is_retryable() {
                        warn!(
                            attempt = failures,
                            retry_in_ms,
                            error = %err,
                            "connect attempt failed"
                        );
                    } else {
                        error!(
                            attempt = failures,
                            retry_in_ms,
                            error = %err,
                            "connect attempt rejected"
                        );
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };
            failures = 0;

            if !self.transition(ConnectionState::Connected, Some(id.clone())) {
                return;
            }
            REGISTRY_CONNECTED.set(1);
            info!(session_id = %id, "session established");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = self.inner.handler.on_connected(&self, &id) => {}
            }

            let reason = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                ev = events.recv() => match ev {
                    Some(SessionEvent::Expired) => "session expired".to_owned(),
                    Some(SessionEvent::ConnectionLost(reason)) => reason,
                    None => "session event stream closed".to_owned(),
                },
            };
            REGISTRY_CONNECTED.set(0);
            REGISTRY_SESSION_EXPIRED.inc();
            warn!(session_id = %id, %reason, "session lost, reconnecting");

            if !self.transition(ConnectionState::Expired, None)
                || !self.transition(ConnectionState::Connecting, None)
            {
                return;
            }
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("adapter", &self.inner.adapter)
            .field("settings", &self.inner.settings)
            .field("status", &*self.inner.status.borrow())
            .finish_non_exhaustive()
    }
}
