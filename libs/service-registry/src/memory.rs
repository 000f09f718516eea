//! In-memory coordination store.
//!
//! Behaves like a single-member ensemble: one live session at a time,
//! persistent and ephemeral nodes, ephemeral nodes removed when their
//! session ends. Faults can be injected per operation (and optionally per
//! path) to exercise retry and partial-failure handling.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::{
    CoordinationAdapter, CreateMode, CreateOutcome, Session, SessionEvent, SessionId,
};
use crate::error::{RegistryError, RegistryResult};

/// First session number handed out; sessions are named `s-<n>`.
const FIRST_SESSION: u64 = 1001;

/// Adapter calls that can be counted and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    SessionId,
    EnsurePath,
    Exists,
    Create,
    SetData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fails with a retryable transport error.
    Transient,
    /// Fails with a permission error.
    Fatal,
}

#[derive(Debug, Clone)]
struct Fault {
    op: Operation,
    path: Option<String>,
    /// `None` fails forever.
    remaining: Option<u32>,
    kind: FaultKind,
}

/// A stored node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryNode {
    pub data: Vec<u8>,
    pub mode: CreateMode,
    /// Owning session for ephemeral nodes.
    pub owner: Option<SessionId>,
}

#[derive(Debug)]
struct LiveSession {
    id: SessionId,
    timeout: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Debug)]
struct MemoryState {
    nodes: BTreeMap<String, MemoryNode>,
    session: Option<LiveSession>,
    next_session: u64,
    faults: Vec<Fault>,
    calls: HashMap<Operation, u32>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            session: None,
            next_session: FIRST_SESSION,
            faults: Vec::new(),
            calls: HashMap::new(),
        }
    }
}

impl MemoryState {
    /// Count the call and apply any matching fault.
    fn enter(&mut self, op: Operation, path: Option<&str>) -> RegistryResult<()> {
        *self.calls.entry(op).or_default() += 1;

        let Some(idx) = self.faults.iter().position(|f| {
            f.op == op && (f.path.is_none() || f.path.as_deref() == path)
        }) else {
            return Ok(());
        };
        let kind = self.faults[idx].kind;
        let exhausted = match self.faults[idx].remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            self.faults.remove(idx);
        }
        let target = path.unwrap_or("-");
        debug!(?op, path = target, ?kind, "injecting memory store fault");
        Err(match kind {
            FaultKind::Transient => {
                RegistryError::Transport(format!("injected {op:?} failure for {target}"))
            }
            FaultKind::Fatal => {
                RegistryError::PermissionDenied(format!("injected {op:?} failure for {target}"))
            }
        })
    }

    fn live_session(&self) -> RegistryResult<&SessionId> {
        self.session
            .as_ref()
            .map(|s| &s.id)
            .ok_or_else(|| RegistryError::ConnectionLoss("no live session".into()))
    }

    /// Drop the live session and every ephemeral node it owns.
    fn end_session(&mut self, event: Option<SessionEvent>) -> Option<SessionId> {
        let session = self.session.take()?;
        self.nodes
            .retain(|_, node| node.owner.as_ref() != Some(&session.id));
        if let Some(event) = event {
            // receiver may already be gone
            let _ = session.events.send(event);
        }
        debug!(session_id = %session.id, "memory store session ended");
        Some(session.id)
    }

    fn node_exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn check_path(path: &str) -> RegistryResult<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(RegistryError::InvalidInput(format!("malformed path {path:?}")));
    }
    Ok(())
}

/// In-memory [`CoordinationAdapter`].
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    // no method leaves the state half-updated, so a poisoned lock is still usable
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expire the live session as the ensemble would after a timeout.
    pub fn expire_session(&self) -> Option<SessionId> {
        self.state().end_session(Some(SessionEvent::Expired))
    }

    /// Drop the connection without a chance to resume the session.
    pub fn drop_connection(&self, reason: &str) -> Option<SessionId> {
        self.state()
            .end_session(Some(SessionEvent::ConnectionLost(reason.to_owned())))
    }

    pub fn has_session(&self) -> bool {
        self.state().session.is_some()
    }

    pub fn session(&self) -> Option<SessionId> {
        self.state().session.as_ref().map(|s| s.id.clone())
    }

    /// Session timeout requested by the client for the live session.
    pub fn session_timeout(&self) -> Option<Duration> {
        self.state().session.as_ref().map(|s| s.timeout)
    }

    /// Fail the next `times` calls of `op` (on `path`, if given).
    pub fn fail_times(&self, op: Operation, path: Option<&str>, times: u32) {
        if times == 0 {
            return;
        }
        self.push_fault(op, path, Some(times), FaultKind::Transient);
    }

    /// Fail every call of `op` (on `path`, if given) with a transient error.
    pub fn fail_always(&self, op: Operation, path: Option<&str>) {
        self.push_fault(op, path, None, FaultKind::Transient);
    }

    /// Fail every call of `op` (on `path`, if given) with a fatal error.
    pub fn fail_fatal(&self, op: Operation, path: Option<&str>) {
        self.push_fault(op, path, None, FaultKind::Fatal);
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    fn push_fault(
        &self,
        op: Operation,
        path: Option<&str>,
        remaining: Option<u32>,
        kind: FaultKind,
    ) {
        self.state().faults.push(Fault {
            op,
            path: path.map(str::to_owned),
            remaining,
            kind,
        });
    }

    /// Number of times `op` was called, failed calls included.
    pub fn calls(&self, op: Operation) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or_default()
    }

    pub fn node(&self, path: &str) -> Option<MemoryNode> {
        self.state().nodes.get(path).cloned()
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.node(path).map(|n| n.data)
    }

    pub fn owner(&self, path: &str) -> Option<SessionId> {
        self.node(path).and_then(|n| n.owner)
    }

    /// Names of the direct children of `path`, sorted.
    pub fn children(&self, path: &str) -> Vec<String> {
        let state = self.state();
        state
            .nodes
            .keys()
            .filter(|p| p.as_str() != path && parent_of(p) == path)
            .filter_map(|p| p.rsplit('/').next().map(str::to_owned))
            .collect()
    }

    /// Every stored path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.state().nodes.keys().cloned().collect()
    }

    /// Write a node directly, bypassing sessions and faults. Used to stand
    /// in for another writer racing on the same path.
    pub fn insert_node(
        &self,
        path: &str,
        mode: CreateMode,
        data: Vec<u8>,
        owner: Option<SessionId>,
    ) {
        self.state().nodes.insert(
            path.to_owned(),
            MemoryNode { data, mode, owner },
        );
    }
}

#[async_trait]
impl CoordinationAdapter for MemoryCoordinator {
    async fn connect(&self, session_timeout: Duration) -> RegistryResult<Session> {
        let mut state = self.state();
        state.enter(Operation::Connect, None)?;
        // a new connect replaces whatever session was live
        state.end_session(None);

        let id = SessionId::new(format!("s-{}", state.next_session));
        state.next_session += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.session = Some(LiveSession {
            id: id.clone(),
            timeout: session_timeout,
            events: tx,
        });
        debug!(
            session_id = %id,
            timeout_ms = session_timeout.as_millis(),
            "memory store session opened"
        );
        Ok(Session { id, events: rx })
    }

    async fn session_id(&self) -> RegistryResult<SessionId> {
        let mut state = self.state();
        state.enter(Operation::SessionId, None)?;
        state.live_session().cloned()
    }

    async fn ensure_persistent_path(&self, path: &str) -> RegistryResult<()> {
        let mut state = self.state();
        state.enter(Operation::EnsurePath, Some(path))?;
        state.live_session()?;
        check_path(path)?;

        let mut prefix = String::new();
        for segment in path.split('/').skip(1).filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            state
                .nodes
                .entry(prefix.clone())
                .or_insert_with(|| MemoryNode {
                    data: Vec::new(),
                    mode: CreateMode::Persistent,
                    owner: None,
                });
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> RegistryResult<bool> {
        let mut state = self.state();
        state.enter(Operation::Exists, Some(path))?;
        state.live_session()?;
        Ok(state.node_exists(path))
    }

    async fn create_node(
        &self,
        path: &str,
        mode: CreateMode,
        payload: Vec<u8>,
    ) -> RegistryResult<CreateOutcome> {
        let mut state = self.state();
        state.enter(Operation::Create, Some(path))?;
        let session = state.live_session()?.clone();
        check_path(path)?;

        if state.node_exists(path) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let parent = parent_of(path);
        if !state.node_exists(parent) {
            return Err(RegistryError::NoNode(parent.to_owned()));
        }
        let owner = (mode == CreateMode::Ephemeral).then_some(session);
        state.nodes.insert(
            path.to_owned(),
            MemoryNode {
                data: payload,
                mode,
                owner,
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn set_data(&self, path: &str, payload: Vec<u8>) -> RegistryResult<()> {
        let mut state = self.state();
        state.enter(Operation::SetData, Some(path))?;
        state.live_session()?;
        match state.nodes.get_mut(path) {
            Some(node) => {
                node.data = payload;
                Ok(())
            }
            None => Err(RegistryError::NoNode(path.to_owned())),
        }
    }

    async fn close(&self) -> RegistryResult<()> {
        self.state().end_session(None);
        Ok(())
    }
}
