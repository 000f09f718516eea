//! Registration engine: reconcile desired endpoints against the store.
//!
//! A pass reads the live session id, asks the provider for the endpoints
//! to publish, and for each one either refreshes the existing endpoint node
//! or creates it as an ephemeral node owned by the session. Records are
//! independent: one failing record is logged and reported, the others are
//! still applied.
//!
//! Nothing here removes nodes left behind by older sessions; the store
//! deletes them when those sessions end.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::adapter::{CreateMode, CreateOutcome, SessionId};
use crate::client::{ConnectedHandler, ConnectionManager};
use crate::error::{RecordFailure, RegistryError, RegistryResult};
use crate::metrics::{REGISTRY_PASS_NOT_RUN, REGISTRY_PASS_PARTIAL, REGISTRY_PASS_SUCCEEDED};
use crate::models::{EndpointDescriptor, JsonSerializer, RecordSerializer, RegistrationRecord};
use crate::naming::NodeNaming;

/// Supplies the endpoints to publish. Called once per pass.
pub type EndpointProvider = Arc<dyn Fn() -> Vec<EndpointDescriptor> + Send + Sync>;

/// Summary of a pass where every record was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    /// Endpoint paths written, in provider order.
    pub registered: Vec<String>,
}

/// What happened on the most recent pass.
#[derive(Debug, Clone)]
pub enum PassOutcome {
    /// No pass has finished yet.
    Pending,
    Succeeded(ReconcileReport),
    /// Some records were applied, `failed` of `total` were not.
    PartiallyFailed {
        failed: usize,
        total: usize,
        failures: Vec<RecordFailure>,
    },
    /// The pass could not start (e.g. no live session).
    NotRun(RegistryError),
}

impl PassOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PassOutcome::Succeeded(_))
    }
}

/// Pass counter plus the latest outcome.
#[derive(Debug, Clone)]
pub struct PassStatus {
    /// Number of finished passes.
    pub pass: u64,
    pub outcome: PassOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upserted {
    Created,
    Updated,
}

/// Registration engine. Install it as the [`ConnectedHandler`] of a
/// [`ConnectionManager`] so every new session gets a full pass.
pub struct ServiceRegister {
    naming: NodeNaming,
    provider: EndpointProvider,
    serializer: Arc<dyn RecordSerializer>,
    status: watch::Sender<PassStatus>,
    // one pass at a time, whichever path triggered it
    pass_lock: Mutex<()>,
}

impl ServiceRegister {
    pub fn new(naming: NodeNaming, provider: EndpointProvider) -> Self {
        let (status, _) = watch::channel(PassStatus {
            pass: 0,
            outcome: PassOutcome::Pending,
        });
        Self {
            naming,
            provider,
            serializer: Arc::new(JsonSerializer),
            status,
            pass_lock: Mutex::new(()),
        }
    }

    /// Replace the default JSON serializer.
    pub fn with_serializer(mut self, serializer: Arc<dyn RecordSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn naming(&self) -> &NodeNaming {
        &self.naming
    }

    /// Latest pass status.
    pub fn status(&self) -> PassStatus {
        self.status.borrow().clone()
    }

    /// Watch pass completions.
    pub fn subscribe(&self) -> watch::Receiver<PassStatus> {
        self.status.subscribe()
    }

    /// Wait until at least `pass` passes have finished.
    pub async fn wait_for_pass(&self, pass: u64, timeout: Duration) -> RegistryResult<PassStatus> {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if status.pass >= pass {
                        return Ok(status.clone());
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(RegistryError::Closed);
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            RegistryError::Timeout(format!(
                "registration pass {pass} not finished within {timeout:?}"
            ))
        })?
    }

    /// Run one pass and publish its outcome, waiting for any pass already
    /// in flight to finish first.
    pub async fn run_pass(&self, conn: &ConnectionManager) -> RegistryResult<ReconcileReport> {
        let _guard = self.pass_lock.lock().await;
        let res = self.reconcile(conn).await;
        let outcome = match &res {
            Ok(report) => {
                info!(
                    session_id = %report.session_id,
                    endpoints = report.registered.len(),
                    "registration pass succeeded"
                );
                REGISTRY_PASS_SUCCEEDED.inc();
                PassOutcome::Succeeded(report.clone())
            }
            Err(RegistryError::PartialReconcile {
                failed,
                total,
                failures,
            }) => {
                warn!(failed, total, "registration pass partially failed");
                REGISTRY_PASS_PARTIAL.inc();
                PassOutcome::PartiallyFailed {
                    failed: *failed,
                    total: *total,
                    failures: failures.clone(),
                }
            }
            Err(err) => {
                if err.is_shutdown() {
                    debug!(error = %err, "registration pass skipped, registry closed");
                } else {
                    error!(error = %err, "registration pass could not run");
                }
                REGISTRY_PASS_NOT_RUN.inc();
                PassOutcome::NotRun(err.clone())
            }
        };
        self.status.send_modify(|status| {
            status.pass += 1;
            status.outcome = outcome;
        });
        res
    }

    /// One reconciliation pass against the live session.
    ///
    /// Returns [`RegistryError::NotConnected`] without touching the store if
    /// there is no live session, and [`RegistryError::PartialReconcile`] if
    /// any record failed (the others are still applied).
    pub async fn reconcile(&self, conn: &ConnectionManager) -> RegistryResult<ReconcileReport> {
        let session = conn.current_session().await?;
        let started_at = Utc::now();
        let descriptors = (self.provider)();
        let total = descriptors.len();
        debug!(session_id = %session, total, "starting registration pass");

        let mut failures = Vec::new();
        let mut records = Vec::with_capacity(total);
        // service node name -> contract that claimed it in this pass
        let mut claimed: HashMap<String, &str> = HashMap::new();
        for descriptor in &descriptors {
            let contract = descriptor.contract_identity.as_str();
            let record = match RegistrationRecord::derive(descriptor, &session, started_at) {
                Ok(record) => record,
                Err(error) => {
                    warn!(contract, error = %error, "skipping invalid endpoint");
                    failures.push(RecordFailure {
                        target: contract.to_owned(),
                        error,
                    });
                    continue;
                }
            };
            if let Some(first) = claimed.get(&record.service_node_name) {
                let path = self
                    .naming
                    .endpoint_path(&record.service_node_name, &record.endpoint_node_name);
                warn!(contract, %path, claimed_by = first, "skipping colliding endpoint");
                failures.push(RecordFailure {
                    error: RegistryError::InvalidInput(format!(
                        "contract '{contract}' collides with contract '{first}' at {path}"
                    )),
                    target: path,
                });
                continue;
            }
            claimed.insert(record.service_node_name.clone(), contract);
            records.push(record);
        }

        // parents first, once per service
        let mut parents: HashMap<String, Option<RegistryError>> = HashMap::new();
        for record in &records {
            let service_path = self.naming.service_path(&record.service_node_name);
            if parents.contains_key(&service_path) {
                continue;
            }
            let res = conn
                .execute(|| conn.adapter().ensure_persistent_path(&service_path))
                .await;
            if let Err(err) = &res {
                warn!(path = %service_path, error = %err, "failed to ensure service path");
            }
            parents.insert(service_path, res.err());
        }

        let mut registered = Vec::with_capacity(records.len());
        for record in &records {
            let service_path = self.naming.service_path(&record.service_node_name);
            let path = self
                .naming
                .endpoint_path(&record.service_node_name, &record.endpoint_node_name);

            if let Some(Some(err)) = parents.get(&service_path) {
                failures.push(RecordFailure {
                    target: path,
                    error: err.clone(),
                });
                continue;
            }

            let res = match self.serializer.serialize(record) {
                Ok(payload) => self.upsert(conn, &path, &payload).await,
                Err(err) => Err(err),
            };
            match res {
                Ok(Upserted::Created) => {
                    debug!(%path, "endpoint node created");
                    registered.push(path);
                }
                Ok(Upserted::Updated) => {
                    debug!(%path, "endpoint node refreshed");
                    registered.push(path);
                }
                Err(error) => {
                    warn!(%path, error = %error, "failed to register endpoint");
                    failures.push(RecordFailure {
                        target: path,
                        error,
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(RegistryError::PartialReconcile {
                failed: failures.len(),
                total,
                failures,
            });
        }
        Ok(ReconcileReport {
            session_id: session,
            started_at,
            registered,
        })
    }

    /// Refresh the node if present, else create it ephemeral. A create that
    /// loses a race surfaces as `NodeExists` so the retry re-checks and
    /// takes the update path.
    async fn upsert(
        &self,
        conn: &ConnectionManager,
        path: &str,
        payload: &[u8],
    ) -> RegistryResult<Upserted> {
        conn.execute(|| async move {
            let adapter = conn.adapter();
            if adapter.exists(path).await? {
                adapter.set_data(path, payload.to_vec()).await?;
                return Ok(Upserted::Updated);
            }
            match adapter
                .create_node(path, CreateMode::Ephemeral, payload.to_vec())
                .await?
            {
                CreateOutcome::Created => Ok(Upserted::Created),
                CreateOutcome::AlreadyExists => Err(RegistryError::NodeExists(path.to_owned())),
            }
        })
        .await
    }
}

#[async_trait]
impl ConnectedHandler for ServiceRegister {
    async fn on_connected(&self, conn: &ConnectionManager, session: &SessionId) {
        debug!(session_id = %session, "session established, registering endpoints");
        // outcome is logged and published by run_pass
        let _ = self.run_pass(conn).await;
    }
}

impl fmt::Debug for ServiceRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegister")
            .field("naming", &self.naming)
            .field("serializer", &self.serializer)
            .finish_non_exhaustive()
    }
}
