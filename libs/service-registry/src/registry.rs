//! Top-level handle tying the connection manager to the registration engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use registry_config::RegistryConfig;

use crate::adapter::{CoordinationAdapter, SessionId};
use crate::client::{ConnectedHandler, ConnectionManager, ConnectionSettings, ConnectionState};
use crate::error::RegistryResult;
use crate::naming::NodeNaming;
use crate::register::{EndpointProvider, PassStatus, ReconcileReport, ServiceRegister};

/// A running registration: endpoints are republished on every new session
/// until [`close`](ServiceRegistry::close) is called.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    conn: ConnectionManager,
    register: Arc<ServiceRegister>,
}

impl ServiceRegistry {
    /// Build from configuration and start connecting.
    pub async fn start(
        adapter: Arc<dyn CoordinationAdapter>,
        config: &RegistryConfig,
        provider: EndpointProvider,
    ) -> RegistryResult<Self> {
        let naming = NodeNaming::new(config.base_path())?;
        info!(
            servers = %config.connect_string(),
            base_path = naming.base_path(),
            "starting service registry"
        );
        Self::start_with(
            adapter,
            ConnectionSettings::from(config),
            ServiceRegister::new(naming, provider),
        )
        .await
    }

    /// Start with explicit settings and a prepared engine.
    pub async fn start_with(
        adapter: Arc<dyn CoordinationAdapter>,
        settings: ConnectionSettings,
        register: ServiceRegister,
    ) -> RegistryResult<Self> {
        let register = Arc::new(register);
        let conn = ConnectionManager::new(
            adapter,
            settings,
            Arc::clone(&register) as Arc<dyn ConnectedHandler>,
        );
        conn.open().await?;
        Ok(Self { conn, register })
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }

    pub fn register(&self) -> &ServiceRegister {
        &self.register
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn status(&self) -> PassStatus {
        self.register.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<PassStatus> {
        self.register.subscribe()
    }

    /// Wait for the first session.
    pub async fn wait_connected(&self, timeout: Duration) -> RegistryResult<SessionId> {
        self.conn.wait_connected(timeout).await
    }

    /// Run a pass now against the current session, e.g. after the set of
    /// endpoints changed. Waits for any pass already running.
    pub async fn refresh(&self) -> RegistryResult<ReconcileReport> {
        self.register.run_pass(&self.conn).await
    }

    /// Stop reconnecting and release the session. Ephemeral nodes go away
    /// with it.
    pub async fn close(&self) -> RegistryResult<()> {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinator;
    use crate::models::EndpointDescriptor;
    use crate::register::PassOutcome;

    #[tokio::test]
    async fn test_start_from_config() {
        let config = RegistryConfig::parse_str(
            r#"
servers: ["127.0.0.1:2181"]
base_path: /registry
retry:
  base_delay: 1ms
reconnect:
  base_delay: 1ms
"#,
        )
        .unwrap();
        let store = MemoryCoordinator::new();
        let provider: EndpointProvider =
            Arc::new(|| vec![EndpointDescriptor::new("http://10.0.0.5:8080", "OrderApi")]);

        let registry = ServiceRegistry::start(Arc::new(store.clone()), &config, provider)
            .await
            .unwrap();
        let status = registry
            .register()
            .wait_for_pass(1, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(status.outcome, PassOutcome::Succeeded(_)));
        assert!(store.node("/registry/OrderApi/s-1001").is_some());

        let report = registry.refresh().await.unwrap();
        assert_eq!(report.registered, vec!["/registry/OrderApi/s-1001"]);
        assert_eq!(registry.status().pass, 2);

        registry.close().await.unwrap();
        assert_eq!(registry.state(), ConnectionState::Closed);
        assert!(store.node("/registry/OrderApi/s-1001").is_none());
    }
}
