//! Node naming convention for registered endpoints.
//!
//! Endpoints live at `<base_path>/<service node>/<endpoint node>`. The
//! service node is derived from the contract identity and the endpoint node
//! from the session id, so discovery consumers can compute the same paths
//! independently and every endpoint disappears with its session.

use registry_config::validate_base_path;

use crate::adapter::SessionId;
use crate::error::{RegistryError, RegistryResult};

/// Map a contract identity to a path-safe token.
///
/// ASCII alphanumerics and `-`, `_`, `.` are kept; anything else (including
/// `/`) becomes `_`. A result made only of dots is prefixed with `_` since
/// `.` and `..` are not valid node names.
pub fn service_node_name(contract_identity: &str) -> RegistryResult<String> {
    let trimmed = contract_identity.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::InvalidInput(
            "contract identity is empty".into(),
        ));
    }
    let mut name: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.chars().all(|c| c == '.') {
        name.insert(0, '_');
    }
    Ok(name)
}

/// Endpoint node name for a session: the session id itself.
pub fn endpoint_node_name(session: &SessionId) -> String {
    session.as_str().to_owned()
}

/// Pure path builder rooted at a validated base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeNaming {
    base_path: String,
}

impl NodeNaming {
    /// Returns an error if `base_path` is relative, ends with `/`, or has
    /// empty segments.
    pub fn new(base_path: impl Into<String>) -> RegistryResult<Self> {
        let base_path = base_path.into();
        validate_base_path(&base_path).map_err(|e| RegistryError::Config(e.to_string()))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// `<base_path>/<service_node_name>`
    pub fn service_path(&self, service_node_name: &str) -> String {
        if self.base_path == "/" {
            format!("/{service_node_name}")
        } else {
            format!("{}/{service_node_name}", self.base_path)
        }
    }

    /// `<base_path>/<service_node_name>/<endpoint_node_name>`
    pub fn endpoint_path(&self, service_node_name: &str, endpoint_node_name: &str) -> String {
        format!(
            "{}/{endpoint_node_name}",
            self.service_path(service_node_name)
        )
    }

    /// Full endpoint path for a contract registered by `session`.
    pub fn path_for(&self, contract_identity: &str, session: &SessionId) -> RegistryResult<String> {
        Ok(self.endpoint_path(
            &service_node_name(contract_identity)?,
            &endpoint_node_name(session),
        ))
    }
}
