//! Typed models and codecs for registration payloads.
//!
//! Node payloads are JSON objects with camelCase keys so that discovery
//! consumers written against the same store can read them without sharing
//! this crate.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::SessionId;
use crate::error::{RegistryError, RegistryResult};
use crate::naming;

// ---------------------------------------------------------------------------
// Endpoint descriptor
// ---------------------------------------------------------------------------

/// One endpoint the hosting process wants visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDescriptor {
    /// Address consumers should call.
    pub url: String,
    /// Name of the published interface/contract.
    pub contract_identity: String,
}

impl EndpointDescriptor {
    pub fn new(url: impl Into<String>, contract_identity: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            contract_identity: contract_identity.into(),
        }
    }

    /// Reject descriptors that can never be published.
    pub fn validate(&self) -> RegistryResult<()> {
        if self.url.trim().is_empty() {
            return Err(RegistryError::InvalidInput(format!(
                "endpoint for contract '{}' has an empty url",
                self.contract_identity
            )));
        }
        if self.contract_identity.trim().is_empty() {
            return Err(RegistryError::InvalidInput(format!(
                "endpoint '{}' has an empty contract identity",
                self.url
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registration record
// ---------------------------------------------------------------------------

/// Payload written to an endpoint node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    pub url: String,
    pub service_node_name: String,
    pub endpoint_node_name: String,
    pub update_time: DateTime<Utc>,
}

impl RegistrationRecord {
    /// Derive the record for `descriptor` under `session`, stamped `now`.
    pub fn derive(
        descriptor: &EndpointDescriptor,
        session: &SessionId,
        now: DateTime<Utc>,
    ) -> RegistryResult<Self> {
        descriptor.validate()?;
        Ok(Self {
            url: descriptor.url.clone(),
            service_node_name: naming::service_node_name(&descriptor.contract_identity)?,
            endpoint_node_name: naming::endpoint_node_name(session),
            update_time: now,
        })
    }
}

// ---------------------------------------------------------------------------
// Serializer
// ---------------------------------------------------------------------------

/// Turns a record into node payload bytes. Must be lossless.
pub trait RecordSerializer: Send + Sync + fmt::Debug + 'static {
    fn serialize(&self, record: &RegistrationRecord) -> RegistryResult<Vec<u8>>;
}

/// Default serializer: JSON via [`encode`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl RecordSerializer for JsonSerializer {
    fn serialize(&self, record: &RegistrationRecord) -> RegistryResult<Vec<u8>> {
        encode(record)
    }
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

/// Encode a model value to JSON bytes.
pub fn encode<T: Serialize>(value: &T) -> RegistryResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| RegistryError::Codec(e.to_string()))
}

/// Decode JSON bytes into a typed model.
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> RegistryResult<T> {
    serde_json::from_slice(data).map_err(|e| RegistryError::Codec(e.to_string()))
}
