//! Controller error taxonomy
//!
//! Codec and protocol errors never escape the dispatch loop; they are logged
//! and reduced to events. Resource errors propagate to the embedder.

use thiserror::Error;
use zigbee_wire::{Eui64, WireError};

#[derive(Error, Debug)]
pub enum CoreError {
    // Protocol errors: surfaced to the initiator of a request
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    // Resource errors: fatal at the controller level
    #[error("Radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("Network formation failed: {0}")]
    NetworkFormFailed(String),

    #[error("Controller is not started")]
    NotInitialized,

    #[error("Persistence backend failed: {0}")]
    PersistenceBackendFailed(String),

    #[error("Backup is incompatible: {0}")]
    BackupIncompatible(String),

    // Application errors: surfaced locally to the caller
    #[error("Device not found: {0}")]
    DeviceNotFound(Eui64),

    #[error("Attribute {attrid:#06X} not supported on cluster {cluster:#06X}")]
    AttributeNotSupported { cluster: u16, attrid: u16 },

    #[error("Unsupported cluster: {0:#06X}")]
    UnsupportedCluster(u16),

    #[error("Bad argument: {0}")]
    BadArgument(String),

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::PersistenceBackendFailed(err.to_string())
    }
}
