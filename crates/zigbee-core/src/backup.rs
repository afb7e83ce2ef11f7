//! Network state and backup model
//!
//! Backups serialize the coordinator's identity, network parameters and the
//! device table to a self-contained JSON document. Restoring rewrites the
//! coordinator through `RadioDriver::write_network_info` so the network
//! comes back with identical parameters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use zigbee_wire::Eui64;

use crate::error::CoreError;

/// A network or link key with its frame counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyInfo {
    /// 16 bytes, hex encoded
    pub key: String,
    #[serde(default)]
    pub seq: u8,
    #[serde(default)]
    pub rx_counter: u32,
    #[serde(default)]
    pub tx_counter: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_ieee: Option<Eui64>,
}

impl KeyInfo {
    #[must_use]
    pub fn from_bytes(key: &[u8; 16]) -> Self {
        Self {
            key: key.iter().map(|b| format!("{b:02x}")).collect(),
            ..Self::default()
        }
    }

    pub fn key_bytes(&self) -> Result<[u8; 16], CoreError> {
        if self.key.len() != 32 {
            return Err(CoreError::BackupIncompatible(format!(
                "Key must be 32 hex characters, got {}",
                self.key.len()
            )));
        }
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&self.key[i * 2..i * 2 + 2], 16)
                .map_err(|_| CoreError::BackupIncompatible("Key is not hex".to_string()))?;
        }
        Ok(out)
    }
}

/// The coordinator's own identity
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub ieee: Eui64,
    pub nwk: u16,
    /// 0 coordinator, 1 router, 2 end device
    pub logical_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Parameters of the running network
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInfo {
    pub extended_pan_id: Eui64,
    pub pan_id: u16,
    pub nwk_update_id: u8,
    pub nwk_manager_id: u16,
    pub channel: u8,
    pub channel_mask: u32,
    pub security_level: u8,
    pub network_key: KeyInfo,
    pub tc_link_key: KeyInfo,
    #[serde(default)]
    pub key_table: Vec<KeyInfo>,
    /// IEEE addresses of direct children of the coordinator
    #[serde(default)]
    pub children: Vec<Eui64>,
    /// Known short addresses, keyed by IEEE
    #[serde(default)]
    pub nwk_addresses: HashMap<String, u16>,
    #[serde(default)]
    pub stack_specific: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// What produced this state, e.g. "zigbee-core@0.3.1"
    #[serde(default)]
    pub source: String,
}

/// One device row inside a backup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupDevice {
    pub ieee: Eui64,
    pub nwk: u16,
    #[serde(default)]
    pub status: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A complete, restorable network snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkBackup {
    pub node_info: NodeInfo,
    pub network_info: NetworkInfo,
    pub backup_time: DateTime<Utc>,
    #[serde(default)]
    pub devices: Vec<BackupDevice>,
}

impl NetworkBackup {
    pub fn from_json(blob: &str) -> Result<Self, CoreError> {
        serde_json::from_str(blob)
            .map_err(|err| CoreError::BackupIncompatible(format!("Malformed backup: {err}")))
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string(self)
            .map_err(|err| CoreError::PersistenceBackendFailed(err.to_string()))
    }

    /// Reject blobs that cannot possibly restore a working network
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(11..=26).contains(&self.network_info.channel) {
            return Err(CoreError::BackupIncompatible(format!(
                "Channel {} outside 11..=26",
                self.network_info.channel
            )));
        }
        self.network_info.network_key.key_bytes()?;
        if self.node_info.ieee.is_unknown() || self.node_info.ieee == Eui64::default() {
            return Err(CoreError::BackupIncompatible(
                "Backup has no coordinator IEEE".to_string(),
            ));
        }
        Ok(())
    }

    /// Two backups describe the same logical network
    #[must_use]
    pub fn is_compatible_with(&self, other: &NetworkBackup) -> bool {
        self.network_info.extended_pan_id == other.network_info.extended_pan_id
            && self.network_info.pan_id == other.network_info.pan_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NetworkBackup {
        NetworkBackup {
            node_info: NodeInfo {
                ieee: "00:12:4b:00:1c:aa:bb:cc".parse().unwrap(),
                nwk: 0x0000,
                logical_type: 0,
                manufacturer: Some("Texas Instruments".into()),
                model: Some("CC2652R".into()),
                version: None,
            },
            network_info: NetworkInfo {
                extended_pan_id: "aa:bb:cc:dd:ee:ff:00:11".parse().unwrap(),
                pan_id: 0x1A62,
                nwk_update_id: 0,
                nwk_manager_id: 0,
                channel: 15,
                channel_mask: 0x0000_8000,
                security_level: 5,
                network_key: KeyInfo::from_bytes(&[1; 16]),
                tc_link_key: KeyInfo::from_bytes(b"ZigBeeAlliance09"),
                key_table: vec![],
                children: vec![],
                nwk_addresses: HashMap::new(),
                stack_specific: serde_json::Value::Null,
                metadata: serde_json::Value::Null,
                source: "zigbee-core@0.3.1".into(),
            },
            backup_time: Utc::now(),
            devices: vec![],
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let backup = sample();
        let json = backup.to_json().unwrap();
        let parsed = NetworkBackup::from_json(&json).unwrap();
        assert_eq!(parsed, backup);
    }

    #[test]
    fn test_validate_rejects_bad_channel() {
        let mut backup = sample();
        backup.network_info.channel = 9;
        assert!(matches!(
            backup.validate(),
            Err(CoreError::BackupIncompatible(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_key() {
        let mut backup = sample();
        backup.network_info.network_key.key = "zz".into();
        assert!(backup.validate().is_err());
    }

    #[test]
    fn test_key_roundtrip() {
        let key = KeyInfo::from_bytes(&[0xAB; 16]);
        assert_eq!(key.key_bytes().unwrap(), [0xAB; 16]);
    }

    #[test]
    fn test_compatibility() {
        let a = sample();
        let mut b = sample();
        assert!(a.is_compatible_with(&b));
        b.network_info.pan_id = 0x9999;
        assert!(!a.is_compatible_with(&b));
    }
}
