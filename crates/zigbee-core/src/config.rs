//! Controller configuration surface

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use zigbee_wire::{Eui64, KeyData};

fn default_baudrate() -> u32 {
    115_200
}

fn default_channel() -> u8 {
    15
}

fn default_channels() -> u32 {
    0x07FF_F800 // channels 11..=26
}

/// Serial device options, forwarded verbatim to the radio driver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default)]
    pub flow_control: Option<String>,
}

/// Network parameters used when auto-forming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_channel")]
    pub channel: u8,
    /// Candidate channel mask for energy scans
    #[serde(default = "default_channels")]
    pub channels: u32,
    #[serde(default)]
    pub pan_id: Option<u16>,
    #[serde(default)]
    pub extended_pan_id: Option<Eui64>,
    #[serde(default)]
    pub network_key: Option<[u8; 16]>,
    #[serde(default)]
    pub network_key_seq: u8,
    #[serde(default)]
    pub tc_link_key: Option<[u8; 16]>,
    #[serde(default)]
    pub tc_address: Option<Eui64>,
    #[serde(default)]
    pub update_id: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            channels: default_channels(),
            pan_id: None,
            extended_pan_id: None,
            network_key: None,
            network_key_seq: 0,
            tc_link_key: None,
            tc_address: None,
            update_id: 0,
        }
    }
}

impl NetworkConfig {
    #[must_use]
    pub fn network_key_data(&self) -> Option<KeyData> {
        self.network_key.map(KeyData)
    }
}

/// OTA provider selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OtaConfig {
    /// Local directory scanned for `.ota` / `.zigbee` files
    #[serde(default)]
    pub otau_directory: Option<PathBuf>,
    #[serde(default)]
    pub ikea_provider: bool,
    #[serde(default)]
    pub ledvance_provider: bool,
    #[serde(default)]
    pub sonoff_provider: bool,
    #[serde(default)]
    pub inovelli_provider: bool,
    #[serde(default)]
    pub salus_provider: bool,
    /// Extra remote index URLs (e.g. the community aggregate index)
    #[serde(default)]
    pub extra_providers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRoutingConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartupConfig {
    #[serde(default)]
    pub auto_form: bool,
}

/// Top-level controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_path: PathBuf,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub ota: OtaConfig,
    #[serde(default)]
    pub source_routing: SourceRoutingConfig,
    #[serde(default)]
    pub startup: StartupConfig,
}

impl Config {
    /// Minimal configuration pointing at a database file
    #[must_use]
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            device: DeviceConfig::default(),
            network: NetworkConfig::default(),
            ota: OtaConfig::default(),
            source_routing: SourceRoutingConfig::default(),
            startup: StartupConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: Config =
            serde_json::from_str(r#"{"database_path": "/tmp/zigbee.db"}"#).unwrap();
        assert_eq!(config.network.channel, 15);
        assert_eq!(config.network.channels, 0x07FF_F800);
        assert!(!config.startup.auto_form);
        assert!(config.ota.otau_directory.is_none());
    }

    #[test]
    fn test_network_overrides() {
        let config: Config = serde_json::from_str(
            r#"{
                "database_path": "/tmp/zigbee.db",
                "network": {"channel": 25, "pan_id": 4660},
                "startup": {"auto_form": true}
            }"#,
        )
        .unwrap();
        assert_eq!(config.network.channel, 25);
        assert_eq!(config.network.pan_id, Some(0x1234));
        assert!(config.startup.auto_form);
    }
}
