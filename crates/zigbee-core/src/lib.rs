//! Zigbee application controller
//!
//! This crate provides the hardware-independent half of a Zigbee home
//! automation stack: the device table and interview state machine, inbound
//! frame dispatch, attribute caching, groups, SQLite persistence with a
//! versioned schema, network backups and the OTA upgrade engine. A concrete
//! radio plugs in through the [`radio::RadioDriver`] trait.

pub mod backup;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod event;
pub mod groups;
pub mod ota;
pub mod persistence;
pub mod radio;

pub use backup::NetworkBackup;
pub use config::Config;
pub use controller::Controller;
pub use device::{Cluster, ClusterDirection, Device, DeviceStatus, Endpoint, EndpointStatus};
pub use error::CoreError;
pub use event::Event;
pub use radio::{ApsFrame, ApsPacket, Destination, RadioDriver};
