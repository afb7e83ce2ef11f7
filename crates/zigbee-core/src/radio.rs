//! The narrow interface the controller consumes from a radio driver
//!
//! Concrete drivers (UART framing, vendor command sets) live outside this
//! crate. The controller hands them fully-encoded APS frames and receives
//! parsed APS packets plus join/leave notifications back.

use crate::backup::{NetworkInfo, NodeInfo};
use crate::error::CoreError;
use async_trait::async_trait;
use zigbee_wire::{Eui64, KeyData};

/// Where an outbound frame is going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast { nwk: u16, ieee: Eui64 },
    Broadcast { address: u16 },
    Group { group_id: u16 },
}

/// Broadcast addresses the controller uses
pub mod broadcast_address {
    /// All devices with the receiver on when idle
    pub const RX_ON_WHEN_IDLE: u16 = 0xFFFD;
    /// All routers and the coordinator
    pub const ROUTERS_AND_COORDINATOR: u16 = 0xFFFC;
    /// Every device, including sleepy end devices
    pub const ALL_DEVICES: u16 = 0xFFFF;
}

/// A fully-encoded outbound APS frame
#[derive(Debug, Clone)]
pub struct ApsFrame {
    pub destination: Destination,
    pub profile_id: u16,
    pub cluster_id: u16,
    pub src_ep: u8,
    pub dst_ep: u8,
    pub sequence: u8,
    pub radius: u8,
    pub data: Vec<u8>,
}

/// A parsed inbound APS packet as delivered by the radio
#[derive(Debug, Clone)]
pub struct ApsPacket {
    pub src_nwk: u16,
    pub src_ieee: Option<Eui64>,
    pub src_ep: u8,
    pub dst_ep: u8,
    pub profile_id: u16,
    pub cluster_id: u16,
    pub data: Vec<u8>,
    pub lqi: Option<u8>,
    pub rssi: Option<i8>,
}

/// Operations the core calls on the radio.
///
/// Implementations are expected to be cheap to clone behind an `Arc` and
/// callable from any task.
#[async_trait]
pub trait RadioDriver: Send + Sync + 'static {
    /// Check whether the configured device responds
    async fn probe(&self) -> bool;

    /// Bring the network up, forming it first when `auto_form` is set
    async fn startup(&self, auto_form: bool) -> Result<(), CoreError>;

    /// Release the radio
    async fn shutdown(&self) -> Result<(), CoreError>;

    /// Network and node parameters of the running coordinator
    async fn load_network_info(&self) -> Result<(NetworkInfo, NodeInfo), CoreError>;

    /// Overwrite coordinator state during a backup restore
    async fn write_network_info(
        &self,
        network: &NetworkInfo,
        node: &NodeInfo,
    ) -> Result<(), CoreError>;

    /// Drop a device from the coordinator's tables without a leave handshake
    async fn force_remove(&self, ieee: Eui64) -> Result<(), CoreError>;

    /// Open the coordinator's own join window
    async fn permit_ncp(&self, duration: u8) -> Result<(), CoreError>;

    /// Permit a specific device to join using an install-code-derived key
    async fn permit_with_key(
        &self,
        node: Eui64,
        key: KeyData,
        duration: u8,
    ) -> Result<(), CoreError>;

    /// Transmit a unicast frame; resolves when the radio confirms delivery
    async fn send_unicast(&self, frame: ApsFrame) -> Result<(), CoreError>;

    /// Transmit a broadcast frame
    async fn send_broadcast(&self, frame: ApsFrame) -> Result<(), CoreError>;

    /// Transmit a group-addressed (multicast) frame
    async fn send_multicast(&self, frame: ApsFrame) -> Result<(), CoreError>;
}
