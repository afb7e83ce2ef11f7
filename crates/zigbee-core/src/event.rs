//! Controller events
//!
//! Listeners subscribe through a broadcast channel and receive events in the
//! order the controller observed them for a given device. Listeners must not
//! block: slow receivers lag and drop, they never stall dispatch.

use zigbee_wire::{Eui64, ZclValue};

use crate::device::ClusterDirection;

#[derive(Debug, Clone)]
pub enum Event {
    /// A device joined or rejoined the network
    DeviceJoined { ieee: Eui64, nwk: u16 },
    /// ZDO device announcement received
    DeviceAnnounce { ieee: Eui64, nwk: u16 },
    /// Interview finished; fired just before `DeviceInitialized`
    RawDeviceInitialized { ieee: Eui64 },
    /// Device is fully interviewed and usable
    DeviceInitialized { ieee: Eui64 },
    /// Interview gave up after retries; the device keeps its last state
    DeviceInitFailure { ieee: Eui64 },
    /// Device left the network
    DeviceLeft { ieee: Eui64 },
    /// Device row removed
    DeviceRemoved { ieee: Eui64 },
    DeviceLastSeenUpdated { ieee: Eui64 },
    NodeDescriptorUpdated { ieee: Eui64 },
    DeviceRelaysUpdated { ieee: Eui64, relays: Vec<u16> },
    GroupAdded { group_id: u16 },
    GroupMemberAdded { group_id: u16, ieee: Eui64, endpoint: u8 },
    GroupMemberRemoved { group_id: u16, ieee: Eui64, endpoint: u8 },
    GroupRemoved { group_id: u16 },
    /// An attribute cache entry changed (report, read response or write)
    AttributeUpdated {
        ieee: Eui64,
        endpoint: u8,
        cluster: u16,
        direction: ClusterDirection,
        attrid: u16,
        value: ZclValue,
    },
    /// Cluster-specific command addressed to us
    ClusterCommand {
        ieee: Eui64,
        endpoint: u8,
        cluster: u16,
        command_id: u8,
        payload: Vec<u8>,
    },
    /// General command we do not handle internally
    GeneralCommand {
        ieee: Eui64,
        endpoint: u8,
        cluster: u16,
        command_id: u8,
        payload: Vec<u8>,
    },
    /// Frame for a cluster the registry does not know; raw bytes attached
    UnknownClusterMessage {
        ieee: Eui64,
        endpoint: u8,
        cluster: u16,
        data: Vec<u8>,
    },
    /// A permit-join window was opened or closed
    PermitDuration { duration: u8 },
}
