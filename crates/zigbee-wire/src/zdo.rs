//! ZDO (Zigbee Device Objects) frames
//!
//! ZDO frames are simpler than ZCL: a one-byte transaction sequence number
//! followed by a request- or response-specific body. Responses use the
//! request's cluster id with the high bit set.

use crate::error::WireError;
use crate::types::{Eui64, WireFormat};
use bitflags::bitflags;

/// ZDO runs on endpoint 0 under profile 0x0000
pub const ZDO_ENDPOINT: u8 = 0;
/// Response cluster id = request cluster id | 0x8000
pub const RESPONSE_BIT: u16 = 0x8000;

/// ZDO cluster identifiers
pub mod cluster_id {
    pub const NWK_ADDR_REQ: u16 = 0x0000;
    pub const IEEE_ADDR_REQ: u16 = 0x0001;
    pub const NODE_DESC_REQ: u16 = 0x0002;
    pub const SIMPLE_DESC_REQ: u16 = 0x0004;
    pub const ACTIVE_EP_REQ: u16 = 0x0005;
    pub const DEVICE_ANNCE: u16 = 0x0013;
    pub const BIND_REQ: u16 = 0x0021;
    pub const UNBIND_REQ: u16 = 0x0022;
    pub const MGMT_LQI_REQ: u16 = 0x0031;
    pub const MGMT_RTG_REQ: u16 = 0x0032;
    pub const MGMT_LEAVE_REQ: u16 = 0x0034;
    pub const MGMT_PERMIT_JOINING_REQ: u16 = 0x0036;
    pub const MGMT_NWK_UPDATE_REQ: u16 = 0x0038;

    pub const NODE_DESC_RSP: u16 = NODE_DESC_REQ | super::RESPONSE_BIT;
    pub const SIMPLE_DESC_RSP: u16 = SIMPLE_DESC_REQ | super::RESPONSE_BIT;
    pub const ACTIVE_EP_RSP: u16 = ACTIVE_EP_REQ | super::RESPONSE_BIT;
    pub const BIND_RSP: u16 = BIND_REQ | super::RESPONSE_BIT;
    pub const UNBIND_RSP: u16 = UNBIND_REQ | super::RESPONSE_BIT;
    pub const MGMT_LQI_RSP: u16 = MGMT_LQI_REQ | super::RESPONSE_BIT;
    pub const MGMT_RTG_RSP: u16 = MGMT_RTG_REQ | super::RESPONSE_BIT;
    pub const MGMT_LEAVE_RSP: u16 = MGMT_LEAVE_REQ | super::RESPONSE_BIT;
    pub const MGMT_PERMIT_JOINING_RSP: u16 = MGMT_PERMIT_JOINING_REQ | super::RESPONSE_BIT;
}

/// ZDO status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ZdoStatus {
    Success = 0x00,
    InvalidRequestType = 0x80,
    DeviceNotFound = 0x81,
    InvalidEndpoint = 0x82,
    NotActive = 0x83,
    NotSupported = 0x84,
    Timeout = 0x85,
    NoMatch = 0x86,
    NoEntry = 0x88,
    NoDescriptor = 0x89,
    InsufficientSpace = 0x8A,
    NotPermitted = 0x8B,
    TableFull = 0x8C,
    NotAuthorized = 0x8D,
}

impl TryFrom<u8> for ZdoStatus {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Success,
            0x80 => Self::InvalidRequestType,
            0x81 => Self::DeviceNotFound,
            0x82 => Self::InvalidEndpoint,
            0x83 => Self::NotActive,
            0x84 => Self::NotSupported,
            0x85 => Self::Timeout,
            0x86 => Self::NoMatch,
            0x88 => Self::NoEntry,
            0x89 => Self::NoDescriptor,
            0x8A => Self::InsufficientSpace,
            0x8B => Self::NotPermitted,
            0x8C => Self::TableFull,
            0x8D => Self::NotAuthorized,
            other => {
                return Err(WireError::ValueOutOfRange {
                    context: "ZdoStatus",
                    value: i128::from(other),
                })
            }
        })
    }
}

impl WireFormat for ZdoStatus {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (byte, rest) = u8::deserialize(data)?;
        Ok((ZdoStatus::try_from(byte)?, rest))
    }
}

/// Logical device role from the node descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogicalType {
    Coordinator = 0b000,
    Router = 0b001,
    EndDevice = 0b010,
}

impl TryFrom<u8> for LogicalType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0b000 => Ok(Self::Coordinator),
            0b001 => Ok(Self::Router),
            0b010 => Ok(Self::EndDevice),
            other => Err(WireError::ValueOutOfRange {
                context: "LogicalType",
                value: i128::from(other),
            }),
        }
    }
}

bitflags! {
    /// MAC capability flags carried in node descriptors and announcements
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MacCapabilityFlags: u8 {
        const ALTERNATE_PAN_COORDINATOR = 0b0000_0001;
        const FULL_FUNCTION_DEVICE = 0b0000_0010;
        const MAINS_POWERED = 0b0000_0100;
        const RX_ON_WHEN_IDLE = 0b0000_1000;
        const SECURITY_CAPABLE = 0b0100_0000;
        const ALLOCATE_ADDRESS = 0b1000_0000;
    }
}

bitflags! {
    /// Frequency band field of the node descriptor (5 bits)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrequencyBand: u8 {
        const FREQ_868_MHZ = 0b00001;
        const FREQ_902_MHZ = 0b00100;
        const FREQ_2400_MHZ = 0b01000;
    }
}

bitflags! {
    /// Descriptor capability field of the node descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescriptorCapability: u8 {
        const EXTENDED_ACTIVE_EP_LIST = 0b0000_0001;
        const EXTENDED_SIMPLE_DESC_LIST = 0b0000_0010;
    }
}

/// The 13-field node descriptor.
///
/// Wire layout packs the first three fields into one byte (logical type in
/// bits 0-2, descriptor-availability flags in bits 3-4) and aps_flags plus
/// the frequency band into the next (bits 0-2 and 3-7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub logical_type: LogicalType,
    pub complex_descriptor_available: bool,
    pub user_descriptor_available: bool,
    pub aps_flags: u8,
    pub frequency_band: FrequencyBand,
    pub mac_capability_flags: MacCapabilityFlags,
    pub manufacturer_code: u16,
    pub maximum_buffer_size: u8,
    pub maximum_incoming_transfer_size: u16,
    pub server_mask: u16,
    pub maximum_outgoing_transfer_size: u16,
    pub descriptor_capability_field: DescriptorCapability,
}

impl NodeDescriptor {
    #[must_use]
    pub fn is_end_device(&self) -> bool {
        self.logical_type == LogicalType::EndDevice
    }

    #[must_use]
    pub fn is_mains_powered(&self) -> bool {
        self.mac_capability_flags
            .contains(MacCapabilityFlags::MAINS_POWERED)
    }

    #[must_use]
    pub fn is_receiver_on_when_idle(&self) -> bool {
        self.mac_capability_flags
            .contains(MacCapabilityFlags::RX_ON_WHEN_IDLE)
    }
}

impl WireFormat for NodeDescriptor {
    fn serialize(&self, out: &mut Vec<u8>) {
        let mut byte0 = self.logical_type as u8;
        if self.complex_descriptor_available {
            byte0 |= 1 << 3;
        }
        if self.user_descriptor_available {
            byte0 |= 1 << 4;
        }
        out.push(byte0);
        out.push((self.aps_flags & 0x07) | (self.frequency_band.bits() << 3));
        out.push(self.mac_capability_flags.bits());
        self.manufacturer_code.serialize(out);
        out.push(self.maximum_buffer_size);
        self.maximum_incoming_transfer_size.serialize(out);
        self.server_mask.serialize(out);
        self.maximum_outgoing_transfer_size.serialize(out);
        out.push(self.descriptor_capability_field.bits());
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        WireError::check_len(data, 13)?;
        let byte0 = data[0];
        let byte1 = data[1];

        let logical_type = LogicalType::try_from(byte0 & 0x07)?;
        let mac_capability_flags = MacCapabilityFlags::from_bits_retain(data[2]);
        let (manufacturer_code, _) = u16::deserialize(&data[3..])?;
        let maximum_buffer_size = data[5];
        let (maximum_incoming_transfer_size, _) = u16::deserialize(&data[6..])?;
        let (server_mask, _) = u16::deserialize(&data[8..])?;
        let (maximum_outgoing_transfer_size, _) = u16::deserialize(&data[10..])?;

        Ok((
            Self {
                logical_type,
                complex_descriptor_available: (byte0 & 0x08) != 0,
                user_descriptor_available: (byte0 & 0x10) != 0,
                aps_flags: byte1 & 0x07,
                frequency_band: FrequencyBand::from_bits_retain(byte1 >> 3),
                mac_capability_flags,
                manufacturer_code,
                maximum_buffer_size,
                maximum_incoming_transfer_size,
                server_mask,
                maximum_outgoing_transfer_size,
                descriptor_capability_field: DescriptorCapability::from_bits_retain(data[12]),
            },
            &data[13..],
        ))
    }
}

/// Simple descriptor of one application endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleDescriptor {
    pub endpoint: u8,
    pub profile: u16,
    pub device_type: u16,
    pub device_version: u8,
    pub input_clusters: Vec<u16>,
    pub output_clusters: Vec<u16>,
}

fn serialize_cluster_list(clusters: &[u16], out: &mut Vec<u8>) {
    out.push(clusters.len() as u8);
    for cluster in clusters {
        cluster.serialize(out);
    }
}

fn deserialize_cluster_list(data: &[u8]) -> Result<(Vec<u16>, &[u8]), WireError> {
    let (count, mut data) = u8::deserialize(data)?;
    let mut clusters = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let (cluster, rest) = u16::deserialize(data)?;
        clusters.push(cluster);
        data = rest;
    }
    Ok((clusters, data))
}

impl WireFormat for SimpleDescriptor {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.endpoint);
        self.profile.serialize(out);
        self.device_type.serialize(out);
        out.push(self.device_version & 0x0F);
        serialize_cluster_list(&self.input_clusters, out);
        serialize_cluster_list(&self.output_clusters, out);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        WireError::check_len(data, 6)?;
        let endpoint = data[0];
        let (profile, _) = u16::deserialize(&data[1..])?;
        let (device_type, _) = u16::deserialize(&data[3..])?;
        let device_version = data[5] & 0x0F;
        let (input_clusters, rest) = deserialize_cluster_list(&data[6..])?;
        let (output_clusters, rest) = deserialize_cluster_list(rest)?;

        Ok((
            Self {
                endpoint,
                profile,
                device_type,
                device_version,
                input_clusters,
                output_clusters,
            },
            rest,
        ))
    }
}

/// Bind/unbind destination: a group address or an IEEE address + endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiAddress {
    Group { nwk: u16 },
    Unicast { ieee: Eui64, endpoint: u8 },
}

impl WireFormat for MultiAddress {
    fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            Self::Group { nwk } => {
                out.push(0x01);
                nwk.serialize(out);
            }
            Self::Unicast { ieee, endpoint } => {
                out.push(0x03);
                ieee.serialize(out);
                out.push(*endpoint);
            }
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (mode, data) = u8::deserialize(data)?;
        match mode {
            0x01 => {
                let (nwk, data) = u16::deserialize(data)?;
                Ok((Self::Group { nwk }, data))
            }
            0x03 => {
                let (ieee, data) = Eui64::deserialize(data)?;
                let (endpoint, data) = u8::deserialize(data)?;
                Ok((Self::Unicast { ieee, endpoint }, data))
            }
            other => Err(WireError::InvalidFrame(format!(
                "Unknown bind address mode: {other:#04X}"
            ))),
        }
    }
}

/// Mgmt_Lqi_rsp neighbor table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbor {
    pub extended_pan_id: Eui64,
    pub ieee: Eui64,
    pub nwk: u16,
    /// 0 coordinator, 1 router, 2 end device, 3 unknown
    pub device_type: u8,
    /// 0 off, 1 on, 2 unknown
    pub rx_on_when_idle: u8,
    /// 0 parent, 1 child, 2 sibling, 3 none, 4 previous child
    pub relationship: u8,
    /// 0 not accepting, 1 accepting, 2 unknown
    pub permit_joining: u8,
    pub depth: u8,
    pub lqi: u8,
}

impl WireFormat for Neighbor {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.extended_pan_id.serialize(out);
        self.ieee.serialize(out);
        self.nwk.serialize(out);
        out.push(
            (self.device_type & 0x03)
                | ((self.rx_on_when_idle & 0x03) << 2)
                | ((self.relationship & 0x07) << 4),
        );
        out.push(self.permit_joining & 0x03);
        out.push(self.depth);
        out.push(self.lqi);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (extended_pan_id, data) = Eui64::deserialize(data)?;
        let (ieee, data) = Eui64::deserialize(data)?;
        let (nwk, data) = u16::deserialize(data)?;
        WireError::check_len(data, 4)?;
        let packed = data[0];

        Ok((
            Self {
                extended_pan_id,
                ieee,
                nwk,
                device_type: packed & 0x03,
                rx_on_when_idle: (packed >> 2) & 0x03,
                relationship: (packed >> 4) & 0x07,
                permit_joining: data[1] & 0x03,
                depth: data[2],
                lqi: data[3],
            },
            &data[4..],
        ))
    }
}

/// Routing table entry status (3 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouteStatus {
    Active = 0x00,
    DiscoveryUnderway = 0x01,
    DiscoveryFailed = 0x02,
    Inactive = 0x03,
    ValidationUnderway = 0x04,
    Reserved5 = 0x05,
    Reserved6 = 0x06,
    Reserved7 = 0x07,
}

impl RouteStatus {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0x00 => Self::Active,
            0x01 => Self::DiscoveryUnderway,
            0x02 => Self::DiscoveryFailed,
            0x03 => Self::Inactive,
            0x04 => Self::ValidationUnderway,
            0x05 => Self::Reserved5,
            0x06 => Self::Reserved6,
            _ => Self::Reserved7,
        }
    }
}

/// Mgmt_Rtg_rsp routing table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub dst_nwk: u16,
    pub route_status: RouteStatus,
    pub memory_constrained: bool,
    pub many_to_one: bool,
    pub route_record_required: bool,
    pub next_hop: u16,
}

impl WireFormat for Route {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.dst_nwk.serialize(out);
        let mut flags = self.route_status as u8;
        if self.memory_constrained {
            flags |= 1 << 3;
        }
        if self.many_to_one {
            flags |= 1 << 4;
        }
        if self.route_record_required {
            flags |= 1 << 5;
        }
        out.push(flags);
        self.next_hop.serialize(out);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (dst_nwk, data) = u16::deserialize(data)?;
        let (flags, data) = u8::deserialize(data)?;
        let (next_hop, data) = u16::deserialize(data)?;
        Ok((
            Self {
                dst_nwk,
                route_status: RouteStatus::from_bits(flags),
                memory_constrained: (flags & 0x08) != 0,
                many_to_one: (flags & 0x10) != 0,
                route_record_required: (flags & 0x20) != 0,
                next_hop,
            },
            data,
        ))
    }
}

/// Device_annce body: a device announcing itself after (re)joining
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAnnounce {
    pub nwk: u16,
    pub ieee: Eui64,
    pub capability: MacCapabilityFlags,
}

impl WireFormat for DeviceAnnounce {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.nwk.serialize(out);
        self.ieee.serialize(out);
        out.push(self.capability.bits());
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (nwk, data) = u16::deserialize(data)?;
        let (ieee, data) = Eui64::deserialize(data)?;
        let (capability, data) = u8::deserialize(data)?;
        Ok((
            Self {
                nwk,
                ieee,
                capability: MacCapabilityFlags::from_bits_retain(capability),
            },
            data,
        ))
    }
}

/// Node_Desc_rsp body
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescRsp {
    pub status: ZdoStatus,
    pub nwk: u16,
    pub descriptor: Option<NodeDescriptor>,
}

impl WireFormat for NodeDescRsp {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.status.serialize(out);
        self.nwk.serialize(out);
        if let Some(descriptor) = &self.descriptor {
            descriptor.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (status, data) = ZdoStatus::deserialize(data)?;
        let (nwk, data) = u16::deserialize(data)?;
        let (descriptor, data) = if status == ZdoStatus::Success {
            let (descriptor, rest) = NodeDescriptor::deserialize(data)?;
            (Some(descriptor), rest)
        } else {
            (None, data)
        };
        Ok((
            Self {
                status,
                nwk,
                descriptor,
            },
            data,
        ))
    }
}

/// Active_EP_rsp body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEpRsp {
    pub status: ZdoStatus,
    pub nwk: u16,
    pub endpoints: Vec<u8>,
}

impl WireFormat for ActiveEpRsp {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.status.serialize(out);
        self.nwk.serialize(out);
        out.push(self.endpoints.len() as u8);
        out.extend_from_slice(&self.endpoints);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (status, data) = ZdoStatus::deserialize(data)?;
        let (nwk, data) = u16::deserialize(data)?;
        let (endpoints, data) = if status == ZdoStatus::Success {
            let (count, data) = u8::deserialize(data)?;
            let count = usize::from(count);
            WireError::check_len(data, count)?;
            (data[..count].to_vec(), &data[count..])
        } else {
            (Vec::new(), data)
        };
        Ok((
            Self {
                status,
                nwk,
                endpoints,
            },
            data,
        ))
    }
}

/// Simple_Desc_rsp body; the descriptor travels behind a one-byte length
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleDescRsp {
    pub status: ZdoStatus,
    pub nwk: u16,
    pub descriptor: Option<SimpleDescriptor>,
}

impl WireFormat for SimpleDescRsp {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.status.serialize(out);
        self.nwk.serialize(out);
        match &self.descriptor {
            Some(descriptor) => {
                let body = descriptor.to_bytes();
                out.push(body.len() as u8);
                out.extend_from_slice(&body);
            }
            None => out.push(0),
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (status, data) = ZdoStatus::deserialize(data)?;
        let (nwk, data) = u16::deserialize(data)?;
        if status != ZdoStatus::Success {
            return Ok((
                Self {
                    status,
                    nwk,
                    descriptor: None,
                },
                data,
            ));
        }

        let (length, data) = u8::deserialize(data)?;
        if length == 0 {
            return Ok((
                Self {
                    status,
                    nwk,
                    descriptor: None,
                },
                data,
            ));
        }
        let length = usize::from(length);
        WireError::check_len(data, length)?;
        let (descriptor, _) = SimpleDescriptor::deserialize(&data[..length])?;
        Ok((
            Self {
                status,
                nwk,
                descriptor: Some(descriptor),
            },
            &data[length..],
        ))
    }
}

/// Mgmt_Lqi_rsp body
#[derive(Debug, Clone, PartialEq)]
pub struct MgmtLqiRsp {
    pub status: ZdoStatus,
    pub entries: u8,
    pub start_index: u8,
    pub neighbors: Vec<Neighbor>,
}

impl WireFormat for MgmtLqiRsp {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.status.serialize(out);
        out.push(self.entries);
        out.push(self.start_index);
        out.push(self.neighbors.len() as u8);
        for neighbor in &self.neighbors {
            neighbor.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (status, data) = ZdoStatus::deserialize(data)?;
        let (entries, data) = u8::deserialize(data)?;
        let (start_index, data) = u8::deserialize(data)?;
        let (count, mut data) = u8::deserialize(data)?;
        let mut neighbors = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let (neighbor, rest) = Neighbor::deserialize(data)?;
            neighbors.push(neighbor);
            data = rest;
        }
        Ok((
            Self {
                status,
                entries,
                start_index,
                neighbors,
            },
            data,
        ))
    }
}

/// Mgmt_Rtg_rsp body
#[derive(Debug, Clone, PartialEq)]
pub struct MgmtRtgRsp {
    pub status: ZdoStatus,
    pub entries: u8,
    pub start_index: u8,
    pub routes: Vec<Route>,
}

impl WireFormat for MgmtRtgRsp {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.status.serialize(out);
        out.push(self.entries);
        out.push(self.start_index);
        out.push(self.routes.len() as u8);
        for route in &self.routes {
            route.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (status, data) = ZdoStatus::deserialize(data)?;
        let (entries, data) = u8::deserialize(data)?;
        let (start_index, data) = u8::deserialize(data)?;
        let (count, mut data) = u8::deserialize(data)?;
        let mut routes = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let (route, rest) = Route::deserialize(data)?;
            routes.push(route);
            data = rest;
        }
        Ok((
            Self {
                status,
                entries,
                start_index,
                routes,
            },
            data,
        ))
    }
}

bitflags! {
    /// Options of a Mgmt_Leave_req
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LeaveOptions: u8 {
        const REJOIN = 0b1000_0000;
        const REMOVE_CHILDREN = 0b0100_0000;
    }
}

/// Builders for the ZDO request bodies the controller sends. Every body is
/// prefixed with the frame's TSN by the caller.
pub mod request {
    use super::*;

    #[must_use]
    pub fn node_desc(tsn: u8, nwk: u16) -> Vec<u8> {
        let mut out = vec![tsn];
        nwk.serialize(&mut out);
        out
    }

    #[must_use]
    pub fn active_ep(tsn: u8, nwk: u16) -> Vec<u8> {
        let mut out = vec![tsn];
        nwk.serialize(&mut out);
        out
    }

    #[must_use]
    pub fn simple_desc(tsn: u8, nwk: u16, endpoint: u8) -> Vec<u8> {
        let mut out = vec![tsn];
        nwk.serialize(&mut out);
        out.push(endpoint);
        out
    }

    #[must_use]
    pub fn bind(tsn: u8, src: Eui64, src_endpoint: u8, cluster: u16, dst: MultiAddress) -> Vec<u8> {
        let mut out = vec![tsn];
        src.serialize(&mut out);
        out.push(src_endpoint);
        cluster.serialize(&mut out);
        dst.serialize(&mut out);
        out
    }

    /// Unbind shares the bind body; only the cluster id differs
    #[must_use]
    pub fn unbind(
        tsn: u8,
        src: Eui64,
        src_endpoint: u8,
        cluster: u16,
        dst: MultiAddress,
    ) -> Vec<u8> {
        bind(tsn, src, src_endpoint, cluster, dst)
    }

    #[must_use]
    pub fn mgmt_lqi(tsn: u8, start_index: u8) -> Vec<u8> {
        vec![tsn, start_index]
    }

    #[must_use]
    pub fn mgmt_rtg(tsn: u8, start_index: u8) -> Vec<u8> {
        vec![tsn, start_index]
    }

    #[must_use]
    pub fn mgmt_leave(tsn: u8, device: Eui64, options: LeaveOptions) -> Vec<u8> {
        let mut out = vec![tsn];
        device.serialize(&mut out);
        out.push(options.bits());
        out
    }

    #[must_use]
    pub fn mgmt_permit_joining(tsn: u8, duration: u8, tc_significance: bool) -> Vec<u8> {
        vec![tsn, duration, u8::from(tc_significance)]
    }

    #[must_use]
    pub fn mgmt_nwk_update(tsn: u8, scan_channels: u32, scan_duration: u8) -> Vec<u8> {
        let mut out = vec![tsn];
        scan_channels.serialize(&mut out);
        out.push(scan_duration);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_descriptor_roundtrip() {
        let desc = NodeDescriptor {
            logical_type: LogicalType::Router,
            complex_descriptor_available: false,
            user_descriptor_available: false,
            aps_flags: 0,
            frequency_band: FrequencyBand::FREQ_2400_MHZ,
            mac_capability_flags: MacCapabilityFlags::from_bits_retain(0x8E),
            manufacturer_code: 4476,
            maximum_buffer_size: 82,
            maximum_incoming_transfer_size: 82,
            server_mask: 0,
            maximum_outgoing_transfer_size: 82,
            descriptor_capability_field: DescriptorCapability::empty(),
        };
        let bytes = desc.to_bytes();
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 0b0100_0000);
        assert_eq!(bytes[2], 0x8E);
        let (decoded, rest) = NodeDescriptor::deserialize(&bytes).unwrap();
        assert_eq!(decoded, desc);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_simple_descriptor_roundtrip() {
        let desc = SimpleDescriptor {
            endpoint: 1,
            profile: 0x0104,
            device_type: 266,
            device_version: 1,
            input_clusters: vec![0, 3, 4, 5, 6, 8, 4096],
            output_clusters: vec![25],
        };
        let desc_bytes = desc.to_bytes();
        let (decoded, rest) = SimpleDescriptor::deserialize(&desc_bytes).unwrap();
        assert_eq!(decoded, desc);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_simple_desc_rsp_size_prefix() {
        let rsp = SimpleDescRsp {
            status: ZdoStatus::Success,
            nwk: 0x1234,
            descriptor: Some(SimpleDescriptor {
                endpoint: 242,
                profile: 0xA1E0,
                device_type: 0x0061,
                device_version: 0,
                input_clusters: vec![],
                output_clusters: vec![0x0021],
            }),
        };
        let (decoded, _) = SimpleDescRsp::deserialize(&rsp.to_bytes()).unwrap();
        assert_eq!(decoded, rsp);

        let failed = SimpleDescRsp {
            status: ZdoStatus::InvalidEndpoint,
            nwk: 0x1234,
            descriptor: None,
        };
        let (decoded, _) = SimpleDescRsp::deserialize(&failed.to_bytes()).unwrap();
        assert_eq!(decoded, failed);
    }

    #[test]
    fn test_device_announce_roundtrip() {
        let annce = DeviceAnnounce {
            nwk: 0x5678,
            ieee: Eui64([1, 2, 3, 4, 5, 6, 7, 8]),
            capability: MacCapabilityFlags::from_bits_retain(0x8E),
        };
        let (decoded, _) = DeviceAnnounce::deserialize(&annce.to_bytes()).unwrap();
        assert_eq!(decoded, annce);
    }

    #[test]
    fn test_neighbor_packed_fields() {
        let neighbor = Neighbor {
            extended_pan_id: Eui64([9; 8]),
            ieee: Eui64([1, 2, 3, 4, 5, 6, 7, 8]),
            nwk: 0x4455,
            device_type: 1,
            rx_on_when_idle: 1,
            relationship: 2,
            permit_joining: 0,
            depth: 2,
            lqi: 200,
        };
        let neighbor_bytes = neighbor.to_bytes();
        let (decoded, rest) = Neighbor::deserialize(&neighbor_bytes).unwrap();
        assert_eq!(decoded, neighbor);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_route_flags() {
        let route = Route {
            dst_nwk: 0x1000,
            route_status: RouteStatus::Active,
            memory_constrained: false,
            many_to_one: true,
            route_record_required: false,
            next_hop: 0x2000,
        };
        let (decoded, _) = Route::deserialize(&route.to_bytes()).unwrap();
        assert_eq!(decoded, route);
    }

    #[test]
    fn test_active_ep_rsp_roundtrip() {
        let rsp = ActiveEpRsp {
            status: ZdoStatus::Success,
            nwk: 0x1234,
            endpoints: vec![1, 242],
        };
        let (decoded, _) = ActiveEpRsp::deserialize(&rsp.to_bytes()).unwrap();
        assert_eq!(decoded, rsp);
    }

    #[test]
    fn test_mgmt_lqi_rsp_roundtrip() {
        let rsp = MgmtLqiRsp {
            status: ZdoStatus::Success,
            entries: 1,
            start_index: 0,
            neighbors: vec![Neighbor {
                extended_pan_id: Eui64([0xAA; 8]),
                ieee: Eui64([1; 8]),
                nwk: 1,
                device_type: 1,
                rx_on_when_idle: 1,
                relationship: 1,
                permit_joining: 2,
                depth: 1,
                lqi: 255,
            }],
        };
        let (decoded, _) = MgmtLqiRsp::deserialize(&rsp.to_bytes()).unwrap();
        assert_eq!(decoded, rsp);
    }
}
