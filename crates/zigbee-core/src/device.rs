//! Device, endpoint and cluster entities
//!
//! The controller owns the device table; endpoints are owned by their device
//! and clusters by their endpoint. Entities are plain data so the table can
//! hand out clones without holding locks across suspension points.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use zigbee_wire::zcl::ReportingConfig;
use zigbee_wire::zdo::{NodeDescriptor, Neighbor, Route};
use zigbee_wire::{Eui64, TypeCode, ZclValue};

/// Interview progress of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceStatus {
    /// Nothing fetched yet
    New = 0,
    /// Node descriptor fetched
    ZdoInit = 1,
    /// Active endpoints known, simple descriptors in flight
    EndpointsInit = 2,
    /// Fully interviewed
    Initialized = 3,
    /// Terminal: the device left the network
    Left = 4,
}

impl DeviceStatus {
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::ZdoInit,
            2 => Self::EndpointsInit,
            3 => Self::Initialized,
            4 => Self::Left,
            _ => Self::New,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointStatus {
    New = 0,
    Initialized = 1,
}

/// Whether a cluster is an input (server) or output (client) cluster of its
/// endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClusterDirection {
    /// Input / server cluster
    In = 0,
    /// Output / client cluster
    Out = 1,
}

/// One cached attribute observation
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeEntry {
    pub value: ZclValue,
    pub last_updated: DateTime<Utc>,
}

/// A cluster instance on an endpoint
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    pub id: u16,
    /// attr_id -> last observed value
    pub attributes: HashMap<u16, AttributeEntry>,
    /// Attributes the device reported as unsupported; never re-queried
    pub unsupported_attributes: HashSet<u16>,
    /// Reporting configurations we have pushed to the device
    pub configured_reports: Vec<ReportingConfig>,
}

impl Cluster {
    #[must_use]
    pub fn new(id: u16) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Update the cache, returning false when a later observation already
    /// exists (the later timestamp wins)
    pub fn update_attribute(
        &mut self,
        attrid: u16,
        value: ZclValue,
        observed: DateTime<Utc>,
    ) -> bool {
        if let Some(existing) = self.attributes.get(&attrid) {
            if existing.last_updated > observed {
                return false;
            }
        }
        self.attributes.insert(
            attrid,
            AttributeEntry {
                value,
                last_updated: observed,
            },
        );
        true
    }

    #[must_use]
    pub fn attribute(&self, attrid: u16) -> Option<&ZclValue> {
        self.attributes.get(&attrid).map(|entry| &entry.value)
    }
}

/// A device endpoint
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Endpoint ID (1..=240, or 242 for Green Power)
    pub id: u8,
    pub profile_id: u16,
    pub device_type: u16,
    pub status: EndpointStatus,
    pub in_clusters: BTreeMap<u16, Cluster>,
    pub out_clusters: BTreeMap<u16, Cluster>,
}

impl Endpoint {
    #[must_use]
    pub fn new(id: u8) -> Self {
        Self {
            id,
            profile_id: 0,
            device_type: 0,
            status: EndpointStatus::New,
            in_clusters: BTreeMap::new(),
            out_clusters: BTreeMap::new(),
        }
    }

    pub fn add_input_cluster(&mut self, cluster_id: u16) -> &mut Cluster {
        self.in_clusters
            .entry(cluster_id)
            .or_insert_with(|| Cluster::new(cluster_id))
    }

    pub fn add_output_cluster(&mut self, cluster_id: u16) -> &mut Cluster {
        self.out_clusters
            .entry(cluster_id)
            .or_insert_with(|| Cluster::new(cluster_id))
    }

    #[must_use]
    pub fn cluster(&self, cluster_id: u16, direction: ClusterDirection) -> Option<&Cluster> {
        match direction {
            ClusterDirection::In => self.in_clusters.get(&cluster_id),
            ClusterDirection::Out => self.out_clusters.get(&cluster_id),
        }
    }

    pub fn cluster_mut(
        &mut self,
        cluster_id: u16,
        direction: ClusterDirection,
    ) -> Option<&mut Cluster> {
        match direction {
            ClusterDirection::In => self.in_clusters.get_mut(&cluster_id),
            ClusterDirection::Out => self.out_clusters.get_mut(&cluster_id),
        }
    }

    #[must_use]
    pub fn has_cluster(&self, cluster_id: u16) -> bool {
        self.in_clusters.contains_key(&cluster_id) || self.out_clusters.contains_key(&cluster_id)
    }
}

/// A Zigbee device on the network
#[derive(Debug, Clone)]
pub struct Device {
    /// Permanent EUI-64 address
    pub ieee: Eui64,
    /// Short network address; may change on rejoin
    pub nwk: u16,
    pub status: DeviceStatus,
    pub node_desc: Option<NodeDescriptor>,
    /// From the Basic cluster, read during interview
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub endpoints: BTreeMap<u8, Endpoint>,
    pub lqi: Option<u8>,
    pub rssi: Option<i8>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Source-route relay list, reported by the radio
    pub relays: Option<Vec<u16>>,
    /// Neighbor table from the last Mgmt_Lqi scan
    pub neighbors: Vec<Neighbor>,
    /// Routing table from the last Mgmt_Rtg scan
    pub routes: Vec<Route>,
}

impl Device {
    #[must_use]
    pub fn new(ieee: Eui64, nwk: u16) -> Self {
        Self {
            ieee,
            nwk,
            status: DeviceStatus::New,
            node_desc: None,
            manufacturer: None,
            model: None,
            endpoints: BTreeMap::new(),
            lqi: None,
            rssi: None,
            last_seen: None,
            relays: None,
            neighbors: Vec::new(),
            routes: Vec::new(),
        }
    }

    pub fn add_endpoint(&mut self, endpoint_id: u8) -> &mut Endpoint {
        self.endpoints
            .entry(endpoint_id)
            .or_insert_with(|| Endpoint::new(endpoint_id))
    }

    #[must_use]
    pub fn manufacturer_id(&self) -> Option<u16> {
        self.node_desc.as_ref().map(|nd| nd.manufacturer_code)
    }

    /// All endpoints have their simple descriptor
    #[must_use]
    pub fn all_endpoints_init(&self) -> bool {
        !self.endpoints.is_empty()
            && self
                .endpoints
                .values()
                .all(|ep| ep.status != EndpointStatus::New)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.node_desc.is_some() && self.all_endpoints_init()
    }

    /// Display name: model, or the short address
    #[must_use]
    pub fn display_name(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| format!("{:#06x}", self.nwk))
    }

    /// The wire type of an attribute as last observed, for persistence
    #[must_use]
    pub fn attribute_type(
        &self,
        endpoint: u8,
        cluster: u16,
        direction: ClusterDirection,
        attrid: u16,
    ) -> Option<TypeCode> {
        self.endpoints
            .get(&endpoint)?
            .cluster(cluster, direction)?
            .attribute(attrid)
            .map(ZclValue::type_code)
    }
}
