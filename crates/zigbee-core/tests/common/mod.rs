//! Shared test harness: a scripted stub radio standing in for a coordinator
//!
//! The stub records every outbound frame and hands it to the test, which
//! builds reply packets with [`ScriptedDevice`] and feeds them back through
//! `Controller::packet_received`, exactly as a radio driver would.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use zigbee_core::backup::{KeyInfo, NetworkInfo, NodeInfo};
use zigbee_core::error::CoreError;
use zigbee_core::radio::{ApsFrame, ApsPacket, Destination, RadioDriver};
use zigbee_core::{Config, Controller, Event};
use zigbee_wire::zcl::{
    Direction, GeneralCommandId, ReadAttributeRecord, ReadAttributes, ReadAttributesResponse,
    Status, ZclHeader,
};
use zigbee_wire::zdo::{
    cluster_id, ActiveEpRsp, DescriptorCapability, FrequencyBand, LogicalType,
    MacCapabilityFlags, NodeDescRsp, NodeDescriptor, SimpleDescRsp, SimpleDescriptor, ZdoStatus,
};
use zigbee_wire::{Eui64, KeyData, WireFormat, ZclValue};

pub struct StubState {
    pub permits: Vec<u8>,
    pub written_network: Option<(NetworkInfo, NodeInfo)>,
    pub removed: Vec<Eui64>,
}

/// Radio driver that forwards every frame to the test
#[derive(Clone)]
pub struct StubRadio {
    frames: mpsc::UnboundedSender<ApsFrame>,
    pub state: Arc<Mutex<StubState>>,
}

impl StubRadio {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ApsFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                frames: tx,
                state: Arc::new(Mutex::new(StubState {
                    permits: Vec::new(),
                    written_network: None,
                    removed: Vec::new(),
                })),
            },
            rx,
        )
    }
}

#[async_trait]
impl RadioDriver for StubRadio {
    async fn probe(&self) -> bool {
        true
    }

    async fn startup(&self, _auto_form: bool) -> Result<(), CoreError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn load_network_info(&self) -> Result<(NetworkInfo, NodeInfo), CoreError> {
        Ok((sample_network_info(), sample_node_info()))
    }

    async fn write_network_info(
        &self,
        network: &NetworkInfo,
        node: &NodeInfo,
    ) -> Result<(), CoreError> {
        self.state.lock().unwrap().written_network = Some((network.clone(), node.clone()));
        Ok(())
    }

    async fn force_remove(&self, ieee: Eui64) -> Result<(), CoreError> {
        self.state.lock().unwrap().removed.push(ieee);
        Ok(())
    }

    async fn permit_ncp(&self, duration: u8) -> Result<(), CoreError> {
        self.state.lock().unwrap().permits.push(duration);
        Ok(())
    }

    async fn permit_with_key(
        &self,
        _node: Eui64,
        _key: KeyData,
        duration: u8,
    ) -> Result<(), CoreError> {
        self.state.lock().unwrap().permits.push(duration);
        Ok(())
    }

    async fn send_unicast(&self, frame: ApsFrame) -> Result<(), CoreError> {
        self.frames
            .send(frame)
            .map_err(|_| CoreError::DeliveryFailed("stub receiver gone".to_string()))
    }

    async fn send_broadcast(&self, frame: ApsFrame) -> Result<(), CoreError> {
        self.frames
            .send(frame)
            .map_err(|_| CoreError::DeliveryFailed("stub receiver gone".to_string()))
    }

    async fn send_multicast(&self, frame: ApsFrame) -> Result<(), CoreError> {
        self.frames
            .send(frame)
            .map_err(|_| CoreError::DeliveryFailed("stub receiver gone".to_string()))
    }
}

pub fn sample_network_info() -> NetworkInfo {
    NetworkInfo {
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
        source: "zigbee-core@test".to_string(),
    }
}

pub fn sample_node_info() -> NodeInfo {
    NodeInfo {
        ieee: "00:12:4b:00:1c:aa:bb:cc".parse().unwrap(),
        nwk: 0x0000,
        logical_type: 0,
        manufacturer: Some("Test".to_string()),
        model: Some("Stub".to_string()),
        version: None,
    }
}

pub fn ikea_node_descriptor() -> NodeDescriptor {
    NodeDescriptor {
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
    }
}

/// A fake device the test plays: it answers the interview and echoes
/// cluster commands
pub struct ScriptedDevice {
    pub ieee: Eui64,
    pub nwk: u16,
    pub node_descriptor: NodeDescriptor,
    pub endpoints: Vec<SimpleDescriptor>,
    /// Basic cluster attribute values served to Read-Attributes
    pub basic_attributes: HashMap<u16, ZclValue>,
}

impl ScriptedDevice {
    pub fn ikea_outlet(ieee: Eui64, nwk: u16) -> Self {
        let mut basic_attributes = HashMap::new();
        basic_attributes.insert(0x0004, ZclValue::CharString("IKEA of Sweden".into()));
        basic_attributes.insert(0x0005, ZclValue::CharString("TRADFRI control outlet".into()));

        Self {
            ieee,
            nwk,
            node_descriptor: ikea_node_descriptor(),
            endpoints: vec![
                SimpleDescriptor {
                    endpoint: 1,
                    profile: 0x0104,
                    device_type: 266,
                    device_version: 1,
                    input_clusters: vec![0, 3, 4, 5, 6, 8, 4096],
                    output_clusters: vec![25],
                },
                SimpleDescriptor {
                    endpoint: 242,
                    profile: 0xA1E0,
                    device_type: 0x0061,
                    device_version: 0,
                    input_clusters: vec![],
                    output_clusters: vec![0x0021],
                },
            ],
            basic_attributes,
        }
    }

    /// Build the reply packet for one outbound frame, or None when the
    /// script has nothing to say
    pub fn respond(&self, frame: &ApsFrame) -> Option<ApsPacket> {
        match frame.destination {
            Destination::Unicast { nwk, .. } if nwk == self.nwk => {}
            _ => return None,
        }

        if frame.profile_id == 0x0000 && frame.dst_ep == 0 {
            return self.respond_zdo(frame);
        }
        self.respond_zcl(frame)
    }

    fn zdo_packet(&self, cluster: u16, body: Vec<u8>) -> ApsPacket {
        ApsPacket {
            src_nwk: self.nwk,
            src_ieee: Some(self.ieee),
            src_ep: 0,
            dst_ep: 0,
            profile_id: 0x0000,
            cluster_id: cluster,
            data: body,
            lqi: Some(200),
            rssi: Some(-40),
        }
    }

    fn respond_zdo(&self, frame: &ApsFrame) -> Option<ApsPacket> {
        let tsn = *frame.data.first()?;

        match frame.cluster_id {
            cluster_id::NODE_DESC_REQ => {
                let mut body = vec![tsn];
                NodeDescRsp {
                    status: ZdoStatus::Success,
                    nwk: self.nwk,
                    descriptor: Some(self.node_descriptor),
                }
                .serialize(&mut body);
                Some(self.zdo_packet(cluster_id::NODE_DESC_RSP, body))
            }
            cluster_id::ACTIVE_EP_REQ => {
                let mut body = vec![tsn];
                ActiveEpRsp {
                    status: ZdoStatus::Success,
                    nwk: self.nwk,
                    endpoints: self.endpoints.iter().map(|d| d.endpoint).collect(),
                }
                .serialize(&mut body);
                Some(self.zdo_packet(cluster_id::ACTIVE_EP_RSP, body))
            }
            cluster_id::SIMPLE_DESC_REQ => {
                let endpoint = *frame.data.get(3)?;
                let descriptor = self.endpoints.iter().find(|d| d.endpoint == endpoint);
                let mut body = vec![tsn];
                SimpleDescRsp {
                    status: if descriptor.is_some() {
                        ZdoStatus::Success
                    } else {
                        ZdoStatus::InvalidEndpoint
                    },
                    nwk: self.nwk,
                    descriptor: descriptor.cloned(),
                }
                .serialize(&mut body);
                Some(self.zdo_packet(cluster_id::SIMPLE_DESC_RSP, body))
            }
            _ => None,
        }
    }

    fn respond_zcl(&self, frame: &ApsFrame) -> Option<ApsPacket> {
        let (header, payload) = ZclHeader::deserialize(&frame.data).ok()?;

        // Interview: Read-Attributes on the Basic cluster
        if header.is_general()
            && header.command_id == GeneralCommandId::ReadAttributes as u8
            && frame.cluster_id == 0x0000
        {
            let (request, _) = ReadAttributes::deserialize(payload).ok()?;
            let records = request
                .attribute_ids
                .iter()
                .map(|&attrid| match self.basic_attributes.get(&attrid) {
                    Some(value) => ReadAttributeRecord {
                        attrid,
                        status: Status::Success,
                        value: Some(value.clone()),
                    },
                    None => ReadAttributeRecord {
                        attrid,
                        status: Status::UnsupportedAttribute,
                        value: None,
                    },
                })
                .collect();

            let mut reply_header = ZclHeader::general(
                header.tsn,
                GeneralCommandId::ReadAttributesResponse,
                Direction::ServerToClient,
            );
            reply_header.frame_control.disable_default_response = true;
            let mut data = reply_header.to_bytes();
            ReadAttributesResponse { records }.serialize(&mut data);

            return Some(ApsPacket {
                src_nwk: self.nwk,
                src_ieee: Some(self.ieee),
                src_ep: frame.dst_ep,
                dst_ep: frame.src_ep,
                profile_id: frame.profile_id,
                cluster_id: frame.cluster_id,
                data,
                lqi: Some(200),
                rssi: Some(-40),
            });
        }

        // Cluster-specific commands are echoed back with the TSN in the
        // payload so tests can detect cross-delivery
        if header.is_cluster() {
            let mut reply_header = ZclHeader::cluster(header.tsn, 0xAB, Direction::ServerToClient);
            reply_header.frame_control.disable_default_response = true;
            let mut data = reply_header.to_bytes();
            data.push(header.tsn);

            return Some(ApsPacket {
                src_nwk: self.nwk,
                src_ieee: Some(self.ieee),
                src_ep: frame.dst_ep,
                dst_ep: frame.src_ep,
                profile_id: frame.profile_id,
                cluster_id: frame.cluster_id,
                data,
                lqi: Some(180),
                rssi: Some(-50),
            });
        }

        None
    }
}

/// Spawn a task that answers all outbound frames with the device scripts
pub fn spawn_responder(
    controller: Controller<StubRadio>,
    mut frames: mpsc::UnboundedReceiver<ApsFrame>,
    devices: Vec<ScriptedDevice>,
) {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            for device in &devices {
                if let Some(packet) = device.respond(&frame) {
                    controller.packet_received(packet).await;
                    break;
                }
            }
        }
    });
}

/// Collect events until the predicate matches one, with a deadline
pub async fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
    mut matches: impl FnMut(&Event) -> bool,
) -> Vec<Event> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);

    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let done = matches(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub fn test_config(dir: &tempfile::TempDir) -> Config {
    Config::new(dir.path().join("zigbee.db"))
}

pub async fn started_controller(
    config: Config,
) -> (Controller<StubRadio>, mpsc::UnboundedReceiver<ApsFrame>, StubRadio) {
    let (radio, frames) = StubRadio::new();
    let controller = Controller::new(config, radio.clone())
        .await
        .expect("controller");
    controller.start(false).await.expect("start");
    (controller, frames, radio)
}
