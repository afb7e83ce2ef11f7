//! OTA happy path: query, block transfer, upgrade end

mod common;

use common::{started_controller, test_config, wait_for_event, ScriptedDevice};
use std::time::Duration;
use zigbee_core::ota::OtaStatus;
use zigbee_core::radio::ApsPacket;
use zigbee_core::Event;
use zigbee_wire::ota::{FieldControl, OtaImage, OtaImageHeader, SubElement};
use zigbee_wire::zcl::{Direction, ZclHeader};
use zigbee_wire::{Eui64, WireFormat};

fn device_ieee() -> Eui64 {
    "ec:1b:bd:ff:fe:54:4f:40".parse().unwrap()
}

fn build_image(file_version: u32, firmware: &[u8]) -> Vec<u8> {
    let element_size = 6 + firmware.len() as u32;
    OtaImage {
        header: OtaImageHeader {
            header_version: 0x0100,
            header_length: 56,
            field_control: FieldControl::empty(),
            manufacturer_code: 4476,
            image_type: 0x2101,
            file_version,
            stack_version: 2,
            header_string: OtaImageHeader::header_string_from("GBL tradfri_outlet"),
            image_size: 56 + element_size,
            security_credential_version: None,
            upgrade_file_destination: None,
            minimum_hardware_version: None,
            maximum_hardware_version: None,
        },
        subelements: vec![SubElement {
            tag: zigbee_wire::ota::ElementTag::UpgradeImage,
            data: firmware.to_vec(),
        }],
    }
    .to_wire()
    .unwrap()
}

fn ota_command(tsn: u8, command_id: u8, payload: &[u8]) -> ApsPacket {
    let mut header = ZclHeader::cluster(tsn, command_id, Direction::ClientToServer);
    header.frame_control.disable_default_response = true;
    let mut data = header.to_bytes();
    data.extend_from_slice(payload);

    ApsPacket {
        src_nwk: 0x4F40,
        src_ieee: Some(device_ieee()),
        src_ep: 1,
        dst_ep: 1,
        profile_id: 0x0104,
        cluster_id: 0x0019,
        data,
        lqi: Some(190),
        rssi: Some(-44),
    }
}

#[tokio::test]
async fn test_ota_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let ota_dir = dir.path().join("otau");
    std::fs::create_dir_all(&ota_dir).unwrap();
    std::fs::write(
        ota_dir.join("tradfri_outlet_v32.ota"),
        build_image(0x0100_0020, &[0x77; 180]),
    )
    .unwrap();

    let mut config = test_config(&dir);
    config.ota.otau_directory = Some(ota_dir);

    let (controller, frames, _radio) = started_controller(config).await;
    controller.refresh_ota().await;
    let mut events = controller.subscribe();

    // The device has to exist before it can talk to us
    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel();
    {
        let device = ScriptedDevice::ikea_outlet(device_ieee(), 0x4F40);
        let interview_controller = controller.clone();
        let mut frames = frames;
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if frame.cluster_id == 0x0019 {
                    let _ = frame_tx.send(frame);
                    continue;
                }
                if let Some(packet) = device.respond(&frame) {
                    interview_controller.packet_received(packet).await;
                }
            }
        });
    }
    controller.handle_join(0x4F40, device_ieee(), 0x0000).await;
    wait_for_event(&mut events, |e| matches!(e, Event::DeviceInitialized { .. })).await;

    // Query-Next-Image announces the candidate
    let mut query = vec![0x00];
    query.extend_from_slice(&4476u16.to_le_bytes());
    query.extend_from_slice(&0x2101u16.to_le_bytes());
    query.extend_from_slice(&0x0100_0001u32.to_le_bytes());
    controller.packet_received(ota_command(0x10, 0x01, &query)).await;

    let reply = tokio::time::timeout(Duration::from_secs(5), frame_rx.recv())
        .await
        .expect("query response")
        .unwrap();
    let (header, payload) = ZclHeader::deserialize(&reply.data).unwrap();
    assert_eq!(header.command_id, 0x02);
    assert_eq!(header.tsn, 0x10);
    assert_eq!(payload[0], 0x00, "SUCCESS");
    let offered_version = u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]);
    assert_eq!(offered_version, 0x0100_0020);
    let total_size = u32::from_le_bytes([payload[9], payload[10], payload[11], payload[12]]);

    // Pull the image at strictly increasing offsets
    let mut offset = 0u32;
    let mut received = Vec::new();
    let mut tsn = 0x11u8;
    while offset < total_size {
        let mut block_req = vec![0x00];
        block_req.extend_from_slice(&4476u16.to_le_bytes());
        block_req.extend_from_slice(&0x2101u16.to_le_bytes());
        block_req.extend_from_slice(&0x0100_0020u32.to_le_bytes());
        block_req.extend_from_slice(&offset.to_le_bytes());
        block_req.push(0x40);
        controller
            .packet_received(ota_command(tsn, 0x03, &block_req))
            .await;

        let reply = tokio::time::timeout(Duration::from_secs(5), frame_rx.recv())
            .await
            .expect("block response")
            .unwrap();
        let (header, payload) = ZclHeader::deserialize(&reply.data).unwrap();
        assert_eq!(header.command_id, 0x05);
        assert_eq!(header.tsn, tsn);
        assert_eq!(payload[0], 0x00, "SUCCESS");

        let replied_offset =
            u32::from_le_bytes([payload[9], payload[10], payload[11], payload[12]]);
        assert_eq!(replied_offset, offset);
        let length = usize::from(payload[13]);
        assert!(length > 0 && length <= 0x40);
        received.extend_from_slice(&payload[14..14 + length]);

        offset += length as u32;
        tsn = tsn.wrapping_add(1);
    }
    assert_eq!(received.len() as u32, total_size);
    assert_eq!(controller.ota_status(device_ieee()), OtaStatus::Downloading);

    // The downloaded bytes are exactly the served image
    assert_eq!(received, build_image(0x0100_0020, &[0x77; 180]));

    // Upgrade end: apply immediately
    let mut end = vec![0x00];
    end.extend_from_slice(&4476u16.to_le_bytes());
    end.extend_from_slice(&0x2101u16.to_le_bytes());
    end.extend_from_slice(&0x0100_0020u32.to_le_bytes());
    controller.packet_received(ota_command(0xEE, 0x06, &end)).await;

    let reply = tokio::time::timeout(Duration::from_secs(5), frame_rx.recv())
        .await
        .expect("upgrade end response")
        .unwrap();
    let (header, payload) = ZclHeader::deserialize(&reply.data).unwrap();
    assert_eq!(header.command_id, 0x07);
    assert_eq!(header.tsn, 0xEE);
    let current_time = u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]);
    let upgrade_time = u32::from_le_bytes([payload[12], payload[13], payload[14], payload[15]]);
    assert_eq!(current_time, 0);
    assert_eq!(upgrade_time, 0);

    assert_eq!(controller.ota_status(device_ieee()), OtaStatus::Applied);
}

#[tokio::test]
async fn test_ota_no_image_available() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, frames, _radio) = started_controller(test_config(&dir)).await;
    let mut events = controller.subscribe();

    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel();
    {
        let device = ScriptedDevice::ikea_outlet(device_ieee(), 0x4F40);
        let interview_controller = controller.clone();
        let mut frames = frames;
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if frame.cluster_id == 0x0019 {
                    let _ = frame_tx.send(frame);
                    continue;
                }
                if let Some(packet) = device.respond(&frame) {
                    interview_controller.packet_received(packet).await;
                }
            }
        });
    }
    controller.handle_join(0x4F40, device_ieee(), 0x0000).await;
    wait_for_event(&mut events, |e| matches!(e, Event::DeviceInitialized { .. })).await;

    let mut query = vec![0x00];
    query.extend_from_slice(&4476u16.to_le_bytes());
    query.extend_from_slice(&0x2101u16.to_le_bytes());
    query.extend_from_slice(&0x0100_0001u32.to_le_bytes());
    controller.packet_received(ota_command(0x42, 0x01, &query)).await;

    let reply = tokio::time::timeout(Duration::from_secs(5), frame_rx.recv())
        .await
        .expect("query response")
        .unwrap();
    let (header, payload) = ZclHeader::deserialize(&reply.data).unwrap();
    assert_eq!(header.command_id, 0x02);
    assert_eq!(header.tsn, 0x42);
    assert_eq!(payload, &[0x98], "NO_IMAGE_AVAILABLE");
    assert_eq!(controller.ota_status(device_ieee()), OtaStatus::Idle);
}
