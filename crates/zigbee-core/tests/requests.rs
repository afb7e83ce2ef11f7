//! Request correlation: TSN wrap-around, per-device ordering and the
//! default-response policy

mod common;

use common::{spawn_responder, started_controller, test_config, wait_for_event, ScriptedDevice};
use std::time::Duration;
use zigbee_core::radio::ApsPacket;
use zigbee_core::Event;
use zigbee_wire::zcl::{Attribute, Direction, GeneralCommandId, WriteAttributes, ZclHeader};
use zigbee_wire::{Eui64, WireFormat, ZclValue};

fn ieee_n(n: u8) -> Eui64 {
    format!("00:11:22:33:44:55:66:{n:02x}").parse().unwrap()
}

async fn join_devices(count: u8) -> (
    zigbee_core::Controller<common::StubRadio>,
    tokio::sync::broadcast::Receiver<Event>,
    tempfile::TempDir,
) {
    let dir = tempfile::tempdir().unwrap();
    let (controller, frames, _radio) = started_controller(test_config(&dir)).await;
    let mut events = controller.subscribe();

    let devices: Vec<ScriptedDevice> = (0..count)
        .map(|n| ScriptedDevice::ikea_outlet(ieee_n(n), 0x1000 + u16::from(n)))
        .collect();
    spawn_responder(controller.clone(), frames, devices);

    for n in 0..count {
        controller
            .handle_join(0x1000 + u16::from(n), ieee_n(n), 0x0000)
            .await;
    }
    let mut initialized = 0;
    while initialized < count {
        let seen = wait_for_event(&mut events, |e| {
            matches!(e, Event::DeviceInitialized { .. })
        })
        .await;
        initialized += seen
            .iter()
            .filter(|e| matches!(e, Event::DeviceInitialized { .. }))
            .count() as u8;
    }

    (controller, events, dir)
}

#[tokio::test]
async fn test_three_hundred_requests_survive_tsn_wrap() {
    let (controller, _events, _dir) = join_devices(10).await;

    // 300 correlated requests while the 8-bit TSN wraps; every reply must
    // land with its own caller
    for round in 0..30 {
        for n in 0..10u8 {
            let tsn_before = round * 10 + u16::from(n);
            let reply = controller
                .send_cluster_command(ieee_n(n), 1, 0x0006, 0x02, vec![], None, true)
                .await
                .unwrap_or_else(|err| panic!("request {tsn_before} failed: {err}"))
                .expect("reply bytes");

            // The scripted device echoes the request TSN in the payload
            let (header, payload) = ZclHeader::deserialize(&reply).unwrap();
            assert_eq!(payload, &[header.tsn]);
        }
    }
}

#[tokio::test]
async fn test_single_in_flight_per_device() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, mut frames, _radio) = started_controller(test_config(&dir)).await;
    let mut events = controller.subscribe();

    // Interview runs against the script, then we take over frame handling
    let device = ScriptedDevice::ikea_outlet(ieee_n(1), 0x1001);
    let (script_tx, mut script_rx) = tokio::sync::mpsc::unbounded_channel();
    let interview_controller = controller.clone();
    let handoff = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Some(packet) = device.respond(&frame) {
                if frame.profile_id == 0x0000 || frame.cluster_id == 0x0000 {
                    interview_controller.packet_received(packet).await;
                    continue;
                }
            }
            // Post-interview cluster traffic goes to the test body
            let _ = script_tx.send(frame);
        }
    });

    controller.handle_join(0x1001, ieee_n(1), 0x0000).await;
    wait_for_event(&mut events, |e| matches!(e, Event::DeviceInitialized { .. })).await;

    // First request is transmitted immediately
    let first = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .send_cluster_command(ieee_n(1), 1, 0x0006, 0x01, vec![], None, true)
                .await
        })
    };
    let first_frame = script_rx.recv().await.expect("first frame");

    // Second request must queue behind the un-replied first one
    let second = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .send_cluster_command(ieee_n(1), 1, 0x0006, 0x00, vec![], None, true)
                .await
        })
    };
    assert!(
        tokio::time::timeout(Duration::from_millis(200), script_rx.recv())
            .await
            .is_err(),
        "second frame left before the first reply"
    );

    // Reply to the first; the second is released in order
    let (header, _) = ZclHeader::deserialize(&first_frame.data).unwrap();
    let mut reply_header = ZclHeader::cluster(header.tsn, 0xAB, Direction::ServerToClient);
    reply_header.frame_control.disable_default_response = true;
    let mut data = reply_header.to_bytes();
    data.push(header.tsn);
    controller
        .packet_received(ApsPacket {
            src_nwk: 0x1001,
            src_ieee: Some(ieee_n(1)),
            src_ep: 1,
            dst_ep: 1,
            profile_id: 0x0104,
            cluster_id: 0x0006,
            data,
            lqi: None,
            rssi: None,
        })
        .await;

    first.await.unwrap().unwrap();

    let second_frame = tokio::time::timeout(Duration::from_secs(5), script_rx.recv())
        .await
        .expect("second frame after first reply")
        .unwrap();
    let (second_header, _) = ZclHeader::deserialize(&second_frame.data).unwrap();
    assert_eq!(second_header.command_id, 0x00);

    let mut reply_header =
        ZclHeader::cluster(second_header.tsn, 0xAB, Direction::ServerToClient);
    reply_header.frame_control.disable_default_response = true;
    let mut data = reply_header.to_bytes();
    data.push(second_header.tsn);
    controller
        .packet_received(ApsPacket {
            src_nwk: 0x1001,
            src_ieee: Some(ieee_n(1)),
            src_ep: 1,
            dst_ep: 1,
            profile_id: 0x0104,
            cluster_id: 0x0006,
            data,
            lqi: None,
            rssi: None,
        })
        .await;
    second.await.unwrap().unwrap();

    handoff.abort();
}

fn write_attributes_packet(ieee: Eui64, nwk: u16, tsn: u8, disable_default_response: bool) -> ApsPacket {
    let mut header = ZclHeader::general(
        tsn,
        GeneralCommandId::WriteAttributes,
        Direction::ClientToServer,
    );
    header.frame_control.disable_default_response = disable_default_response;
    let mut data = header.to_bytes();
    WriteAttributes {
        attributes: vec![Attribute {
            attrid: 0x0010,
            value: ZclValue::CharString("closet".into()),
        }],
    }
    .serialize(&mut data);

    ApsPacket {
        src_nwk: nwk,
        src_ieee: Some(ieee),
        src_ep: 1,
        dst_ep: 1,
        profile_id: 0x0104,
        cluster_id: 0x0000,
        data,
        lqi: None,
        rssi: None,
    }
}

#[tokio::test]
async fn test_default_response_policy() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, frames, _radio) = started_controller(test_config(&dir)).await;
    let mut events = controller.subscribe();

    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel();
    {
        let device = ScriptedDevice::ikea_outlet(ieee_n(1), 0x1001);
        let interview_controller = controller.clone();
        let mut frames = frames;
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if frame.profile_id == 0x0000 {
                    if let Some(packet) = device.respond(&frame) {
                        interview_controller.packet_received(packet).await;
                        continue;
                    }
                }
                if let Some(packet) = device.respond(&frame) {
                    // Interview attribute reads still need answers
                    if let Ok((header, _)) = ZclHeader::deserialize(&frame.data) {
                        if header.command_id == GeneralCommandId::ReadAttributes as u8
                            && header.is_general()
                        {
                            interview_controller.packet_received(packet).await;
                            continue;
                        }
                    }
                }
                let _ = frame_tx.send(frame);
            }
        });
    }

    controller.handle_join(0x1001, ieee_n(1), 0x0000).await;
    wait_for_event(&mut events, |e| matches!(e, Event::DeviceInitialized { .. })).await;

    // Write with disable-default-response set: only the write response
    controller
        .packet_received(write_attributes_packet(ieee_n(1), 0x1001, 0x21, true))
        .await;

    let reply = tokio::time::timeout(Duration::from_secs(2), frame_rx.recv())
        .await
        .expect("write response")
        .unwrap();
    let (header, payload) = ZclHeader::deserialize(&reply.data).unwrap();
    assert_eq!(header.tsn, 0x21);
    assert_eq!(
        header.command_id,
        GeneralCommandId::WriteAttributesResponse as u8
    );
    assert_eq!(payload, &[0x00]);

    assert!(
        tokio::time::timeout(Duration::from_millis(300), frame_rx.recv())
            .await
            .is_err(),
        "no default response may follow the explicit write response"
    );

    // Write with the bit clear: still just the explicit response
    controller
        .packet_received(write_attributes_packet(ieee_n(1), 0x1001, 0x22, false))
        .await;
    let reply = tokio::time::timeout(Duration::from_secs(2), frame_rx.recv())
        .await
        .expect("write response")
        .unwrap();
    let (header, _) = ZclHeader::deserialize(&reply.data).unwrap();
    assert_eq!(header.tsn, 0x22);
    assert_eq!(
        header.command_id,
        GeneralCommandId::WriteAttributesResponse as u8
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(300), frame_rx.recv())
            .await
            .is_err()
    );

    // A report (no command-specific response) with the bit clear earns
    // exactly one default response with the request's TSN and SUCCESS
    let mut header = ZclHeader::general(
        0x33,
        GeneralCommandId::ReportAttributes,
        Direction::ServerToClient,
    );
    header.frame_control.disable_default_response = false;
    let mut data = header.to_bytes();
    zigbee_wire::zcl::ReportAttributes {
        reports: vec![Attribute {
            attrid: 0x0000,
            value: ZclValue::Bool(true),
        }],
    }
    .serialize(&mut data);
    controller
        .packet_received(ApsPacket {
            src_nwk: 0x1001,
            src_ieee: Some(ieee_n(1)),
            src_ep: 1,
            dst_ep: 1,
            profile_id: 0x0104,
            cluster_id: 0x0006,
            data,
            lqi: None,
            rssi: None,
        })
        .await;

    let reply = tokio::time::timeout(Duration::from_secs(2), frame_rx.recv())
        .await
        .expect("default response")
        .unwrap();
    let (header, payload) = ZclHeader::deserialize(&reply.data).unwrap();
    assert_eq!(header.command_id, GeneralCommandId::DefaultResponse as u8);
    assert_eq!(header.tsn, 0x33);
    // command id echo + SUCCESS
    assert_eq!(payload, &[GeneralCommandId::ReportAttributes as u8, 0x00]);

    assert!(
        tokio::time::timeout(Duration::from_millis(300), frame_rx.recv())
            .await
            .is_err(),
        "exactly one default response"
    );

    // The report also updated the attribute cache
    let device = controller.get_device(ieee_n(1)).unwrap();
    let on_off = device.endpoints[&1]
        .cluster(0x0006, zigbee_core::ClusterDirection::In)
        .unwrap();
    assert_eq!(on_off.attribute(0x0000), Some(&ZclValue::Bool(true)));
}
