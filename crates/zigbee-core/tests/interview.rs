//! Device join and interview, end to end against a scripted radio

mod common;

use common::{spawn_responder, started_controller, test_config, wait_for_event, ScriptedDevice};
use zigbee_core::{DeviceStatus, EndpointStatus, Event};
use zigbee_wire::Eui64;

fn outlet_ieee() -> Eui64 {
    "00:11:22:33:44:55:66:77".parse().unwrap()
}

#[tokio::test]
async fn test_interview_ikea_outlet() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, frames, _radio) = started_controller(test_config(&dir)).await;
    let mut events = controller.subscribe();

    spawn_responder(
        controller.clone(),
        frames,
        vec![ScriptedDevice::ikea_outlet(outlet_ieee(), 0x1234)],
    );

    controller.handle_join(0x1234, outlet_ieee(), 0x0000).await;

    let seen = wait_for_event(&mut events, |e| matches!(e, Event::DeviceInitialized { .. })).await;

    // Exactly one device_initialized, and the join preceded it
    let initialized = seen
        .iter()
        .filter(|e| matches!(e, Event::DeviceInitialized { .. }))
        .count();
    assert_eq!(initialized, 1);
    let join_pos = seen
        .iter()
        .position(|e| matches!(e, Event::DeviceJoined { .. }))
        .expect("device_joined emitted");
    let init_pos = seen
        .iter()
        .position(|e| matches!(e, Event::DeviceInitialized { .. }))
        .unwrap();
    assert!(join_pos < init_pos);

    let device = controller.get_device(outlet_ieee()).expect("device");
    assert_eq!(device.status, DeviceStatus::Initialized);
    assert_eq!(device.nwk, 0x1234);
    assert_eq!(device.manufacturer.as_deref(), Some("IKEA of Sweden"));
    assert_eq!(device.model.as_deref(), Some("TRADFRI control outlet"));
    assert_eq!(device.manufacturer_id(), Some(4476));

    let ep1 = device.endpoints.get(&1).expect("endpoint 1");
    assert_eq!(ep1.profile_id, 0x0104);
    assert_eq!(ep1.device_type, 266);
    assert_eq!(ep1.status, EndpointStatus::Initialized);
    let in_ids: Vec<u16> = ep1.in_clusters.keys().copied().collect();
    assert_eq!(in_ids, vec![0, 3, 4, 5, 6, 8, 4096]);
    let out_ids: Vec<u16> = ep1.out_clusters.keys().copied().collect();
    assert_eq!(out_ids, vec![25]);

    let ep242 = device.endpoints.get(&242).expect("green power endpoint");
    assert_eq!(ep242.profile_id, 0xA1E0);

    // The whole tree must come back from disk identically
    controller.shutdown().await.unwrap();
    drop(controller);

    let (reloaded, _frames, _radio) = started_controller(test_config(&dir)).await;
    let device = reloaded.get_device(outlet_ieee()).expect("persisted device");
    assert_eq!(device.status, DeviceStatus::Initialized);
    assert_eq!(device.nwk, 0x1234);
    assert_eq!(device.manufacturer.as_deref(), Some("IKEA of Sweden"));
    assert_eq!(device.model.as_deref(), Some("TRADFRI control outlet"));
    assert!(device.node_desc.is_some());
    assert_eq!(device.node_desc.unwrap().manufacturer_code, 4476);
    let ep1 = device.endpoints.get(&1).expect("endpoint 1 persisted");
    assert_eq!(
        ep1.in_clusters.keys().copied().collect::<Vec<u16>>(),
        vec![0, 3, 4, 5, 6, 8, 4096]
    );
    assert!(device.endpoints.contains_key(&242));
}

#[tokio::test]
async fn test_short_address_rejoin_updates_single_row() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, frames, _radio) = started_controller(test_config(&dir)).await;
    let mut events = controller.subscribe();

    spawn_responder(
        controller.clone(),
        frames,
        vec![ScriptedDevice::ikea_outlet(outlet_ieee(), 0x1234)],
    );

    controller.handle_join(0x1234, outlet_ieee(), 0x0000).await;
    wait_for_event(&mut events, |e| matches!(e, Event::DeviceInitialized { .. })).await;

    // Rejoin under a new short address
    let mut events = controller.subscribe();
    controller.handle_join(0x5678, outlet_ieee(), 0x0000).await;

    let seen = wait_for_event(&mut events, |e| {
        matches!(e, Event::DeviceJoined { nwk: 0x5678, .. })
    })
    .await;
    assert_eq!(seen.len(), 1, "rejoin must emit only device_joined: {seen:?}");

    let device = controller.get_device(outlet_ieee()).unwrap();
    assert_eq!(device.nwk, 0x5678);
    assert!(controller.get_device_by_nwk(0x5678).is_some());
    assert!(controller.get_device_by_nwk(0x1234).is_none());
    assert_eq!(controller.devices().len(), 1);

    // Give the interview task (if any were wrongly spawned) a beat, then
    // confirm silence
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    // One row, updated in place
    controller.shutdown().await.unwrap();
    let (reloaded, _frames, _radio) = started_controller(test_config(&dir)).await;
    assert_eq!(reloaded.devices().len(), 1);
    assert_eq!(reloaded.get_device(outlet_ieee()).unwrap().nwk, 0x5678);
}

#[tokio::test]
async fn test_interview_failure_keeps_device() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, mut frames, _radio) = started_controller(test_config(&dir)).await;
    let mut events = controller.subscribe();

    // Swallow all frames: the device never answers
    tokio::spawn(async move { while frames.recv().await.is_some() {} });

    // Keep the retries short for the test
    tokio::time::pause();

    controller.handle_join(0x9999, outlet_ieee(), 0x0000).await;

    let mut failed = None;
    for _ in 0..50 {
        tokio::time::advance(std::time::Duration::from_secs(70)).await;
        match events.try_recv() {
            Ok(Event::DeviceInitFailure { ieee }) => {
                failed = Some(ieee);
                break;
            }
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::TryRecvError::Empty) => continue,
            Err(err) => panic!("event stream broke: {err}"),
        }
    }
    assert_eq!(failed, Some(outlet_ieee()));

    // The device stays at its last successful state for rediscovery
    let device = controller.get_device(outlet_ieee()).unwrap();
    assert_eq!(device.status, DeviceStatus::New);
}

#[tokio::test]
async fn test_permit_zero_closes_window() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, mut frames, radio) = started_controller(test_config(&dir)).await;
    let mut events = controller.subscribe();

    controller.permit(0, None).await.unwrap();

    // The coordinator's own window closes and the broadcast goes out
    assert_eq!(radio.state.lock().unwrap().permits, vec![0]);
    let frame = frames.recv().await.expect("permit broadcast");
    assert_eq!(frame.cluster_id, 0x0036);
    assert_eq!(frame.data[1], 0, "permit duration must be zero");

    let seen = wait_for_event(&mut events, |e| matches!(e, Event::PermitDuration { .. })).await;
    assert!(seen
        .iter()
        .all(|e| !matches!(e, Event::DeviceJoined { .. })));

    // No joins arrive while the window is closed
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_device_leave_cascades() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, frames, _radio) = started_controller(test_config(&dir)).await;
    let mut events = controller.subscribe();

    spawn_responder(
        controller.clone(),
        frames,
        vec![ScriptedDevice::ikea_outlet(outlet_ieee(), 0x1234)],
    );
    controller.handle_join(0x1234, outlet_ieee(), 0x0000).await;
    wait_for_event(&mut events, |e| matches!(e, Event::DeviceInitialized { .. })).await;

    controller.add_group_member(0x0010, outlet_ieee(), 1).unwrap();
    assert_eq!(controller.get_group(0x0010).unwrap().members.len(), 1);

    controller.handle_leave(0x1234, outlet_ieee()).await;

    let seen = wait_for_event(&mut events, |e| matches!(e, Event::DeviceRemoved { .. })).await;
    assert!(seen.iter().any(|e| matches!(e, Event::DeviceLeft { .. })));

    assert!(controller.get_device(outlet_ieee()).is_none());
    // Group membership cascaded out and the emptied group is gone
    assert!(controller.get_group(0x0010).is_none());
}
