//! The application controller
//!
//! Owns the device table, drives interviews, dispatches inbound APS traffic
//! to the right handler, correlates replies by transaction sequence number
//! and writes every mutation through to the persistence engine. All public
//! entry points are cheap to call from any task; per-device delivery is
//! serialized through an IEEE-keyed lock so requests reach a device in
//! submission order.

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use zigbee_wire::registry::{self, basic_attrs, profiles, ClusterRegistry};
use zigbee_wire::zcl::{
    Attribute, ConfigureReporting, ConfigureReportingResponse, Direction, GeneralCommandId,
    ReadAttributeRecord, ReadAttributes, ReadAttributesResponse, ReportAttributes,
    ReportingConfig, Status, WriteAttributes, WriteAttributesResponse, ZclHeader,
};
use zigbee_wire::zdo::{
    self, cluster_id, ActiveEpRsp, DeviceAnnounce, LeaveOptions, MgmtLqiRsp, MgmtRtgRsp,
    NodeDescRsp, NodeDescriptor, SimpleDescRsp, ZdoStatus, RESPONSE_BIT, ZDO_ENDPOINT,
};
use zigbee_wire::{Eui64, KeyData, WireFormat, ZclValue};

use crate::backup::{BackupDevice, NetworkBackup};
use crate::config::Config;
use crate::device::{ClusterDirection, Device, DeviceStatus, EndpointStatus};
use crate::error::CoreError;
use crate::event::Event;
use crate::groups::Groups;
use crate::ota::{
    client_commands, server_commands, ImageBlockRequest, ImageBlockResponse, OtaEngine,
    QueryNextImage, UpgradeEndRequest,
};
use crate::persistence::{DbCommand, Store};
use crate::radio::{broadcast_address, ApsFrame, ApsPacket, Destination, RadioDriver};

/// Reply timeout for ordinary unicast requests
pub const UNICAST_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// Reply timeout for interview steps; sleepy end devices are slow
pub const INTERVIEW_STEP_TIMEOUT: Duration = Duration::from_secs(60);

/// The coordinator's application endpoint
const COORDINATOR_ENDPOINT: u8 = 1;

const NODE_DESC_ATTEMPTS: u32 = 3;
const ACTIVE_EP_ATTEMPTS: u32 = 3;
const SIMPLE_DESC_ATTEMPTS: u32 = 2;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

struct PendingReply {
    tx: oneshot::Sender<Vec<u8>>,
    /// Cluster the reply must arrive on
    cluster: u16,
    /// Endpoints of the expected reply, from the reply's perspective
    src_ep: u8,
    dst_ep: u8,
}

struct Inner<R: RadioDriver> {
    radio: R,
    config: Config,
    registry: ClusterRegistry,
    devices: DashMap<Eui64, Device>,
    nwk_index: DashMap<u16, Eui64>,
    groups: Groups,
    store: Store,
    ota: OtaEngine,
    events: broadcast::Sender<Event>,
    tsn: AtomicU8,
    pending: Mutex<HashMap<(Eui64, u8), PendingReply>>,
    device_locks: DashMap<Eui64, Arc<tokio::sync::Mutex<()>>>,
    /// Devices with an interview in flight; repeated announces don't stack
    interviewing: DashMap<Eui64, ()>,
    backups: Mutex<Vec<NetworkBackup>>,
    running: AtomicBool,
}

/// The central orchestrator. Clones share one controller.
pub struct Controller<R: RadioDriver> {
    inner: Arc<Inner<R>>,
}

impl<R: RadioDriver> Clone for Controller<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

async fn with_retries<'a, T, F>(attempts: u32, mut op: F) -> Result<T, CoreError>
where
    F: FnMut() -> Pin<Box<dyn Future<Output = Result<T, CoreError>> + Send + 'a>>,
{
    let mut delay = RETRY_BACKOFF_BASE;
    let mut last_error = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(
                err @ (CoreError::Timeout
                | CoreError::DeliveryFailed(_)
                | CoreError::InvalidResponse(_)),
            ) => {
                tracing::debug!("Attempt {attempt}/{attempts} failed: {err}");
                last_error = Some(err);
                if attempt < attempts {
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                    tokio::time::sleep(delay + jitter).await;
                    delay *= 2;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error.unwrap_or(CoreError::Timeout))
}

impl<R: RadioDriver> Controller<R> {
    /// Open the database, load the device tree and wrap the radio.
    /// The network is not touched until [`Controller::start`].
    pub async fn new(config: Config, radio: R) -> Result<Self, CoreError> {
        let (store, loaded) = Store::open(&config.database_path).await?;

        let devices = DashMap::new();
        let nwk_index = DashMap::new();
        for device in loaded.devices {
            nwk_index.insert(device.nwk, device.ieee);
            devices.insert(device.ieee, device);
        }

        let groups = Groups::new();
        for group in loaded.groups {
            groups.add_group(group.group_id, Some(group.name.clone()));
            for (ieee, endpoint) in group.members {
                groups.add_member(group.group_id, ieee, endpoint);
            }
        }

        let ota = OtaEngine::new(&config.ota);
        let (events, _) = broadcast::channel(256);

        Ok(Self {
            inner: Arc::new(Inner {
                radio,
                registry: ClusterRegistry::builtin(),
                devices,
                nwk_index,
                groups,
                store,
                ota,
                events,
                tsn: AtomicU8::new(0),
                pending: Mutex::new(HashMap::new()),
                device_locks: DashMap::new(),
                interviewing: DashMap::new(),
                backups: Mutex::new(loaded.backups),
                config,
                running: AtomicBool::new(false),
            }),
        })
    }

    /// Subscribe to controller events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: Event) {
        let _ = self.inner.events.send(event);
    }

    /// Bring the network up
    pub async fn start(&self, auto_form: bool) -> Result<(), CoreError> {
        if !self.inner.radio.probe().await {
            return Err(CoreError::RadioUnavailable(
                "radio did not respond to probe".to_string(),
            ));
        }
        self.inner.radio.startup(auto_form).await?;
        self.inner.running.store(true, Ordering::SeqCst);

        // Provider indices refresh in the background
        let controller = self.clone();
        tokio::spawn(async move {
            controller.inner.ota.refresh().await;
        });

        tracing::info!("Controller started (auto_form={auto_form})");
        Ok(())
    }

    /// Flush persistence and release the radio
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.store.flush().await;
        self.inner.radio.shutdown().await
    }

    /// Allocate the next transaction sequence number; wraps through 0..=255
    pub fn next_tsn(&self) -> u8 {
        self.inner.tsn.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_device(&self, ieee: Eui64) -> Option<Device> {
        self.inner.devices.get(&ieee).map(|d| d.clone())
    }

    #[must_use]
    pub fn get_device_by_nwk(&self, nwk: u16) -> Option<Device> {
        let ieee = *self.inner.nwk_index.get(&nwk)?;
        self.get_device(ieee)
    }

    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        self.inner.devices.iter().map(|d| d.clone()).collect()
    }

    #[must_use]
    pub fn ota_status(&self, ieee: Eui64) -> crate::ota::OtaStatus {
        self.inner.ota.device_status(ieee)
    }

    fn nwk_of(&self, ieee: Eui64) -> Result<u16, CoreError> {
        self.inner
            .devices
            .get(&ieee)
            .map(|d| d.nwk)
            .ok_or(CoreError::DeviceNotFound(ieee))
    }

    fn device_lock(&self, ieee: Eui64) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .device_locks
            .entry(ieee)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_pending(&self, ieee: Eui64, tsn: u8) {
        let mut pending = self.inner.pending.lock().unwrap();
        pending.remove(&(ieee, tsn));
    }

    fn resolve_pending(
        &self,
        ieee: Eui64,
        tsn: u8,
        cluster: u16,
        src_ep: u8,
        dst_ep: u8,
        data: &[u8],
    ) -> bool {
        let mut pending = self.inner.pending.lock().unwrap();
        let matches = pending
            .get(&(ieee, tsn))
            .map(|entry| {
                entry.cluster == cluster && entry.src_ep == src_ep && entry.dst_ep == dst_ep
            })
            .unwrap_or(false);
        if !matches {
            return false;
        }

        if let Some(entry) = pending.remove(&(ieee, tsn)) {
            let _ = entry.tx.send(data.to_vec());
        }
        true
    }

    /// Send a unicast request. Delivery per device is FIFO: the call holds
    /// the device's lock until the reply arrives or the timeout fires.
    /// Returns the raw reply frame when `expect_reply` is set.
    #[allow(clippy::too_many_arguments)]
    pub async fn request(
        &self,
        ieee: Eui64,
        profile: u16,
        cluster: u16,
        src_ep: u8,
        dst_ep: u8,
        sequence: u8,
        data: Vec<u8>,
        expect_reply: bool,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(CoreError::NotInitialized);
        }
        let nwk = self.nwk_of(ieee)?;

        let lock = self.device_lock(ieee);
        let _guard = lock.lock().await;

        let reply_rx = if expect_reply {
            let (tx, rx) = oneshot::channel();
            let expected_cluster = if profile == profiles::ZDO {
                cluster | RESPONSE_BIT
            } else {
                cluster
            };
            let mut pending = self.inner.pending.lock().unwrap();
            pending.insert(
                (ieee, sequence),
                PendingReply {
                    tx,
                    cluster: expected_cluster,
                    // The reply comes back with the endpoints swapped
                    src_ep: dst_ep,
                    dst_ep: src_ep,
                },
            );
            Some(rx)
        } else {
            None
        };

        let frame = ApsFrame {
            destination: Destination::Unicast { nwk, ieee },
            profile_id: profile,
            cluster_id: cluster,
            src_ep,
            dst_ep,
            sequence,
            radius: 0,
            data,
        };

        if let Err(err) = self.inner.radio.send_unicast(frame).await {
            self.release_pending(ieee, sequence);
            return Err(err);
        }

        let Some(rx) = reply_rx else {
            return Ok(None);
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => {
                self.release_pending(ieee, sequence);
                Err(CoreError::InvalidResponse("reply channel closed".into()))
            }
            Err(_) => {
                self.release_pending(ieee, sequence);
                Err(CoreError::Timeout)
            }
        }
    }

    /// Replies bypass the per-device queue so packet dispatch never blocks
    /// behind an in-flight request to the same device.
    async fn send_reply(
        &self,
        ieee: Eui64,
        profile: u16,
        cluster: u16,
        src_ep: u8,
        dst_ep: u8,
        sequence: u8,
        data: Vec<u8>,
    ) -> Result<(), CoreError> {
        let nwk = self.nwk_of(ieee)?;
        self.inner
            .radio
            .send_unicast(ApsFrame {
                destination: Destination::Unicast { nwk, ieee },
                profile_id: profile,
                cluster_id: cluster,
                src_ep,
                dst_ep,
                sequence,
                radius: 0,
                data,
            })
            .await
    }

    /// Broadcast a frame to the given broadcast address
    #[allow(clippy::too_many_arguments)]
    pub async fn broadcast(
        &self,
        profile: u16,
        cluster: u16,
        src_ep: u8,
        dst_ep: u8,
        address: u16,
        sequence: u8,
        data: Vec<u8>,
    ) -> Result<(), CoreError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(CoreError::NotInitialized);
        }
        self.inner
            .radio
            .send_broadcast(ApsFrame {
                destination: Destination::Broadcast { address },
                profile_id: profile,
                cluster_id: cluster,
                src_ep,
                dst_ep,
                sequence,
                radius: 0,
                data,
            })
            .await
    }

    /// Send a group-addressed frame
    pub async fn multicast(
        &self,
        group_id: u16,
        profile: u16,
        cluster: u16,
        src_ep: u8,
        sequence: u8,
        data: Vec<u8>,
    ) -> Result<(), CoreError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(CoreError::NotInitialized);
        }
        self.inner
            .radio
            .send_multicast(ApsFrame {
                destination: Destination::Group { group_id },
                profile_id: profile,
                cluster_id: cluster,
                src_ep,
                dst_ep: 0,
                sequence,
                radius: 0,
                data,
            })
            .await
    }

    /// Open (or close, with duration 0) the join window. With a target node
    /// the permit is unicast to that router only.
    pub async fn permit(&self, duration: u8, node: Option<Eui64>) -> Result<(), CoreError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(CoreError::NotInitialized);
        }
        if duration == 255 {
            return Err(CoreError::BadArgument(
                "permit duration must be 0..=254".to_string(),
            ));
        }

        let tsn = self.next_tsn();
        let body = zdo::request::mgmt_permit_joining(tsn, duration, true);

        match node {
            Some(ieee) => {
                self.request(
                    ieee,
                    profiles::ZDO,
                    cluster_id::MGMT_PERMIT_JOINING_REQ,
                    ZDO_ENDPOINT,
                    ZDO_ENDPOINT,
                    tsn,
                    body,
                    false,
                    UNICAST_REPLY_TIMEOUT,
                )
                .await?;
            }
            None => {
                self.broadcast(
                    profiles::ZDO,
                    cluster_id::MGMT_PERMIT_JOINING_REQ,
                    ZDO_ENDPOINT,
                    ZDO_ENDPOINT,
                    broadcast_address::ROUTERS_AND_COORDINATOR,
                    tsn,
                    body,
                )
                .await?;
                self.inner.radio.permit_ncp(duration).await?;
            }
        }

        self.emit(Event::PermitDuration { duration });
        Ok(())
    }

    /// Let a specific device join using an install-code-derived link key
    pub async fn permit_with_key(
        &self,
        node: Eui64,
        key: KeyData,
        duration: u8,
    ) -> Result<(), CoreError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(CoreError::NotInitialized);
        }
        self.inner.radio.permit_with_key(node, key, duration).await?;
        self.emit(Event::PermitDuration { duration });
        Ok(())
    }

    // --- Events from the radio -------------------------------------------

    /// A device joined or rejoined the network
    pub async fn handle_join(&self, nwk: u16, ieee: Eui64, _parent_nwk: u16) {
        let now = Utc::now();
        let mut rejoined_initialized = false;

        match self.inner.devices.get_mut(&ieee) {
            Some(mut device) => {
                if device.nwk != nwk {
                    tracing::info!(
                        "Device {ieee} rejoined: nwk {:#06x} -> {nwk:#06x}",
                        device.nwk
                    );
                    self.inner.nwk_index.remove(&device.nwk);
                    device.nwk = nwk;
                    self.inner
                        .store
                        .enqueue(DbCommand::UpdateDeviceNwk { ieee, nwk });
                }
                device.last_seen = Some(now);
                self.inner.store.enqueue(DbCommand::UpdateLastSeen {
                    ieee,
                    last_seen: now,
                });
                rejoined_initialized = device.is_initialized();
            }
            None => {
                tracing::info!("New device {ieee} joined at {nwk:#06x}");
                let mut device = Device::new(ieee, nwk);
                device.last_seen = Some(now);
                self.inner.store.enqueue(DbCommand::SaveDevice {
                    ieee,
                    nwk,
                    status: device.status,
                    last_seen: device.last_seen,
                });
                self.inner.devices.insert(ieee, device);
            }
        }
        self.inner.nwk_index.insert(nwk, ieee);

        self.emit(Event::DeviceJoined { ieee, nwk });

        if !rejoined_initialized && self.inner.interviewing.insert(ieee, ()).is_none() {
            let controller = self.clone();
            tokio::spawn(async move {
                controller.interview(ieee).await;
                controller.inner.interviewing.remove(&ieee);
            });
        }
    }

    /// A device left the network
    pub async fn handle_leave(&self, _nwk: u16, ieee: Eui64) {
        if let Some(mut device) = self.inner.devices.get_mut(&ieee) {
            device.status = DeviceStatus::Left;
        } else {
            return;
        }
        self.emit(Event::DeviceLeft { ieee });
        self.forget_device(ieee);
    }

    /// Remove a device explicitly, asking it to leave first
    pub async fn remove_device(&self, ieee: Eui64) -> Result<(), CoreError> {
        let tsn = self.next_tsn();
        let body = zdo::request::mgmt_leave(tsn, ieee, LeaveOptions::empty());
        let leave = self
            .request(
                ieee,
                profiles::ZDO,
                cluster_id::MGMT_LEAVE_REQ,
                ZDO_ENDPOINT,
                ZDO_ENDPOINT,
                tsn,
                body,
                false,
                UNICAST_REPLY_TIMEOUT,
            )
            .await;
        if let Err(err) = leave {
            tracing::debug!("Leave request to {ieee} failed ({err}); removing anyway");
        }

        let _ = self.inner.radio.force_remove(ieee).await;
        self.emit(Event::DeviceLeft { ieee });
        self.forget_device(ieee);
        Ok(())
    }

    /// Drop a device from memory, persistence and groups
    fn forget_device(&self, ieee: Eui64) {
        if let Some((_, device)) = self.inner.devices.remove(&ieee) {
            self.inner.nwk_index.remove(&device.nwk);
        }
        self.inner.device_locks.remove(&ieee);
        self.inner.interviewing.remove(&ieee);

        for (group_id, endpoint) in self.inner.groups.remove_device(ieee) {
            self.inner.store.enqueue(DbCommand::RemoveGroupMember {
                group_id,
                ieee,
                endpoint_id: endpoint,
            });
            self.emit(Event::GroupMemberRemoved {
                group_id,
                ieee,
                endpoint,
            });
            if self
                .inner
                .groups
                .get(group_id)
                .map(|g| g.members.is_empty())
                .unwrap_or(false)
            {
                self.inner.groups.remove_group(group_id);
                self.inner.store.enqueue(DbCommand::RemoveGroup { group_id });
                self.emit(Event::GroupRemoved { group_id });
            }
        }

        self.inner.store.enqueue(DbCommand::RemoveDevice { ieee });
        self.emit(Event::DeviceRemoved { ieee });
    }

    /// The radio observed a new source-route relay list for a device
    pub fn handle_relays_updated(&self, ieee: Eui64, relays: Vec<u16>) {
        if let Some(mut device) = self.inner.devices.get_mut(&ieee) {
            device.relays = Some(relays.clone());
        } else {
            return;
        }
        self.inner.store.enqueue(DbCommand::SaveRelays {
            ieee,
            relays: relays.clone(),
        });
        self.emit(Event::DeviceRelaysUpdated { ieee, relays });
    }

    /// Compatibility entry point for radios that deliver pre-split fields
    pub async fn handle_message(
        &self,
        src_nwk: u16,
        profile: u16,
        cluster: u16,
        src_ep: u8,
        dst_ep: u8,
        message: Vec<u8>,
    ) {
        self.packet_received(ApsPacket {
            src_nwk,
            src_ieee: None,
            src_ep,
            dst_ep,
            profile_id: profile,
            cluster_id: cluster,
            data: message,
            lqi: None,
            rssi: None,
        })
        .await;
    }

    /// Inbound APS dispatch entry point
    pub async fn packet_received(&self, packet: ApsPacket) {
        let ieee = packet
            .src_ieee
            .or_else(|| self.inner.nwk_index.get(&packet.src_nwk).map(|e| *e));

        if let Some(ieee) = ieee {
            self.touch_device(ieee, &packet);
        }

        if packet.dst_ep == ZDO_ENDPOINT && packet.profile_id == profiles::ZDO {
            self.handle_zdo(ieee, &packet).await;
            return;
        }

        let Some(ieee) = ieee else {
            tracing::debug!(
                "Dropping packet from unknown device {:#06x}",
                packet.src_nwk
            );
            return;
        };
        self.handle_zcl(ieee, &packet).await;
    }

    fn touch_device(&self, ieee: Eui64, packet: &ApsPacket) {
        let now = Utc::now();

        if let Some(mut device) = self.inner.devices.get_mut(&ieee) {
            device.last_seen = Some(now);
            if packet.lqi.is_some() {
                device.lqi = packet.lqi;
            }
            if packet.rssi.is_some() {
                device.rssi = packet.rssi;
            }
        } else {
            return;
        }

        // Write-through on every packet; the store throttles row rewrites
        // against the persisted value, not the call cadence
        self.inner.store.enqueue(DbCommand::UpdateLastSeen {
            ieee,
            last_seen: now,
        });
        self.emit(Event::DeviceLastSeenUpdated { ieee });
    }

    // --- ZDO dispatch -----------------------------------------------------

    async fn handle_zdo(&self, ieee: Option<Eui64>, packet: &ApsPacket) {
        let Some((&tsn, body)) = packet.data.split_first() else {
            tracing::debug!("Dropping empty ZDO frame");
            return;
        };

        match packet.cluster_id {
            cluster_id::DEVICE_ANNCE => match DeviceAnnounce::deserialize(body) {
                Ok((announce, _)) => {
                    self.emit(Event::DeviceAnnounce {
                        ieee: announce.ieee,
                        nwk: announce.nwk,
                    });
                    self.handle_join(announce.nwk, announce.ieee, 0).await;
                }
                Err(err) => tracing::debug!("Dropping malformed device announcement: {err}"),
            },
            cluster if cluster & RESPONSE_BIT != 0 => {
                let Some(ieee) = ieee else {
                    tracing::debug!("ZDO response from unknown device, dropping");
                    return;
                };
                if !self.resolve_pending(ieee, tsn, cluster, ZDO_ENDPOINT, ZDO_ENDPOINT, &packet.data)
                {
                    tracing::debug!(
                        "Unmatched ZDO response {cluster:#06x} tsn={tsn} from {ieee}"
                    );
                }
            }
            cluster => {
                tracing::debug!("Unhandled ZDO request {cluster:#06x}");
            }
        }
    }

    async fn zdo_request(
        &self,
        ieee: Eui64,
        cluster: u16,
        body: Vec<u8>,
        tsn: u8,
    ) -> Result<Vec<u8>, CoreError> {
        let reply = self
            .request(
                ieee,
                profiles::ZDO,
                cluster,
                ZDO_ENDPOINT,
                ZDO_ENDPOINT,
                tsn,
                body,
                true,
                INTERVIEW_STEP_TIMEOUT,
            )
            .await?
            .ok_or_else(|| CoreError::InvalidResponse("empty ZDO reply".to_string()))?;
        if reply.len() < 2 {
            return Err(CoreError::InvalidResponse("truncated ZDO reply".to_string()));
        }
        Ok(reply)
    }

    // --- Interview --------------------------------------------------------

    async fn interview(&self, ieee: Eui64) {
        tracing::info!("Interviewing {ieee}");
        match self.interview_steps(ieee).await {
            Ok(()) => {
                self.emit(Event::RawDeviceInitialized { ieee });
                self.emit(Event::DeviceInitialized { ieee });
                tracing::info!("Device {ieee} initialized");
            }
            Err(err) => {
                tracing::warn!("Interview of {ieee} failed: {err}");
                self.emit(Event::DeviceInitFailure { ieee });
            }
        }
    }

    async fn interview_steps(&self, ieee: Eui64) -> Result<(), CoreError> {
        let needs_node_desc = self
            .get_device(ieee)
            .ok_or(CoreError::DeviceNotFound(ieee))?
            .node_desc
            .is_none();

        if needs_node_desc {
            let descriptor = with_retries(NODE_DESC_ATTEMPTS, || {
                Box::pin(self.fetch_node_descriptor(ieee))
            })
            .await?;

            if let Some(mut device) = self.inner.devices.get_mut(&ieee) {
                device.node_desc = Some(descriptor);
                device.status = DeviceStatus::ZdoInit;
                self.inner.store.enqueue(DbCommand::SaveNodeDescriptor {
                    ieee,
                    descriptor,
                });
                self.inner.store.enqueue(DbCommand::SaveDevice {
                    ieee,
                    nwk: device.nwk,
                    status: device.status,
                    last_seen: device.last_seen,
                });
            }
            self.emit(Event::NodeDescriptorUpdated { ieee });
        }

        let has_endpoints = self
            .get_device(ieee)
            .map(|d| !d.endpoints.is_empty())
            .unwrap_or(false);

        if !has_endpoints {
            let endpoints =
                with_retries(ACTIVE_EP_ATTEMPTS, || Box::pin(self.fetch_active_endpoints(ieee)))
                    .await?;
            tracing::info!("Device {ieee} endpoints: {endpoints:?}");

            if let Some(mut device) = self.inner.devices.get_mut(&ieee) {
                for &endpoint_id in &endpoints {
                    if endpoint_id != ZDO_ENDPOINT {
                        device.add_endpoint(endpoint_id);
                    }
                }
                device.status = DeviceStatus::EndpointsInit;
                self.inner.store.enqueue(DbCommand::SaveDevice {
                    ieee,
                    nwk: device.nwk,
                    status: device.status,
                    last_seen: device.last_seen,
                });
            }
        }

        let pending_endpoints: Vec<u8> = self
            .get_device(ieee)
            .map(|d| {
                d.endpoints
                    .values()
                    .filter(|ep| ep.status == EndpointStatus::New)
                    .map(|ep| ep.id)
                    .collect()
            })
            .unwrap_or_default();

        for endpoint_id in pending_endpoints {
            let descriptor = with_retries(SIMPLE_DESC_ATTEMPTS, || {
                Box::pin(self.fetch_simple_descriptor(ieee, endpoint_id))
            })
            .await?;

            if let Some(mut device) = self.inner.devices.get_mut(&ieee) {
                let nwk = device.nwk;
                let last_seen = device.last_seen;
                let ep = device.add_endpoint(endpoint_id);
                ep.profile_id = descriptor.profile;
                ep.device_type = descriptor.device_type;
                for &cluster in &descriptor.input_clusters {
                    ep.add_input_cluster(cluster);
                }
                for &cluster in &descriptor.output_clusters {
                    ep.add_output_cluster(cluster);
                }
                ep.status = EndpointStatus::Initialized;

                self.inner.store.enqueue(DbCommand::SaveEndpoint {
                    ieee,
                    endpoint_id,
                    profile_id: descriptor.profile,
                    device_type: descriptor.device_type,
                    status: EndpointStatus::Initialized,
                });
                for &cluster in &descriptor.input_clusters {
                    self.inner.store.enqueue(DbCommand::SaveCluster {
                        ieee,
                        endpoint_id,
                        direction: ClusterDirection::In,
                        cluster,
                    });
                }
                for &cluster in &descriptor.output_clusters {
                    self.inner.store.enqueue(DbCommand::SaveCluster {
                        ieee,
                        endpoint_id,
                        direction: ClusterDirection::Out,
                        cluster,
                    });
                }
                self.inner.store.enqueue(DbCommand::SaveDevice {
                    ieee,
                    nwk,
                    status: DeviceStatus::EndpointsInit,
                    last_seen,
                });
            }
        }

        // Manufacturer and model from the first endpoint with a Basic
        // server cluster; failure here doesn't fail the interview
        let basic_endpoint = self.get_device(ieee).and_then(|d| {
            d.endpoints
                .values()
                .find(|ep| ep.in_clusters.contains_key(&registry::id::BASIC))
                .map(|ep| ep.id)
        });

        if let Some(endpoint_id) = basic_endpoint {
            match self
                .read_attributes(
                    ieee,
                    endpoint_id,
                    registry::id::BASIC,
                    &[basic_attrs::MANUFACTURER_NAME, basic_attrs::MODEL_IDENTIFIER],
                )
                .await
            {
                Ok(records) => {
                    tracing::debug!("Basic cluster info for {ieee}: {records:?}");
                }
                Err(err) => {
                    tracing::warn!("Could not read model info from {ieee}: {err}");
                }
            }
        }

        if let Some(mut device) = self.inner.devices.get_mut(&ieee) {
            device.status = DeviceStatus::Initialized;
            self.inner.store.enqueue(DbCommand::SaveDevice {
                ieee,
                nwk: device.nwk,
                status: device.status,
                last_seen: device.last_seen,
            });
        }
        Ok(())
    }

    async fn fetch_node_descriptor(&self, ieee: Eui64) -> Result<NodeDescriptor, CoreError> {
        let nwk = self.nwk_of(ieee)?;
        let tsn = self.next_tsn();
        let reply = self
            .zdo_request(
                ieee,
                cluster_id::NODE_DESC_REQ,
                zdo::request::node_desc(tsn, nwk),
                tsn,
            )
            .await?;
        let (response, _) = NodeDescRsp::deserialize(&reply[1..])?;
        if response.status != ZdoStatus::Success {
            return Err(CoreError::InvalidResponse(format!(
                "Node descriptor request failed: {:?}",
                response.status
            )));
        }
        response
            .descriptor
            .ok_or_else(|| CoreError::InvalidResponse("node descriptor missing".to_string()))
    }

    async fn fetch_active_endpoints(&self, ieee: Eui64) -> Result<Vec<u8>, CoreError> {
        let nwk = self.nwk_of(ieee)?;
        let tsn = self.next_tsn();
        let reply = self
            .zdo_request(
                ieee,
                cluster_id::ACTIVE_EP_REQ,
                zdo::request::active_ep(tsn, nwk),
                tsn,
            )
            .await?;
        let (response, _) = ActiveEpRsp::deserialize(&reply[1..])?;
        if response.status != ZdoStatus::Success {
            return Err(CoreError::InvalidResponse(format!(
                "Active endpoints request failed: {:?}",
                response.status
            )));
        }
        Ok(response.endpoints)
    }

    async fn fetch_simple_descriptor(
        &self,
        ieee: Eui64,
        endpoint: u8,
    ) -> Result<zdo::SimpleDescriptor, CoreError> {
        let nwk = self.nwk_of(ieee)?;
        let tsn = self.next_tsn();
        let reply = self
            .zdo_request(
                ieee,
                cluster_id::SIMPLE_DESC_REQ,
                zdo::request::simple_desc(tsn, nwk, endpoint),
                tsn,
            )
            .await?;
        let (response, _) = SimpleDescRsp::deserialize(&reply[1..])?;
        if response.status != ZdoStatus::Success {
            return Err(CoreError::InvalidResponse(format!(
                "Simple descriptor request for endpoint {endpoint} failed: {:?}",
                response.status
            )));
        }
        response
            .descriptor
            .ok_or_else(|| CoreError::InvalidResponse("simple descriptor missing".to_string()))
    }

    /// Bind a device's source cluster to a destination (the coordinator's
    /// endpoint or a group)
    pub async fn bind(
        &self,
        ieee: Eui64,
        src_endpoint: u8,
        cluster: u16,
        destination: zdo::MultiAddress,
    ) -> Result<ZdoStatus, CoreError> {
        let tsn = self.next_tsn();
        let reply = self
            .zdo_request(
                ieee,
                cluster_id::BIND_REQ,
                zdo::request::bind(tsn, ieee, src_endpoint, cluster, destination),
                tsn,
            )
            .await?;
        let (status, _) = ZdoStatus::deserialize(&reply[1..])?;
        Ok(status)
    }

    /// Remove a binding previously created with [`Controller::bind`]
    pub async fn unbind(
        &self,
        ieee: Eui64,
        src_endpoint: u8,
        cluster: u16,
        destination: zdo::MultiAddress,
    ) -> Result<ZdoStatus, CoreError> {
        let tsn = self.next_tsn();
        let reply = self
            .zdo_request(
                ieee,
                cluster_id::UNBIND_REQ,
                zdo::request::unbind(tsn, ieee, src_endpoint, cluster, destination),
                tsn,
            )
            .await?;
        let (status, _) = ZdoStatus::deserialize(&reply[1..])?;
        Ok(status)
    }

    // --- Topology scans ---------------------------------------------------

    /// Refresh the device's neighbor table via Mgmt_Lqi
    pub async fn scan_neighbors(&self, ieee: Eui64) -> Result<usize, CoreError> {
        let mut neighbors = Vec::new();
        let mut index = 0u8;

        loop {
            let tsn = self.next_tsn();
            let reply = self
                .zdo_request(
                    ieee,
                    cluster_id::MGMT_LQI_REQ,
                    zdo::request::mgmt_lqi(tsn, index),
                    tsn,
                )
                .await?;
            let (response, _) = MgmtLqiRsp::deserialize(&reply[1..])?;
            if response.status != ZdoStatus::Success {
                return Err(CoreError::InvalidResponse(format!(
                    "Mgmt_Lqi failed: {:?}",
                    response.status
                )));
            }

            let got = response.neighbors.len();
            index = index.saturating_add(got as u8);
            let total = response.entries;
            neighbors.extend(response.neighbors);
            if got == 0 || neighbors.len() >= usize::from(total) {
                break;
            }
        }

        let count = neighbors.len();
        if let Some(mut device) = self.inner.devices.get_mut(&ieee) {
            device.neighbors = neighbors.clone();
        }
        self.inner
            .store
            .enqueue(DbCommand::ReplaceNeighbors { ieee, neighbors });
        Ok(count)
    }

    /// Refresh the device's routing table via Mgmt_Rtg
    pub async fn scan_routes(&self, ieee: Eui64) -> Result<usize, CoreError> {
        let mut routes = Vec::new();
        let mut index = 0u8;

        loop {
            let tsn = self.next_tsn();
            let reply = self
                .zdo_request(
                    ieee,
                    cluster_id::MGMT_RTG_REQ,
                    zdo::request::mgmt_rtg(tsn, index),
                    tsn,
                )
                .await?;
            let (response, _) = MgmtRtgRsp::deserialize(&reply[1..])?;
            if response.status != ZdoStatus::Success {
                return Err(CoreError::InvalidResponse(format!(
                    "Mgmt_Rtg failed: {:?}",
                    response.status
                )));
            }

            let got = response.routes.len();
            index = index.saturating_add(got as u8);
            let total = response.entries;
            routes.extend(response.routes);
            if got == 0 || routes.len() >= usize::from(total) {
                break;
            }
        }

        let count = routes.len();
        if let Some(mut device) = self.inner.devices.get_mut(&ieee) {
            device.routes = routes.clone();
        }
        self.inner
            .store
            .enqueue(DbCommand::ReplaceRoutes { ieee, routes });
        Ok(count)
    }

    // --- Attribute operations --------------------------------------------

    /// Read attributes from a device cluster, updating the cache with every
    /// record in the response. Unsupported attributes are remembered and
    /// never re-queried.
    pub async fn read_attributes(
        &self,
        ieee: Eui64,
        endpoint: u8,
        cluster: u16,
        attribute_ids: &[u16],
    ) -> Result<Vec<ReadAttributeRecord>, CoreError> {
        let known_unsupported: Vec<u16> = self
            .get_device(ieee)
            .and_then(|d| {
                d.endpoints
                    .get(&endpoint)
                    .and_then(|ep| ep.cluster(cluster, ClusterDirection::In))
                    .map(|c| {
                        attribute_ids
                            .iter()
                            .filter(|id| c.unsupported_attributes.contains(id))
                            .copied()
                            .collect()
                    })
            })
            .unwrap_or_default();
        let to_read: Vec<u16> = attribute_ids
            .iter()
            .filter(|id| !known_unsupported.contains(id))
            .copied()
            .collect();
        if to_read.is_empty() {
            return Err(CoreError::AttributeNotSupported {
                cluster,
                attrid: attribute_ids.first().copied().unwrap_or_default(),
            });
        }

        let tsn = self.next_tsn();
        let header = ZclHeader::general(tsn, GeneralCommandId::ReadAttributes, Direction::ClientToServer);
        let mut data = header.to_bytes();
        ReadAttributes {
            attribute_ids: to_read,
        }
        .serialize(&mut data);

        let reply = self
            .request(
                ieee,
                profiles::HOME_AUTOMATION,
                cluster,
                COORDINATOR_ENDPOINT,
                endpoint,
                tsn,
                data,
                true,
                UNICAST_REPLY_TIMEOUT,
            )
            .await?
            .ok_or_else(|| CoreError::InvalidResponse("empty reply".to_string()))?;

        let (reply_header, payload) = ZclHeader::deserialize(&reply)?;
        if reply_header.command_id != GeneralCommandId::ReadAttributesResponse as u8 {
            return Err(CoreError::InvalidResponse(format!(
                "expected Read Attributes response, got command {:#04x}",
                reply_header.command_id
            )));
        }
        let (response, _) = ReadAttributesResponse::deserialize(payload)?;

        for record in &response.records {
            match record.status {
                Status::Success => {
                    if let Some(value) = &record.value {
                        self.store_attribute(
                            ieee,
                            endpoint,
                            cluster,
                            ClusterDirection::In,
                            record.attrid,
                            value.clone(),
                        );
                    }
                }
                Status::UnsupportedAttribute => {
                    self.mark_attribute_unsupported(ieee, endpoint, cluster, record.attrid);
                }
                _ => {}
            }
        }

        Ok(response.records)
    }

    /// Write attributes on a device cluster
    pub async fn write_attributes(
        &self,
        ieee: Eui64,
        endpoint: u8,
        cluster: u16,
        attributes: Vec<Attribute>,
    ) -> Result<WriteAttributesResponse, CoreError> {
        let tsn = self.next_tsn();
        let header = ZclHeader::general(tsn, GeneralCommandId::WriteAttributes, Direction::ClientToServer);
        let mut data = header.to_bytes();
        let command = WriteAttributes { attributes };
        command.serialize(&mut data);

        let reply = self
            .request(
                ieee,
                profiles::HOME_AUTOMATION,
                cluster,
                COORDINATOR_ENDPOINT,
                endpoint,
                tsn,
                data,
                true,
                UNICAST_REPLY_TIMEOUT,
            )
            .await?
            .ok_or_else(|| CoreError::InvalidResponse("empty reply".to_string()))?;

        let (_, payload) = ZclHeader::deserialize(&reply)?;
        let (response, _) = WriteAttributesResponse::deserialize(payload)?;

        // Remember successful writes locally
        let failed: Vec<u16> = response
            .records
            .iter()
            .filter(|r| r.status != Status::Success)
            .filter_map(|r| r.attrid)
            .collect();
        for attribute in &command.attributes {
            if !failed.contains(&attribute.attrid) {
                self.store_attribute(
                    ieee,
                    endpoint,
                    cluster,
                    ClusterDirection::In,
                    attribute.attrid,
                    attribute.value.clone(),
                );
            }
        }

        Ok(response)
    }

    /// Push reporting configurations to a device cluster
    pub async fn configure_reporting(
        &self,
        ieee: Eui64,
        endpoint: u8,
        cluster: u16,
        configs: Vec<ReportingConfig>,
    ) -> Result<ConfigureReportingResponse, CoreError> {
        let tsn = self.next_tsn();
        let header = ZclHeader::general(
            tsn,
            GeneralCommandId::ConfigureReporting,
            Direction::ClientToServer,
        );
        let mut data = header.to_bytes();
        let command = ConfigureReporting {
            configs: configs.clone(),
        };
        command.serialize(&mut data);

        let reply = self
            .request(
                ieee,
                profiles::HOME_AUTOMATION,
                cluster,
                COORDINATOR_ENDPOINT,
                endpoint,
                tsn,
                data,
                true,
                UNICAST_REPLY_TIMEOUT,
            )
            .await?
            .ok_or_else(|| CoreError::InvalidResponse("empty reply".to_string()))?;

        let (_, payload) = ZclHeader::deserialize(&reply)?;
        let (response, _) = ConfigureReportingResponse::deserialize(payload)?;

        if response.all_success() {
            if let Some(mut device) = self.inner.devices.get_mut(&ieee) {
                if let Some(cl) = device
                    .endpoints
                    .get_mut(&endpoint)
                    .and_then(|ep| ep.cluster_mut(cluster, ClusterDirection::In))
                {
                    cl.configured_reports = configs;
                }
            }
        }

        Ok(response)
    }

    /// Send a cluster-specific command to a device
    #[allow(clippy::too_many_arguments)]
    pub async fn send_cluster_command(
        &self,
        ieee: Eui64,
        endpoint: u8,
        cluster: u16,
        command_id: u8,
        payload: Vec<u8>,
        manufacturer: Option<u16>,
        expect_reply: bool,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        let tsn = self.next_tsn();
        let mut header = ZclHeader::cluster(tsn, command_id, Direction::ClientToServer);
        if let Some(code) = manufacturer {
            header = header.with_manufacturer(code);
        }
        let mut data = header.to_bytes();
        data.extend_from_slice(&payload);

        self.request(
            ieee,
            profiles::HOME_AUTOMATION,
            cluster,
            COORDINATOR_ENDPOINT,
            endpoint,
            tsn,
            data,
            expect_reply,
            UNICAST_REPLY_TIMEOUT,
        )
        .await
    }

    fn store_attribute(
        &self,
        ieee: Eui64,
        endpoint: u8,
        cluster_id: u16,
        direction: ClusterDirection,
        attrid: u16,
        value: ZclValue,
    ) {
        let now = Utc::now();
        let mut accepted = false;

        if let Some(mut device) = self.inner.devices.get_mut(&ieee) {
            if let Some(ep) = device.endpoints.get_mut(&endpoint) {
                let cluster = match direction {
                    ClusterDirection::In => ep.add_input_cluster(cluster_id),
                    ClusterDirection::Out => ep.add_output_cluster(cluster_id),
                };
                accepted = cluster.update_attribute(attrid, value.clone(), now);
            }

            if accepted && cluster_id == registry::id::BASIC {
                if attrid == basic_attrs::MANUFACTURER_NAME {
                    if let Some(text) = value.as_str() {
                        device.manufacturer = Some(text.to_string());
                    }
                } else if attrid == basic_attrs::MODEL_IDENTIFIER {
                    if let Some(text) = value.as_str() {
                        device.model = Some(text.to_string());
                    }
                }
            }
        }

        if !accepted {
            return;
        }

        // The write-through is queued in the same critical section as the
        // in-memory update; only server-side cluster attributes persist
        if direction == ClusterDirection::In {
            self.inner.store.enqueue(DbCommand::SaveAttribute {
                ieee,
                endpoint_id: endpoint,
                cluster: cluster_id,
                attrid,
                value: value.clone(),
                observed: now,
            });
        }

        self.emit(Event::AttributeUpdated {
            ieee,
            endpoint,
            cluster: cluster_id,
            direction,
            attrid,
            value,
        });
    }

    fn mark_attribute_unsupported(&self, ieee: Eui64, endpoint: u8, cluster_id: u16, attrid: u16) {
        if let Some(mut device) = self.inner.devices.get_mut(&ieee) {
            if let Some(cluster) = device
                .endpoints
                .get_mut(&endpoint)
                .and_then(|ep| ep.cluster_mut(cluster_id, ClusterDirection::In))
            {
                cluster.unsupported_attributes.insert(attrid);
            }
        }
        self.inner.store.enqueue(DbCommand::SaveUnsupportedAttribute {
            ieee,
            endpoint_id: endpoint,
            cluster: cluster_id,
            attrid,
        });
    }

    // --- ZCL dispatch -----------------------------------------------------

    async fn handle_zcl(&self, ieee: Eui64, packet: &ApsPacket) {
        let (header, payload) = match ZclHeader::deserialize(&packet.data) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::debug!("Dropping malformed ZCL frame from {ieee}: {err}");
                return;
            }
        };

        // A server-to-client frame may be the reply someone is waiting for
        if header.direction() == Direction::ServerToClient
            && self.resolve_pending(
                ieee,
                header.tsn,
                packet.cluster_id,
                packet.src_ep,
                packet.dst_ep,
                &packet.data,
            )
        {
            return;
        }

        let responded = if header.is_general() {
            self.handle_general_command(ieee, packet, &header, payload)
                .await
        } else {
            self.handle_cluster_command(ieee, packet, &header, payload)
                .await
        };

        // A request gets a default response unless it disabled them or a
        // command-specific response already went out
        if !responded && !header.frame_control.disable_default_response {
            let response = zigbee_wire::zcl::DefaultResponse {
                command_id: header.command_id,
                status: Status::Success,
            };
            let mut reply_header = ZclHeader::general(
                header.tsn,
                GeneralCommandId::DefaultResponse,
                header.direction().reversed(),
            );
            reply_header.frame_control.disable_default_response = true;
            let mut data = reply_header.to_bytes();
            response.serialize(&mut data);

            if let Err(err) = self
                .send_reply(
                    ieee,
                    packet.profile_id,
                    packet.cluster_id,
                    packet.dst_ep,
                    packet.src_ep,
                    header.tsn,
                    data,
                )
                .await
            {
                tracing::debug!("Failed to send default response to {ieee}: {err}");
            }
        }
    }

    /// Handle a general (profile-wide) command. Returns true when a
    /// command-specific response was sent (or must be suppressed).
    async fn handle_general_command(
        &self,
        ieee: Eui64,
        packet: &ApsPacket,
        header: &ZclHeader,
        payload: &[u8],
    ) -> bool {
        // Observations land on the device's server-side cluster cache
        let direction = ClusterDirection::In;

        let command = match GeneralCommandId::try_from(header.command_id) {
            Ok(command) => command,
            Err(_) => {
                tracing::debug!(
                    "Unknown general command {:#04x} from {ieee}",
                    header.command_id
                );
                return false;
            }
        };

        match command {
            GeneralCommandId::ReportAttributes => {
                match ReportAttributes::deserialize(payload) {
                    Ok((report, _)) => {
                        for attribute in report.reports {
                            self.store_attribute(
                                ieee,
                                packet.src_ep,
                                packet.cluster_id,
                                direction,
                                attribute.attrid,
                                attribute.value,
                            );
                        }
                    }
                    Err(err) => {
                        tracing::debug!("Dropping malformed attribute report from {ieee}: {err}");
                    }
                }
                false
            }
            GeneralCommandId::WriteAttributes | GeneralCommandId::WriteAttributesUndivided => {
                let parsed = match WriteAttributes::deserialize(payload) {
                    Ok((write, _)) => write,
                    Err(err) => {
                        tracing::debug!("Dropping malformed write from {ieee}: {err}");
                        return true;
                    }
                };
                // The cache update happens before the acknowledgement
                for attribute in parsed.attributes {
                    self.store_attribute(
                        ieee,
                        packet.src_ep,
                        packet.cluster_id,
                        direction,
                        attribute.attrid,
                        attribute.value,
                    );
                }

                let mut reply_header = ZclHeader::general(
                    header.tsn,
                    GeneralCommandId::WriteAttributesResponse,
                    header.direction().reversed(),
                );
                reply_header.frame_control.disable_default_response = true;
                let mut data = reply_header.to_bytes();
                WriteAttributesResponse::success().serialize(&mut data);
                if let Err(err) = self
                    .send_reply(
                        ieee,
                        packet.profile_id,
                        packet.cluster_id,
                        packet.dst_ep,
                        packet.src_ep,
                        header.tsn,
                        data,
                    )
                    .await
                {
                    tracing::debug!("Failed to acknowledge write from {ieee}: {err}");
                }
                true
            }
            GeneralCommandId::WriteAttributesNoResponse => {
                if let Ok((write, _)) = WriteAttributes::deserialize(payload) {
                    for attribute in write.attributes {
                        self.store_attribute(
                            ieee,
                            packet.src_ep,
                            packet.cluster_id,
                            direction,
                            attribute.attrid,
                            attribute.value,
                        );
                    }
                }
                // This command never generates any response
                true
            }
            GeneralCommandId::ReadAttributes => {
                let parsed = match ReadAttributes::deserialize(payload) {
                    Ok((read, _)) => read,
                    Err(err) => {
                        tracing::debug!("Dropping malformed read from {ieee}: {err}");
                        return true;
                    }
                };

                // We expose no readable attributes of our own
                let response = ReadAttributesResponse {
                    records: parsed
                        .attribute_ids
                        .iter()
                        .map(|&attrid| ReadAttributeRecord {
                            attrid,
                            status: Status::UnsupportedAttribute,
                            value: None,
                        })
                        .collect(),
                };
                let mut reply_header = ZclHeader::general(
                    header.tsn,
                    GeneralCommandId::ReadAttributesResponse,
                    header.direction().reversed(),
                );
                reply_header.frame_control.disable_default_response = true;
                let mut data = reply_header.to_bytes();
                response.serialize(&mut data);
                if let Err(err) = self
                    .send_reply(
                        ieee,
                        packet.profile_id,
                        packet.cluster_id,
                        packet.dst_ep,
                        packet.src_ep,
                        header.tsn,
                        data,
                    )
                    .await
                {
                    tracing::debug!("Failed to answer read from {ieee}: {err}");
                }
                true
            }
            GeneralCommandId::DefaultResponse => {
                // An unmatched default response carries no work
                tracing::debug!("Unmatched default response from {ieee}");
                true
            }
            _ => {
                self.emit(Event::GeneralCommand {
                    ieee,
                    endpoint: packet.src_ep,
                    cluster: packet.cluster_id,
                    command_id: header.command_id,
                    payload: payload.to_vec(),
                });
                false
            }
        }
    }

    /// Handle a cluster-specific command
    async fn handle_cluster_command(
        &self,
        ieee: Eui64,
        packet: &ApsPacket,
        header: &ZclHeader,
        payload: &[u8],
    ) -> bool {
        if packet.cluster_id == registry::id::OTA_UPGRADE
            && header.direction() == Direction::ClientToServer
        {
            return self.handle_ota_command(ieee, packet, header, payload).await;
        }

        match self.inner.registry.get(packet.cluster_id, header.manufacturer) {
            Some(_) => {
                self.emit(Event::ClusterCommand {
                    ieee,
                    endpoint: packet.src_ep,
                    cluster: packet.cluster_id,
                    command_id: header.command_id,
                    payload: payload.to_vec(),
                });
            }
            None => {
                self.emit(Event::UnknownClusterMessage {
                    ieee,
                    endpoint: packet.src_ep,
                    cluster: packet.cluster_id,
                    data: packet.data.clone(),
                });
            }
        }
        false
    }

    async fn handle_ota_command(
        &self,
        ieee: Eui64,
        packet: &ApsPacket,
        header: &ZclHeader,
        payload: &[u8],
    ) -> bool {
        match header.command_id {
            server_commands::QUERY_NEXT_IMAGE => {
                let Ok((query, _)) = QueryNextImage::deserialize(payload) else {
                    tracing::debug!("Dropping malformed OTA query from {ieee}");
                    return true;
                };
                let response = self.inner.ota.handle_query_next_image(ieee, &query).await;
                self.send_ota_reply(
                    ieee,
                    packet,
                    header.tsn,
                    client_commands::QUERY_NEXT_IMAGE_RESPONSE,
                    response.to_bytes(),
                )
                .await;
                true
            }
            server_commands::IMAGE_BLOCK => {
                let Ok((request, _)) = ImageBlockRequest::deserialize(payload) else {
                    tracing::debug!("Dropping malformed OTA block request from {ieee}");
                    return true;
                };
                let response = self.inner.ota.handle_image_block(ieee, &request);
                self.send_ota_reply(
                    ieee,
                    packet,
                    header.tsn,
                    client_commands::IMAGE_BLOCK_RESPONSE,
                    response.to_bytes(),
                )
                .await;
                true
            }
            server_commands::IMAGE_PAGE => {
                // Page transfers are not offered; the device falls back to
                // block requests
                self.send_ota_reply(
                    ieee,
                    packet,
                    header.tsn,
                    client_commands::IMAGE_BLOCK_RESPONSE,
                    ImageBlockResponse::Abort.to_bytes(),
                )
                .await;
                true
            }
            server_commands::UPGRADE_END => {
                let Ok((request, _)) = UpgradeEndRequest::deserialize(payload) else {
                    tracing::debug!("Dropping malformed OTA upgrade end from {ieee}");
                    return true;
                };
                match self.inner.ota.handle_upgrade_end(ieee, &request) {
                    Some(response) => {
                        self.send_ota_reply(
                            ieee,
                            packet,
                            header.tsn,
                            client_commands::UPGRADE_END_RESPONSE,
                            response.to_bytes(),
                        )
                        .await;
                        self.inner.ota.note_applied(ieee);
                        true
                    }
                    // A failed upgrade end is acknowledged by the default
                    // response path
                    None => false,
                }
            }
            other => {
                tracing::debug!("Unhandled OTA command {other:#04x} from {ieee}");
                false
            }
        }
    }

    async fn send_ota_reply(
        &self,
        ieee: Eui64,
        packet: &ApsPacket,
        tsn: u8,
        command_id: u8,
        payload: Vec<u8>,
    ) {
        let mut header = ZclHeader::cluster(tsn, command_id, Direction::ServerToClient);
        header.frame_control.disable_default_response = true;
        let mut data = header.to_bytes();
        data.extend_from_slice(&payload);

        if let Err(err) = self
            .send_reply(
                ieee,
                packet.profile_id,
                packet.cluster_id,
                packet.dst_ep,
                packet.src_ep,
                tsn,
                data,
            )
            .await
        {
            tracing::warn!("Failed to send OTA reply to {ieee}: {err}");
        }
    }

    // --- Groups -----------------------------------------------------------

    /// Create a group
    pub fn add_group(&self, group_id: u16, name: Option<String>) {
        let resolved = name
            .clone()
            .unwrap_or_else(|| format!("Group {group_id:#06x}"));
        if self.inner.groups.add_group(group_id, name) {
            self.inner.store.enqueue(DbCommand::SaveGroup {
                group_id,
                name: resolved,
            });
            self.emit(Event::GroupAdded { group_id });
        }
    }

    /// Add a device endpoint to a group, creating the group if needed
    pub fn add_group_member(
        &self,
        group_id: u16,
        ieee: Eui64,
        endpoint: u8,
    ) -> Result<(), CoreError> {
        let has_endpoint = self
            .get_device(ieee)
            .map(|d| d.endpoints.contains_key(&endpoint))
            .unwrap_or(false);
        if !has_endpoint {
            return Err(CoreError::DeviceNotFound(ieee));
        }

        self.add_group(group_id, None);
        if self.inner.groups.add_member(group_id, ieee, endpoint) {
            self.inner.store.enqueue(DbCommand::SaveGroupMember {
                group_id,
                ieee,
                endpoint_id: endpoint,
            });
            self.emit(Event::GroupMemberAdded {
                group_id,
                ieee,
                endpoint,
            });
        }
        Ok(())
    }

    /// Remove a member; an emptied group is deleted
    pub fn remove_group_member(&self, group_id: u16, ieee: Eui64, endpoint: u8) {
        if self.inner.groups.remove_member(group_id, ieee, endpoint) {
            self.inner.store.enqueue(DbCommand::RemoveGroupMember {
                group_id,
                ieee,
                endpoint_id: endpoint,
            });
            self.emit(Event::GroupMemberRemoved {
                group_id,
                ieee,
                endpoint,
            });

            if self
                .inner
                .groups
                .get(group_id)
                .map(|g| g.members.is_empty())
                .unwrap_or(false)
            {
                self.remove_group(group_id);
            }
        }
    }

    /// Delete a group outright
    pub fn remove_group(&self, group_id: u16) {
        if self.inner.groups.remove_group(group_id).is_some() {
            self.inner.store.enqueue(DbCommand::RemoveGroup { group_id });
            self.emit(Event::GroupRemoved { group_id });
        }
    }

    #[must_use]
    pub fn get_group(&self, group_id: u16) -> Option<crate::groups::Group> {
        self.inner.groups.get(group_id)
    }

    // --- Backup and restore ----------------------------------------------

    /// Snapshot the coordinator and device table
    pub async fn backup(&self) -> Result<NetworkBackup, CoreError> {
        let (network_info, node_info) = self.inner.radio.load_network_info().await?;

        let devices = self
            .inner
            .devices
            .iter()
            .map(|device| BackupDevice {
                ieee: device.ieee,
                nwk: device.nwk,
                status: device.status as u8,
                manufacturer: device.manufacturer.clone(),
                model: device.model.clone(),
            })
            .collect();

        let backup = NetworkBackup {
            node_info,
            network_info,
            backup_time: Utc::now(),
            devices,
        };

        self.inner.store.enqueue(DbCommand::SaveNetworkBackup {
            backup_json: backup.to_json()?,
        });
        self.inner.backups.lock().unwrap().push(backup.clone());

        Ok(backup)
    }

    /// Re-form the network with the parameters of a previous backup
    pub async fn restore(&self, backup: &NetworkBackup) -> Result<(), CoreError> {
        backup.validate()?;

        self.inner
            .radio
            .write_network_info(&backup.network_info, &backup.node_info)
            .await?;

        self.inner.store.enqueue(DbCommand::SaveNetworkBackup {
            backup_json: backup.to_json()?,
        });
        self.inner.backups.lock().unwrap().push(backup.clone());

        tracing::info!(
            "Restored network {} (pan {:#06x}, channel {})",
            backup.network_info.extended_pan_id,
            backup.network_info.pan_id,
            backup.network_info.channel
        );
        Ok(())
    }

    /// All known backups, oldest first
    #[must_use]
    pub fn backups(&self) -> Vec<NetworkBackup> {
        self.inner.backups.lock().unwrap().clone()
    }

    /// The configuration this controller was built with
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Re-read every OTA provider index now instead of waiting for the
    /// background refresh
    pub async fn refresh_ota(&self) {
        self.inner.ota.refresh().await;
    }

    /// Wait until every queued write has been committed to the database
    pub async fn flush_store(&self) {
        self.inner.store.flush().await;
    }
}
