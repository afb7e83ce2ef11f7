//! SQLite persistence engine
//!
//! One database file, versioned through `PRAGMA user_version` with a
//! forward-only migration chain (v0 → v1 → v3 → v4 → v5 → v6 → v7 → v8 →
//! v10 → v11; v2 and v9 were never released). Active tables carry a `_v<n>`
//! suffix so an older installation can coexist next to an upgraded one
//! without name collisions. A database newer than this build refuses to
//! open.
//!
//! Writes are enqueued from the controller's critical sections and applied
//! by a dedicated writer thread that coalesces commands within a quiet
//! window and commits each batch in a single transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::oneshot;
use zigbee_wire::registry::basic_attrs;
use zigbee_wire::zdo::{
    DescriptorCapability, FrequencyBand, LogicalType, MacCapabilityFlags, Neighbor,
    NodeDescriptor, Route, RouteStatus,
};
use zigbee_wire::{Eui64, TypeCode, WireFormat, ZclValue};

use crate::backup::NetworkBackup;
use crate::device::{ClusterDirection, Device, DeviceStatus, EndpointStatus};
use crate::error::CoreError;
use crate::groups::Group;

/// Current schema version
pub const DB_VERSION: i64 = 11;

/// Quiet window for write coalescing
const QUIET_WINDOW: Duration = Duration::from_millis(100);
/// Upper bound on a single batch
const MAX_BATCH: usize = 256;
/// A fresh last_seen only rewrites the row when the stored value is at
/// least this much older. The comparison runs against the persisted column,
/// so chatty devices still make forward progress every delta.
const MIN_LAST_SEEN_DELTA: f64 = 30.0;

const SCHEMA_V1: &str = include_str!("sql/schema_v1.sql");
const SCHEMA_V3: &str = include_str!("sql/schema_v3.sql");
const SCHEMA_V4: &str = include_str!("sql/schema_v4.sql");
const SCHEMA_V5: &str = include_str!("sql/schema_v5.sql");
const SCHEMA_V6: &str = include_str!("sql/schema_v6.sql");
const SCHEMA_V7: &str = include_str!("sql/schema_v7.sql");
const SCHEMA_V8: &str = include_str!("sql/schema_v8.sql");
const SCHEMA_V10: &str = include_str!("sql/schema_v10.sql");
const SCHEMA_V11: &str = include_str!("sql/schema_v11.sql");

/// A write-through command for the writer thread
#[derive(Debug)]
pub enum DbCommand {
    SaveDevice {
        ieee: Eui64,
        nwk: u16,
        status: DeviceStatus,
        last_seen: Option<DateTime<Utc>>,
    },
    UpdateDeviceNwk {
        ieee: Eui64,
        nwk: u16,
    },
    UpdateLastSeen {
        ieee: Eui64,
        last_seen: DateTime<Utc>,
    },
    RemoveDevice {
        ieee: Eui64,
    },
    SaveNodeDescriptor {
        ieee: Eui64,
        descriptor: NodeDescriptor,
    },
    SaveEndpoint {
        ieee: Eui64,
        endpoint_id: u8,
        profile_id: u16,
        device_type: u16,
        status: EndpointStatus,
    },
    SaveCluster {
        ieee: Eui64,
        endpoint_id: u8,
        direction: ClusterDirection,
        cluster: u16,
    },
    SaveAttribute {
        ieee: Eui64,
        endpoint_id: u8,
        cluster: u16,
        attrid: u16,
        value: ZclValue,
        observed: DateTime<Utc>,
    },
    SaveUnsupportedAttribute {
        ieee: Eui64,
        endpoint_id: u8,
        cluster: u16,
        attrid: u16,
    },
    SaveGroup {
        group_id: u16,
        name: String,
    },
    RemoveGroup {
        group_id: u16,
    },
    SaveGroupMember {
        group_id: u16,
        ieee: Eui64,
        endpoint_id: u8,
    },
    RemoveGroupMember {
        group_id: u16,
        ieee: Eui64,
        endpoint_id: u8,
    },
    SaveRelays {
        ieee: Eui64,
        relays: Vec<u16>,
    },
    ReplaceNeighbors {
        ieee: Eui64,
        neighbors: Vec<Neighbor>,
    },
    ReplaceRoutes {
        ieee: Eui64,
        routes: Vec<Route>,
    },
    SaveNetworkBackup {
        backup_json: String,
    },
    /// Commit everything queued so far, then acknowledge
    Flush(oneshot::Sender<()>),
}

/// Everything read back from disk at startup, in topological order
#[derive(Debug, Default)]
pub struct LoadedState {
    pub devices: Vec<Device>,
    pub groups: Vec<Group>,
    pub backups: Vec<NetworkBackup>,
}

/// Handle to the persistence engine. Cloneable; all clones feed the same
/// writer thread.
#[derive(Clone)]
pub struct Store {
    tx: mpsc::Sender<DbCommand>,
}

impl Store {
    /// Open (creating or migrating as needed) and load the full tree
    pub async fn open(path: &Path) -> Result<(Store, LoadedState), CoreError> {
        let path = path.to_owned();
        let (conn, state) = tokio::task::spawn_blocking(move || -> Result<_, CoreError> {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "normal")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            run_migrations(&conn)?;
            let state = load(&conn)?;
            Ok((conn, state))
        })
        .await
        .map_err(|err| CoreError::PersistenceBackendFailed(err.to_string()))??;

        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("zigbee-db-writer".into())
            .spawn(move || writer_loop(conn, rx))
            .map_err(|err| CoreError::PersistenceBackendFailed(err.to_string()))?;

        Ok((Store { tx }, state))
    }

    /// Queue a write. Failures are logged, never propagated: persistence
    /// must not corrupt or stall in-memory state.
    pub fn enqueue(&self, command: DbCommand) {
        if self.tx.send(command).is_err() {
            tracing::warn!("Persistence writer is gone; discarding write");
        }
    }

    /// Wait until every queued write has been committed
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(DbCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

fn epoch_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis((secs * 1000.0) as i64)
}

fn encode_relays(relays: &[u16]) -> Vec<u8> {
    let mut out = vec![relays.len() as u8];
    for relay in relays {
        out.extend_from_slice(&relay.to_le_bytes());
    }
    out
}

fn decode_relays(blob: &[u8]) -> Option<Vec<u16>> {
    let (&count, mut rest) = blob.split_first()?;
    let mut relays = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        if rest.len() < 2 {
            return None;
        }
        relays.push(u16::from_le_bytes([rest[0], rest[1]]));
        rest = &rest[2..];
    }
    Some(relays)
}

// --- Migrations -----------------------------------------------------------

fn run_migrations(conn: &Connection) -> Result<(), CoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let table_count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;

    if version > DB_VERSION {
        return Err(CoreError::PersistenceBackendFailed(format!(
            "Database is v{version} but this build supports up to v{DB_VERSION}; refusing to open"
        )));
    }

    if version == 0 && table_count == 0 {
        // Brand new database: no chain to walk
        conn.execute_batch(SCHEMA_V11)?;
        return Ok(());
    }

    if version == DB_VERSION {
        return Ok(());
    }

    tracing::info!("Migrating database from v{} to v{}", version, DB_VERSION);

    // Either the whole chain lands or the file is left untouched
    conn.execute_batch("BEGIN")?;
    let outcome = (|| -> Result<(), CoreError> {
        if version < 1 {
            conn.execute_batch(SCHEMA_V1)?;
        }
        if version < 3 {
            conn.execute_batch(SCHEMA_V3)?;
        }
        if version < 4 {
            migrate_to_v4(conn)?;
        }
        if version < 5 {
            migrate_to_v5(conn)?;
        }
        if version < 6 {
            migrate_to_v6(conn)?;
        }
        if version < 7 {
            migrate_to_v7(conn)?;
        }
        if version < 8 {
            migrate_to_v8(conn)?;
        }
        if version < 10 {
            migrate_to_v10(conn)?;
        }
        if version < 11 {
            migrate_to_v11(conn)?;
        }
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            Ok(())
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(err)
        }
    }
}

fn copy_tables(conn: &Connection, pairs: &[(&str, &str)]) -> Result<(), CoreError> {
    for (old, new) in pairs {
        conn.execute_batch(&format!("INSERT OR IGNORE INTO {new} SELECT * FROM {old};"))?;
    }
    Ok(())
}

fn drop_tables(conn: &Connection, tables: &[&str]) -> Result<(), CoreError> {
    for table in tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {table};"))?;
    }
    Ok(())
}

/// v4 expanded node descriptors and neighbors into typed columns
fn migrate_to_v4(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(SCHEMA_V4)?;

    {
        let mut select = conn.prepare("SELECT ieee, value FROM node_descriptors")?;
        let mut insert = conn.prepare(
            "INSERT OR IGNORE INTO node_descriptors_v4 VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )?;
        let rows = select.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (ieee, blob) = row?;
            match NodeDescriptor::deserialize(&blob) {
                Ok((nd, _)) => {
                    insert.execute(params![
                        ieee,
                        nd.logical_type as u8,
                        nd.complex_descriptor_available,
                        nd.user_descriptor_available,
                        0u8,
                        nd.aps_flags,
                        nd.frequency_band.bits(),
                        nd.mac_capability_flags.bits(),
                        nd.manufacturer_code,
                        nd.maximum_buffer_size,
                        nd.maximum_incoming_transfer_size,
                        nd.server_mask,
                        nd.maximum_outgoing_transfer_size,
                        nd.descriptor_capability_field.bits(),
                    ])?;
                }
                Err(err) => {
                    tracing::warn!("Dropping unparseable node descriptor for {ieee}: {err}");
                }
            }
        }
    }

    conn.execute_batch(
        "INSERT OR IGNORE INTO neighbors_v4
             SELECT device_ieee, extended_pan_id, ieee, nwk,
                    packed & 3, (packed >> 2) & 3, (packed >> 4) & 7,
                    permit_joining, depth, lqi
             FROM neighbors;",
    )?;
    drop_tables(conn, &["node_descriptors", "neighbors"])
}

/// v5 introduced global table suffixes and dropped stale rows
fn migrate_to_v5(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(SCHEMA_V5)?;
    copy_tables(
        conn,
        &[
            ("devices", "devices_v5"),
            ("endpoints", "endpoints_v5"),
            ("clusters", "in_clusters_v5"),
            ("output_clusters", "out_clusters_v5"),
            ("groups", "groups_v5"),
            ("group_members", "group_members_v5"),
            ("relays", "relays_v5"),
            ("attributes", "attributes_cache_v5"),
            ("node_descriptors_v4", "node_descriptors_v5"),
            ("neighbors_v4", "neighbors_v5"),
        ],
    )?;
    drop_tables(
        conn,
        &[
            "attributes",
            "group_members",
            "groups",
            "relays",
            "output_clusters",
            "clusters",
            "endpoints",
            "devices",
            "node_descriptors_v4",
            "neighbors_v4",
        ],
    )
}

/// v6 relaxed the attribute cache foreign key to devices only, so virtual
/// clusters injected by external quirks can persist attributes
fn migrate_to_v6(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(SCHEMA_V6)?;
    copy_tables(
        conn,
        &[
            ("devices_v5", "devices_v6"),
            ("endpoints_v5", "endpoints_v6"),
            ("in_clusters_v5", "in_clusters_v6"),
            ("out_clusters_v5", "out_clusters_v6"),
            ("groups_v5", "groups_v6"),
            ("group_members_v5", "group_members_v6"),
            ("relays_v5", "relays_v6"),
            ("attributes_cache_v5", "attributes_cache_v6"),
            ("node_descriptors_v5", "node_descriptors_v6"),
            ("neighbors_v5", "neighbors_v6"),
        ],
    )?;
    drop_tables(
        conn,
        &[
            "attributes_cache_v5",
            "group_members_v5",
            "groups_v5",
            "relays_v5",
            "out_clusters_v5",
            "in_clusters_v5",
            "node_descriptors_v5",
            "neighbors_v5",
            "endpoints_v5",
            "devices_v5",
        ],
    )
}

/// v7 added the unsupported_attributes table
fn migrate_to_v7(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(SCHEMA_V7)?;
    copy_tables(
        conn,
        &[
            ("devices_v6", "devices_v7"),
            ("endpoints_v6", "endpoints_v7"),
            ("in_clusters_v6", "in_clusters_v7"),
            ("out_clusters_v6", "out_clusters_v7"),
            ("groups_v6", "groups_v7"),
            ("group_members_v6", "group_members_v7"),
            ("relays_v6", "relays_v7"),
            ("attributes_cache_v6", "attributes_cache_v7"),
            ("node_descriptors_v6", "node_descriptors_v7"),
            ("neighbors_v6", "neighbors_v7"),
        ],
    )?;
    drop_tables(
        conn,
        &[
            "attributes_cache_v6",
            "group_members_v6",
            "groups_v6",
            "relays_v6",
            "out_clusters_v6",
            "in_clusters_v6",
            "node_descriptors_v6",
            "neighbors_v6",
            "endpoints_v6",
            "devices_v6",
        ],
    )
}

/// v8 added devices.last_seen, defaulting migrated rows to the epoch
fn migrate_to_v8(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(SCHEMA_V8)?;
    conn.execute_batch(
        "INSERT OR IGNORE INTO devices_v8 SELECT ieee, nwk, status, 0 FROM devices_v7;",
    )?;
    copy_tables(
        conn,
        &[
            ("endpoints_v7", "endpoints_v8"),
            ("in_clusters_v7", "in_clusters_v8"),
            ("out_clusters_v7", "out_clusters_v8"),
            ("groups_v7", "groups_v8"),
            ("group_members_v7", "group_members_v8"),
            ("relays_v7", "relays_v8"),
            ("attributes_cache_v7", "attributes_cache_v8"),
            ("node_descriptors_v7", "node_descriptors_v8"),
            ("neighbors_v7", "neighbors_v8"),
            ("unsupported_attributes_v7", "unsupported_attributes_v8"),
        ],
    )?;
    drop_tables(
        conn,
        &[
            "unsupported_attributes_v7",
            "attributes_cache_v7",
            "group_members_v7",
            "groups_v7",
            "relays_v7",
            "out_clusters_v7",
            "in_clusters_v7",
            "node_descriptors_v7",
            "neighbors_v7",
            "endpoints_v7",
            "devices_v7",
        ],
    )
}

/// v10 added network_backups (v9 was never released)
fn migrate_to_v10(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(SCHEMA_V10)?;
    copy_tables(
        conn,
        &[
            ("devices_v8", "devices_v10"),
            ("endpoints_v8", "endpoints_v10"),
            ("in_clusters_v8", "in_clusters_v10"),
            ("out_clusters_v8", "out_clusters_v10"),
            ("groups_v8", "groups_v10"),
            ("group_members_v8", "group_members_v10"),
            ("relays_v8", "relays_v10"),
            ("attributes_cache_v8", "attributes_cache_v10"),
            ("node_descriptors_v8", "node_descriptors_v10"),
            ("neighbors_v8", "neighbors_v10"),
            ("unsupported_attributes_v8", "unsupported_attributes_v10"),
        ],
    )?;
    drop_tables(
        conn,
        &[
            "unsupported_attributes_v8",
            "attributes_cache_v8",
            "group_members_v8",
            "groups_v8",
            "relays_v8",
            "out_clusters_v8",
            "in_clusters_v8",
            "node_descriptors_v8",
            "neighbors_v8",
            "endpoints_v8",
            "devices_v8",
        ],
    )
}

/// v11 added routes and the attribute wire-type column; migrated attribute
/// rows carry the Unknown type code until re-observed
fn migrate_to_v11(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(SCHEMA_V11)?;
    copy_tables(
        conn,
        &[
            ("devices_v10", "devices_v11"),
            ("endpoints_v10", "endpoints_v11"),
            ("in_clusters_v10", "in_clusters_v11"),
            ("out_clusters_v10", "out_clusters_v11"),
            ("groups_v10", "groups_v11"),
            ("group_members_v10", "group_members_v11"),
            ("relays_v10", "relays_v11"),
            ("node_descriptors_v10", "node_descriptors_v11"),
            ("neighbors_v10", "neighbors_v11"),
            ("unsupported_attributes_v10", "unsupported_attributes_v11"),
            ("network_backups_v10", "network_backups_v11"),
        ],
    )?;
    conn.execute_batch(
        "INSERT OR IGNORE INTO attributes_cache_v11
             SELECT ieee, endpoint_id, cluster, attrid, value, 255 FROM attributes_cache_v10;",
    )?;
    drop_tables(
        conn,
        &[
            "network_backups_v10",
            "unsupported_attributes_v10",
            "attributes_cache_v10",
            "group_members_v10",
            "groups_v10",
            "relays_v10",
            "out_clusters_v10",
            "in_clusters_v10",
            "node_descriptors_v10",
            "neighbors_v10",
            "endpoints_v10",
            "devices_v10",
        ],
    )
}

// --- Startup load ---------------------------------------------------------

fn parse_ieee(text: &str) -> Option<Eui64> {
    match text.parse() {
        Ok(ieee) => Some(ieee),
        Err(_) => {
            tracing::warn!("Skipping row with malformed IEEE address {text:?}");
            None
        }
    }
}

fn load(conn: &Connection) -> Result<LoadedState, CoreError> {
    let mut devices: HashMap<Eui64, Device> = HashMap::new();

    let mut stmt = conn.prepare("SELECT ieee, nwk, status, last_seen FROM devices_v11")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u16>(1)?,
            row.get::<_, u8>(2)?,
            row.get::<_, f64>(3)?,
        ))
    })?;
    for row in rows {
        let (ieee_text, nwk, status, last_seen) = row?;
        let Some(ieee) = parse_ieee(&ieee_text) else {
            continue;
        };
        let mut device = Device::new(ieee, nwk);
        device.status = DeviceStatus::from_u8(status);
        if last_seen > 0.0 {
            device.last_seen = from_epoch_seconds(last_seen);
        }
        devices.insert(ieee, device);
    }

    let mut stmt = conn.prepare(
        "SELECT ieee, logical_type, complex_descriptor_available, user_descriptor_available,
                aps_flags, frequency_band, mac_capability_flags, manufacturer_code,
                maximum_buffer_size, maximum_incoming_transfer_size, server_mask,
                maximum_outgoing_transfer_size, descriptor_capability_field
         FROM node_descriptors_v11",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u8>(1)?,
            row.get::<_, bool>(2)?,
            row.get::<_, bool>(3)?,
            row.get::<_, u8>(4)?,
            row.get::<_, u8>(5)?,
            row.get::<_, u8>(6)?,
            row.get::<_, u16>(7)?,
            row.get::<_, u8>(8)?,
            row.get::<_, u16>(9)?,
            row.get::<_, u16>(10)?,
            row.get::<_, u16>(11)?,
            row.get::<_, u8>(12)?,
        ))
    })?;
    for row in rows {
        let (
            ieee_text,
            logical_type,
            complex_avail,
            user_avail,
            aps_flags,
            frequency_band,
            mac_flags,
            manufacturer_code,
            max_buffer,
            max_incoming,
            server_mask,
            max_outgoing,
            descriptor_capability,
        ) = row?;
        let Some(ieee) = parse_ieee(&ieee_text) else {
            continue;
        };
        let Ok(logical_type) = LogicalType::try_from(logical_type) else {
            continue;
        };
        if let Some(device) = devices.get_mut(&ieee) {
            device.node_desc = Some(NodeDescriptor {
                logical_type,
                complex_descriptor_available: complex_avail,
                user_descriptor_available: user_avail,
                aps_flags,
                frequency_band: FrequencyBand::from_bits_retain(frequency_band),
                mac_capability_flags: MacCapabilityFlags::from_bits_retain(mac_flags),
                manufacturer_code,
                maximum_buffer_size: max_buffer,
                maximum_incoming_transfer_size: max_incoming,
                server_mask,
                maximum_outgoing_transfer_size: max_outgoing,
                descriptor_capability_field: DescriptorCapability::from_bits_retain(
                    descriptor_capability,
                ),
            });
        }
    }

    let mut stmt = conn.prepare(
        "SELECT ieee, endpoint_id, profile_id, device_type, status FROM endpoints_v11",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u8>(1)?,
            row.get::<_, u16>(2)?,
            row.get::<_, u16>(3)?,
            row.get::<_, u8>(4)?,
        ))
    })?;
    for row in rows {
        let (ieee_text, endpoint_id, profile_id, device_type, status) = row?;
        let Some(ieee) = parse_ieee(&ieee_text) else {
            continue;
        };
        if let Some(device) = devices.get_mut(&ieee) {
            let ep = device.add_endpoint(endpoint_id);
            ep.profile_id = profile_id;
            ep.device_type = device_type;
            ep.status = if status == 0 {
                EndpointStatus::New
            } else {
                EndpointStatus::Initialized
            };
        }
    }

    for (table, direction) in [
        ("in_clusters_v11", ClusterDirection::In),
        ("out_clusters_v11", ClusterDirection::Out),
    ] {
        let mut stmt =
            conn.prepare(&format!("SELECT ieee, endpoint_id, cluster FROM {table}"))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u8>(1)?,
                row.get::<_, u16>(2)?,
            ))
        })?;
        for row in rows {
            let (ieee_text, endpoint_id, cluster) = row?;
            let Some(ieee) = parse_ieee(&ieee_text) else {
                continue;
            };
            if let Some(ep) = devices
                .get_mut(&ieee)
                .and_then(|d| d.endpoints.get_mut(&endpoint_id))
            {
                match direction {
                    ClusterDirection::In => {
                        ep.add_input_cluster(cluster);
                    }
                    ClusterDirection::Out => {
                        ep.add_output_cluster(cluster);
                    }
                }
            }
        }
    }

    let mut stmt = conn.prepare(
        "SELECT ieee, endpoint_id, cluster, attrid, value, attr_type FROM attributes_cache_v11",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u8>(1)?,
            row.get::<_, u16>(2)?,
            row.get::<_, u16>(3)?,
            row.get::<_, Vec<u8>>(4)?,
            row.get::<_, u8>(5)?,
        ))
    })?;
    for row in rows {
        let (ieee_text, endpoint_id, cluster_id, attrid, blob, attr_type) = row?;
        let Some(ieee) = parse_ieee(&ieee_text) else {
            continue;
        };
        let code = TypeCode::try_from(attr_type).unwrap_or(TypeCode::Unknown);
        let Ok((value, _)) = ZclValue::deserialize_as(code, &blob) else {
            tracing::warn!(
                "Skipping undecodable attribute {ieee_text}/{endpoint_id}/{cluster_id:#06x}/{attrid:#06x}"
            );
            continue;
        };

        let Some(device) = devices.get_mut(&ieee) else {
            continue;
        };
        // Rows referencing endpoints or clusters the device no longer has
        // are left on disk but not loaded
        let Some(ep) = device.endpoints.get_mut(&endpoint_id) else {
            continue;
        };
        let Some(cluster) = ep.cluster_mut(cluster_id, ClusterDirection::In) else {
            continue;
        };
        cluster.update_attribute(attrid, value.clone(), Utc::now());

        if cluster_id == zigbee_wire::registry::id::BASIC {
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

    let mut stmt = conn.prepare(
        "SELECT ieee, endpoint_id, cluster, attrid FROM unsupported_attributes_v11",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u8>(1)?,
            row.get::<_, u16>(2)?,
            row.get::<_, u16>(3)?,
        ))
    })?;
    for row in rows {
        let (ieee_text, endpoint_id, cluster_id, attrid) = row?;
        let Some(ieee) = parse_ieee(&ieee_text) else {
            continue;
        };
        if let Some(cluster) = devices
            .get_mut(&ieee)
            .and_then(|d| d.endpoints.get_mut(&endpoint_id))
            .and_then(|ep| ep.cluster_mut(cluster_id, ClusterDirection::In))
        {
            cluster.unsupported_attributes.insert(attrid);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT device_ieee, extended_pan_id, ieee, nwk, device_type, rx_on_when_idle,
                relationship, permit_joining, depth, lqi
         FROM neighbors_v11",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, u16>(3)?,
            row.get::<_, u8>(4)?,
            row.get::<_, u8>(5)?,
            row.get::<_, u8>(6)?,
            row.get::<_, u8>(7)?,
            row.get::<_, u8>(8)?,
            row.get::<_, u8>(9)?,
        ))
    })?;
    for row in rows {
        let (device_text, epid_text, ieee_text, nwk, device_type, rx_on, rel, permit, depth, lqi) =
            row?;
        let (Some(device_ieee), Some(extended_pan_id), Some(ieee)) = (
            parse_ieee(&device_text),
            parse_ieee(&epid_text),
            parse_ieee(&ieee_text),
        ) else {
            continue;
        };
        if let Some(device) = devices.get_mut(&device_ieee) {
            device.neighbors.push(Neighbor {
                extended_pan_id,
                ieee,
                nwk,
                device_type,
                rx_on_when_idle: rx_on,
                relationship: rel,
                permit_joining: permit,
                depth,
                lqi,
            });
        }
    }

    let mut stmt = conn.prepare(
        "SELECT device_ieee, dst_nwk, route_status, memory_constrained, many_to_one,
                route_record_required, next_hop
         FROM routes_v11",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u16>(1)?,
            row.get::<_, u8>(2)?,
            row.get::<_, bool>(3)?,
            row.get::<_, bool>(4)?,
            row.get::<_, bool>(5)?,
            row.get::<_, u16>(6)?,
        ))
    })?;
    for row in rows {
        let (device_text, dst_nwk, status, memory, many, record, next_hop) = row?;
        let Some(device_ieee) = parse_ieee(&device_text) else {
            continue;
        };
        if let Some(device) = devices.get_mut(&device_ieee) {
            device.routes.push(Route {
                dst_nwk,
                route_status: RouteStatus::from_bits(status),
                memory_constrained: memory,
                many_to_one: many,
                route_record_required: record,
                next_hop,
            });
        }
    }

    let mut stmt = conn.prepare("SELECT ieee, relays FROM relays_v11")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;
    for row in rows {
        let (ieee_text, blob) = row?;
        let Some(ieee) = parse_ieee(&ieee_text) else {
            continue;
        };
        if let Some(device) = devices.get_mut(&ieee) {
            device.relays = decode_relays(&blob);
        }
    }

    let mut groups: Vec<Group> = Vec::new();
    let mut stmt = conn.prepare("SELECT group_id, name FROM groups_v11")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, u16>(0)?, row.get::<_, Option<String>>(1)?))
    })?;
    for row in rows {
        let (group_id, name) = row?;
        groups.push(Group::new(
            group_id,
            name.unwrap_or_else(|| format!("Group {group_id:#06x}")),
        ));
    }

    let mut stmt = conn.prepare("SELECT group_id, ieee, endpoint_id FROM group_members_v11")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, u16>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, u8>(2)?,
        ))
    })?;
    for row in rows {
        let (group_id, ieee_text, endpoint_id) = row?;
        let Some(ieee) = parse_ieee(&ieee_text) else {
            continue;
        };
        if let Some(group) = groups.iter_mut().find(|g| g.group_id == group_id) {
            group.members.insert((ieee, endpoint_id));
        }
    }

    let mut backups: Vec<NetworkBackup> = Vec::new();
    let mut stmt = conn.prepare("SELECT backup_json FROM network_backups_v11 ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for row in rows {
        match NetworkBackup::from_json(&row?) {
            Ok(backup) => backups.push(backup),
            Err(err) => tracing::warn!("Skipping unreadable network backup: {err}"),
        }
    }
    backups.sort_by_key(|b| b.backup_time);

    let mut devices: Vec<Device> = devices.into_values().collect();
    devices.sort_by_key(|d| d.ieee);

    tracing::debug!(
        "Loaded {} devices, {} groups, {} backups",
        devices.len(),
        groups.len(),
        backups.len()
    );

    Ok(LoadedState {
        devices,
        groups,
        backups,
    })
}

// --- Writer thread --------------------------------------------------------

fn writer_loop(conn: Connection, rx: mpsc::Receiver<DbCommand>) {
    tracing::debug!("Persistence writer started");

    while let Ok(first) = rx.recv() {
        let mut batch = vec![first];
        let mut flush_acks: Vec<oneshot::Sender<()>> = Vec::new();

        // Coalesce until the queue stays quiet or the batch is full
        if !matches!(batch[0], DbCommand::Flush(_)) {
            while batch.len() < MAX_BATCH {
                match rx.recv_timeout(QUIET_WINDOW) {
                    Ok(DbCommand::Flush(ack)) => {
                        flush_acks.push(ack);
                        break;
                    }
                    Ok(command) => batch.push(command),
                    Err(mpsc::RecvTimeoutError::Timeout) => break,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        if let Some(DbCommand::Flush(_)) = batch.first() {
            let Some(DbCommand::Flush(ack)) = batch.pop() else {
                unreachable!()
            };
            flush_acks.push(ack);
        }

        if !batch.is_empty() {
            if let Err(err) = commit_batch(&conn, &batch) {
                tracing::error!("Failed to commit persistence batch: {err}");
            }
        }

        for ack in flush_acks {
            let _ = ack.send(());
        }
    }

    tracing::debug!("Persistence writer shutting down");
}

fn commit_batch(conn: &Connection, batch: &[DbCommand]) -> Result<(), CoreError> {
    conn.execute_batch("BEGIN")?;
    for command in batch {
        if let Err(err) = apply_command(conn, command) {
            // A single bad row must not poison the batch
            tracing::warn!("Persistence write failed for {command:?}: {err}");
        }
    }
    conn.execute_batch("COMMIT")?;
    Ok(())
}

fn apply_command(conn: &Connection, command: &DbCommand) -> rusqlite::Result<()> {
    match command {
        DbCommand::SaveDevice {
            ieee,
            nwk,
            status,
            last_seen,
        } => {
            conn.execute(
                "INSERT INTO devices_v11 (ieee, nwk, status, last_seen) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(ieee) DO UPDATE SET
                         nwk = excluded.nwk,
                         status = excluded.status,
                         last_seen = excluded.last_seen",
                params![
                    ieee.to_string(),
                    nwk,
                    *status as u8,
                    last_seen.map(epoch_seconds).unwrap_or(0.0)
                ],
            )?;
        }
        DbCommand::UpdateDeviceNwk { ieee, nwk } => {
            conn.execute(
                "UPDATE devices_v11 SET nwk = ?2 WHERE ieee = ?1",
                params![ieee.to_string(), nwk],
            )?;
        }
        DbCommand::UpdateLastSeen { ieee, last_seen } => {
            conn.execute(
                "UPDATE devices_v11 SET last_seen = ?2
                     WHERE ieee = ?1 AND ?2 - last_seen > ?3",
                params![
                    ieee.to_string(),
                    epoch_seconds(*last_seen),
                    MIN_LAST_SEEN_DELTA
                ],
            )?;
        }
        DbCommand::RemoveDevice { ieee } => {
            // Cascades through endpoints, clusters, attributes and
            // group members
            conn.execute(
                "DELETE FROM devices_v11 WHERE ieee = ?1",
                params![ieee.to_string()],
            )?;
        }
        DbCommand::SaveNodeDescriptor { ieee, descriptor } => {
            conn.execute(
                "INSERT INTO node_descriptors_v11 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
                     ON CONFLICT(ieee) DO UPDATE SET
                         logical_type = excluded.logical_type,
                         complex_descriptor_available = excluded.complex_descriptor_available,
                         user_descriptor_available = excluded.user_descriptor_available,
                         aps_flags = excluded.aps_flags,
                         frequency_band = excluded.frequency_band,
                         mac_capability_flags = excluded.mac_capability_flags,
                         manufacturer_code = excluded.manufacturer_code,
                         maximum_buffer_size = excluded.maximum_buffer_size,
                         maximum_incoming_transfer_size = excluded.maximum_incoming_transfer_size,
                         server_mask = excluded.server_mask,
                         maximum_outgoing_transfer_size = excluded.maximum_outgoing_transfer_size,
                         descriptor_capability_field = excluded.descriptor_capability_field",
                params![
                    ieee.to_string(),
                    descriptor.logical_type as u8,
                    descriptor.complex_descriptor_available,
                    descriptor.user_descriptor_available,
                    0u8,
                    descriptor.aps_flags,
                    descriptor.frequency_band.bits(),
                    descriptor.mac_capability_flags.bits(),
                    descriptor.manufacturer_code,
                    descriptor.maximum_buffer_size,
                    descriptor.maximum_incoming_transfer_size,
                    descriptor.server_mask,
                    descriptor.maximum_outgoing_transfer_size,
                    descriptor.descriptor_capability_field.bits(),
                ],
            )?;
        }
        DbCommand::SaveEndpoint {
            ieee,
            endpoint_id,
            profile_id,
            device_type,
            status,
        } => {
            conn.execute(
                "INSERT INTO endpoints_v11 VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(ieee, endpoint_id) DO UPDATE SET
                         profile_id = excluded.profile_id,
                         device_type = excluded.device_type,
                         status = excluded.status",
                params![
                    ieee.to_string(),
                    endpoint_id,
                    profile_id,
                    device_type,
                    *status as u8
                ],
            )?;
        }
        DbCommand::SaveCluster {
            ieee,
            endpoint_id,
            direction,
            cluster,
        } => {
            let table = match direction {
                ClusterDirection::In => "in_clusters_v11",
                ClusterDirection::Out => "out_clusters_v11",
            };
            conn.execute(
                &format!("INSERT OR IGNORE INTO {table} VALUES (?1, ?2, ?3)"),
                params![ieee.to_string(), endpoint_id, cluster],
            )?;
        }
        DbCommand::SaveAttribute {
            ieee,
            endpoint_id,
            cluster,
            attrid,
            value,
            observed,
        } => {
            let mut blob = Vec::new();
            value.serialize_payload(&mut blob);
            conn.execute(
                "INSERT INTO attributes_cache_v11 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(ieee, endpoint_id, cluster, attrid) DO UPDATE SET
                         value = excluded.value,
                         attr_type = excluded.attr_type",
                params![
                    ieee.to_string(),
                    endpoint_id,
                    cluster,
                    attrid,
                    blob,
                    value.type_code() as u8
                ],
            )?;
            let _ = observed;
        }
        DbCommand::SaveUnsupportedAttribute {
            ieee,
            endpoint_id,
            cluster,
            attrid,
        } => {
            conn.execute(
                "INSERT OR IGNORE INTO unsupported_attributes_v11 VALUES (?1, ?2, ?3, ?4)",
                params![ieee.to_string(), endpoint_id, cluster, attrid],
            )?;
        }
        DbCommand::SaveGroup { group_id, name } => {
            conn.execute(
                "INSERT INTO groups_v11 VALUES (?1, ?2)
                     ON CONFLICT(group_id) DO UPDATE SET name = excluded.name",
                params![group_id, name],
            )?;
        }
        DbCommand::RemoveGroup { group_id } => {
            conn.execute(
                "DELETE FROM groups_v11 WHERE group_id = ?1",
                params![group_id],
            )?;
        }
        DbCommand::SaveGroupMember {
            group_id,
            ieee,
            endpoint_id,
        } => {
            conn.execute(
                "INSERT OR IGNORE INTO group_members_v11 VALUES (?1, ?2, ?3)",
                params![group_id, ieee.to_string(), endpoint_id],
            )?;
        }
        DbCommand::RemoveGroupMember {
            group_id,
            ieee,
            endpoint_id,
        } => {
            conn.execute(
                "DELETE FROM group_members_v11
                     WHERE group_id = ?1 AND ieee = ?2 AND endpoint_id = ?3",
                params![group_id, ieee.to_string(), endpoint_id],
            )?;
        }
        DbCommand::SaveRelays { ieee, relays } => {
            conn.execute(
                "INSERT INTO relays_v11 VALUES (?1, ?2)
                     ON CONFLICT(ieee) DO UPDATE SET relays = excluded.relays",
                params![ieee.to_string(), encode_relays(relays)],
            )?;
        }
        DbCommand::ReplaceNeighbors { ieee, neighbors } => {
            conn.execute(
                "DELETE FROM neighbors_v11 WHERE device_ieee = ?1",
                params![ieee.to_string()],
            )?;
            let mut insert = conn.prepare_cached(
                "INSERT INTO neighbors_v11 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            )?;
            for neighbor in neighbors {
                insert.execute(params![
                    ieee.to_string(),
                    neighbor.extended_pan_id.to_string(),
                    neighbor.ieee.to_string(),
                    neighbor.nwk,
                    neighbor.device_type,
                    neighbor.rx_on_when_idle,
                    neighbor.relationship,
                    neighbor.permit_joining,
                    neighbor.depth,
                    neighbor.lqi,
                ])?;
            }
        }
        DbCommand::ReplaceRoutes { ieee, routes } => {
            conn.execute(
                "DELETE FROM routes_v11 WHERE device_ieee = ?1",
                params![ieee.to_string()],
            )?;
            let mut insert = conn
                .prepare_cached("INSERT INTO routes_v11 VALUES (?1,?2,?3,?4,?5,?6,?7)")?;
            for route in routes {
                insert.execute(params![
                    ieee.to_string(),
                    route.dst_nwk,
                    route.route_status as u8,
                    route.memory_constrained,
                    route.many_to_one,
                    route.route_record_required,
                    route.next_hop,
                ])?;
            }
        }
        DbCommand::SaveNetworkBackup { backup_json } => {
            conn.execute(
                "INSERT INTO network_backups_v11 (backup_json) VALUES (?1)",
                params![backup_json],
            )?;
        }
        DbCommand::Flush(_) => {}
    }
    Ok(())
}
