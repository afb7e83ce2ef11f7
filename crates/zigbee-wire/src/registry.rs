//! Cluster schema registry
//!
//! Maps cluster identifiers to their attribute and command schemas so the
//! dispatch layer can pick codecs for attribute values and resolve
//! cluster-specific command ids. Manufacturer-specific clusters are keyed by
//! (manufacturer code, cluster id); anything not registered degrades to an
//! unknown cluster whose frames are still delivered as raw bytes.

use crate::value::TypeCode;
use bitflags::bitflags;
use std::collections::HashMap;

/// Well-known cluster IDs
pub mod id {
    // General
    pub const BASIC: u16 = 0x0000;
    pub const POWER_CONFIG: u16 = 0x0001;
    pub const DEVICE_TEMP: u16 = 0x0002;
    pub const IDENTIFY: u16 = 0x0003;
    pub const GROUPS: u16 = 0x0004;
    pub const SCENES: u16 = 0x0005;
    pub const ON_OFF: u16 = 0x0006;
    pub const ON_OFF_SWITCH_CONFIG: u16 = 0x0007;
    pub const LEVEL_CONTROL: u16 = 0x0008;
    pub const ALARMS: u16 = 0x0009;
    pub const TIME: u16 = 0x000A;
    pub const OTA_UPGRADE: u16 = 0x0019;

    // Closures
    pub const DOOR_LOCK: u16 = 0x0101;
    pub const WINDOW_COVERING: u16 = 0x0102;

    // HVAC
    pub const THERMOSTAT: u16 = 0x0201;
    pub const FAN_CONTROL: u16 = 0x0202;

    // Lighting
    pub const COLOR_CONTROL: u16 = 0x0300;
    pub const BALLAST_CONFIG: u16 = 0x0301;

    // Measurement
    pub const ILLUMINANCE_MEASUREMENT: u16 = 0x0400;
    pub const TEMPERATURE_MEASUREMENT: u16 = 0x0402;
    pub const PRESSURE_MEASUREMENT: u16 = 0x0403;
    pub const FLOW_MEASUREMENT: u16 = 0x0404;
    pub const HUMIDITY_MEASUREMENT: u16 = 0x0405;
    pub const OCCUPANCY_SENSING: u16 = 0x0406;

    // Security
    pub const IAS_ZONE: u16 = 0x0500;

    // Smart energy
    pub const METERING: u16 = 0x0702;
    pub const ELECTRICAL_MEASUREMENT: u16 = 0x0B04;
}

/// Basic cluster attribute IDs
pub mod basic_attrs {
    pub const ZCL_VERSION: u16 = 0x0000;
    pub const APPLICATION_VERSION: u16 = 0x0001;
    pub const STACK_VERSION: u16 = 0x0002;
    pub const HW_VERSION: u16 = 0x0003;
    pub const MANUFACTURER_NAME: u16 = 0x0004;
    pub const MODEL_IDENTIFIER: u16 = 0x0005;
    pub const DATE_CODE: u16 = 0x0006;
    pub const POWER_SOURCE: u16 = 0x0007;
    pub const SW_BUILD_ID: u16 = 0x4000;
}

/// OTA Upgrade cluster attribute IDs
pub mod ota_attrs {
    pub const UPGRADE_SERVER_ID: u16 = 0x0000;
    pub const FILE_OFFSET: u16 = 0x0001;
    pub const CURRENT_FILE_VERSION: u16 = 0x0002;
    pub const IMAGE_UPGRADE_STATUS: u16 = 0x0006;
    pub const MANUFACTURER_ID: u16 = 0x0007;
    pub const MINIMUM_BLOCK_REQ_DELAY: u16 = 0x0009;
}

/// Profile IDs
pub mod profiles {
    pub const ZDO: u16 = 0x0000;
    pub const HOME_AUTOMATION: u16 = 0x0104;
    pub const GREEN_POWER: u16 = 0xA1E0;
}

/// Green Power devices use this fixed endpoint
pub const GREEN_POWER_ENDPOINT: u8 = 242;

bitflags! {
    /// Attribute access bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const REPORT = 0b0100;
        const SCENE = 0b1000;
    }
}

/// Schema of a single attribute
#[derive(Debug, Clone)]
pub struct AttributeDef {
    pub id: u16,
    pub name: &'static str,
    pub type_code: TypeCode,
    pub access: Access,
    pub mandatory: bool,
}

/// Schema of a single cluster-specific command
#[derive(Debug, Clone)]
pub struct CommandDef {
    pub id: u8,
    pub name: &'static str,
    /// Command id of the expected reply, if the command solicits one
    pub response: Option<u8>,
}

/// Schema of one cluster
#[derive(Debug, Clone)]
pub struct ClusterDef {
    pub id: u16,
    pub name: &'static str,
    pub attributes: HashMap<u16, AttributeDef>,
    /// Commands received by the server (client → server)
    pub server_commands: HashMap<u8, CommandDef>,
    /// Commands generated by the server (server → client)
    pub client_commands: HashMap<u8, CommandDef>,
}

impl ClusterDef {
    fn new(id: u16, name: &'static str) -> Self {
        Self {
            id,
            name,
            attributes: HashMap::new(),
            server_commands: HashMap::new(),
            client_commands: HashMap::new(),
        }
    }

    fn attr(mut self, id: u16, name: &'static str, type_code: TypeCode, access: Access) -> Self {
        self.attributes.insert(
            id,
            AttributeDef {
                id,
                name,
                type_code,
                access,
                mandatory: false,
            },
        );
        self
    }

    fn mandatory_attr(
        mut self,
        id: u16,
        name: &'static str,
        type_code: TypeCode,
        access: Access,
    ) -> Self {
        self.attributes.insert(
            id,
            AttributeDef {
                id,
                name,
                type_code,
                access,
                mandatory: true,
            },
        );
        self
    }

    fn server_cmd(mut self, id: u8, name: &'static str, response: Option<u8>) -> Self {
        self.server_commands.insert(id, CommandDef { id, name, response });
        self
    }

    fn client_cmd(mut self, id: u8, name: &'static str, response: Option<u8>) -> Self {
        self.client_commands.insert(id, CommandDef { id, name, response });
        self
    }

    /// The wire type of an attribute, if the schema knows it
    #[must_use]
    pub fn attribute_type(&self, attrid: u16) -> Option<TypeCode> {
        self.attributes.get(&attrid).map(|a| a.type_code)
    }
}

/// Process-wide cluster schema lookup. Effectively immutable after
/// construction.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    standard: HashMap<u16, ClusterDef>,
    manufacturer_specific: HashMap<(u16, u16), ClusterDef>,
}

impl ClusterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: ClusterDef) {
        self.standard.insert(def.id, def);
    }

    pub fn register_manufacturer_specific(&mut self, manufacturer: u16, def: ClusterDef) {
        self.manufacturer_specific.insert((manufacturer, def.id), def);
    }

    /// Look up a cluster definition, preferring a manufacturer-specific
    /// entry when a manufacturer code is present
    #[must_use]
    pub fn get(&self, cluster_id: u16, manufacturer: Option<u16>) -> Option<&ClusterDef> {
        if let Some(code) = manufacturer {
            if let Some(def) = self.manufacturer_specific.get(&(code, cluster_id)) {
                return Some(def);
            }
        }
        self.standard.get(&cluster_id)
    }

    #[must_use]
    pub fn attribute_type(&self, cluster_id: u16, attrid: u16) -> Option<TypeCode> {
        self.standard
            .get(&cluster_id)
            .and_then(|def| def.attribute_type(attrid))
    }

    /// Registry pre-populated with the standard cluster library
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let rw = Access::READ | Access::WRITE;
        let r = Access::READ;
        let rp = Access::READ | Access::REPORT;

        registry.register(
            ClusterDef::new(id::BASIC, "Basic")
                .mandatory_attr(basic_attrs::ZCL_VERSION, "zcl_version", TypeCode::Uint8, r)
                .attr(basic_attrs::APPLICATION_VERSION, "app_version", TypeCode::Uint8, r)
                .attr(basic_attrs::STACK_VERSION, "stack_version", TypeCode::Uint8, r)
                .attr(basic_attrs::HW_VERSION, "hw_version", TypeCode::Uint8, r)
                .attr(basic_attrs::MANUFACTURER_NAME, "manufacturer", TypeCode::CharString, r)
                .attr(basic_attrs::MODEL_IDENTIFIER, "model", TypeCode::CharString, r)
                .attr(basic_attrs::DATE_CODE, "date_code", TypeCode::CharString, r)
                .mandatory_attr(basic_attrs::POWER_SOURCE, "power_source", TypeCode::Enum8, r)
                .attr(basic_attrs::SW_BUILD_ID, "sw_build_id", TypeCode::CharString, r)
                .server_cmd(0x00, "reset_fact_default", None),
        );

        registry.register(
            ClusterDef::new(id::POWER_CONFIG, "Power Configuration")
                .attr(0x0020, "battery_voltage", TypeCode::Uint8, rp)
                .attr(0x0021, "battery_percentage_remaining", TypeCode::Uint8, rp),
        );

        registry.register(
            ClusterDef::new(id::DEVICE_TEMP, "Device Temperature")
                .attr(0x0000, "current_temperature", TypeCode::Int16, rp),
        );

        registry.register(
            ClusterDef::new(id::IDENTIFY, "Identify")
                .mandatory_attr(0x0000, "identify_time", TypeCode::Uint16, rw)
                .server_cmd(0x00, "identify", None)
                .server_cmd(0x01, "identify_query", Some(0x00))
                .client_cmd(0x00, "identify_query_response", None),
        );

        registry.register(
            ClusterDef::new(id::GROUPS, "Groups")
                .mandatory_attr(0x0000, "name_support", TypeCode::Bitmap8, r)
                .server_cmd(0x00, "add", Some(0x00))
                .server_cmd(0x01, "view", Some(0x01))
                .server_cmd(0x02, "get_membership", Some(0x02))
                .server_cmd(0x03, "remove", Some(0x03))
                .server_cmd(0x04, "remove_all", None)
                .server_cmd(0x05, "add_if_identifying", None)
                .client_cmd(0x00, "add_response", None)
                .client_cmd(0x01, "view_response", None)
                .client_cmd(0x02, "get_membership_response", None)
                .client_cmd(0x03, "remove_response", None),
        );

        registry.register(
            ClusterDef::new(id::SCENES, "Scenes")
                .attr(0x0000, "count", TypeCode::Uint8, r)
                .attr(0x0001, "current_scene", TypeCode::Uint8, r)
                .attr(0x0002, "current_group", TypeCode::Uint16, r)
                .server_cmd(0x00, "add", Some(0x00))
                .server_cmd(0x01, "view", Some(0x01))
                .server_cmd(0x02, "remove", Some(0x02))
                .server_cmd(0x04, "store", Some(0x04))
                .server_cmd(0x05, "recall", None),
        );

        registry.register(
            ClusterDef::new(id::ON_OFF, "On/Off")
                .mandatory_attr(
                    0x0000,
                    "on_off",
                    TypeCode::Bool,
                    Access::READ | Access::REPORT | Access::SCENE,
                )
                .server_cmd(0x00, "off", None)
                .server_cmd(0x01, "on", None)
                .server_cmd(0x02, "toggle", None),
        );

        registry.register(
            ClusterDef::new(id::LEVEL_CONTROL, "Level Control")
                .mandatory_attr(
                    0x0000,
                    "current_level",
                    TypeCode::Uint8,
                    Access::READ | Access::REPORT | Access::SCENE,
                )
                .server_cmd(0x00, "move_to_level", None)
                .server_cmd(0x01, "move", None)
                .server_cmd(0x02, "step", None)
                .server_cmd(0x03, "stop", None)
                .server_cmd(0x04, "move_to_level_with_on_off", None),
        );

        registry.register(
            ClusterDef::new(id::ALARMS, "Alarms")
                .attr(0x0000, "alarm_count", TypeCode::Uint16, r)
                .server_cmd(0x00, "reset_alarm", None)
                .client_cmd(0x00, "alarm", None),
        );

        registry.register(
            ClusterDef::new(id::TIME, "Time")
                .mandatory_attr(0x0000, "time", TypeCode::UtcTime, rw)
                .mandatory_attr(0x0001, "time_status", TypeCode::Bitmap8, rw),
        );

        registry.register(
            ClusterDef::new(id::OTA_UPGRADE, "OTA Upgrade")
                .mandatory_attr(ota_attrs::UPGRADE_SERVER_ID, "upgrade_server_id", TypeCode::Ieee, r)
                .attr(ota_attrs::FILE_OFFSET, "file_offset", TypeCode::Uint32, r)
                .attr(ota_attrs::CURRENT_FILE_VERSION, "current_file_version", TypeCode::Uint32, r)
                .mandatory_attr(
                    ota_attrs::IMAGE_UPGRADE_STATUS,
                    "image_upgrade_status",
                    TypeCode::Enum8,
                    r,
                )
                .attr(ota_attrs::MANUFACTURER_ID, "manufacturer_id", TypeCode::Uint16, r)
                .attr(
                    ota_attrs::MINIMUM_BLOCK_REQ_DELAY,
                    "minimum_block_req_delay",
                    TypeCode::Uint16,
                    r,
                )
                .server_cmd(0x01, "query_next_image", Some(0x02))
                .server_cmd(0x03, "image_block", Some(0x05))
                .server_cmd(0x04, "image_page", Some(0x05))
                .server_cmd(0x06, "upgrade_end", Some(0x07))
                .server_cmd(0x08, "query_specific_file", Some(0x09))
                .client_cmd(0x00, "image_notify", None)
                .client_cmd(0x02, "query_next_image_response", None)
                .client_cmd(0x05, "image_block_response", None)
                .client_cmd(0x07, "upgrade_end_response", None),
        );

        registry.register(
            ClusterDef::new(id::DOOR_LOCK, "Door Lock")
                .mandatory_attr(0x0000, "lock_state", TypeCode::Enum8, rp)
                .server_cmd(0x00, "lock_door", Some(0x00))
                .server_cmd(0x01, "unlock_door", Some(0x01)),
        );

        registry.register(
            ClusterDef::new(id::WINDOW_COVERING, "Window Covering")
                .attr(0x0008, "current_position_lift_percentage", TypeCode::Uint8, rp)
                .server_cmd(0x00, "up_open", None)
                .server_cmd(0x01, "down_close", None)
                .server_cmd(0x02, "stop", None),
        );

        registry.register(
            ClusterDef::new(id::THERMOSTAT, "Thermostat")
                .mandatory_attr(0x0000, "local_temperature", TypeCode::Int16, rp)
                .attr(0x0011, "occupied_cooling_setpoint", TypeCode::Int16, rw)
                .attr(0x0012, "occupied_heating_setpoint", TypeCode::Int16, rw)
                .attr(0x001C, "system_mode", TypeCode::Enum8, rw)
                .server_cmd(0x00, "setpoint_raise_lower", None),
        );

        registry.register(
            ClusterDef::new(id::FAN_CONTROL, "Fan Control")
                .mandatory_attr(0x0000, "fan_mode", TypeCode::Enum8, rw),
        );

        registry.register(
            ClusterDef::new(id::COLOR_CONTROL, "Color Control")
                .attr(0x0000, "current_hue", TypeCode::Uint8, rp)
                .attr(0x0001, "current_saturation", TypeCode::Uint8, rp)
                .attr(0x0003, "current_x", TypeCode::Uint16, rp)
                .attr(0x0004, "current_y", TypeCode::Uint16, rp)
                .attr(0x0007, "color_temperature", TypeCode::Uint16, rp)
                .server_cmd(0x00, "move_to_hue", None)
                .server_cmd(0x03, "move_to_saturation", None)
                .server_cmd(0x06, "move_to_hue_and_saturation", None)
                .server_cmd(0x07, "move_to_color", None)
                .server_cmd(0x0A, "move_to_color_temp", None),
        );

        registry.register(
            ClusterDef::new(id::ILLUMINANCE_MEASUREMENT, "Illuminance Measurement")
                .mandatory_attr(0x0000, "measured_value", TypeCode::Uint16, rp),
        );
        registry.register(
            ClusterDef::new(id::TEMPERATURE_MEASUREMENT, "Temperature Measurement")
                .mandatory_attr(0x0000, "measured_value", TypeCode::Int16, rp),
        );
        registry.register(
            ClusterDef::new(id::PRESSURE_MEASUREMENT, "Pressure Measurement")
                .mandatory_attr(0x0000, "measured_value", TypeCode::Int16, rp),
        );
        registry.register(
            ClusterDef::new(id::FLOW_MEASUREMENT, "Flow Measurement")
                .mandatory_attr(0x0000, "measured_value", TypeCode::Uint16, rp),
        );
        registry.register(
            ClusterDef::new(id::HUMIDITY_MEASUREMENT, "Relative Humidity Measurement")
                .mandatory_attr(0x0000, "measured_value", TypeCode::Uint16, rp),
        );
        registry.register(
            ClusterDef::new(id::OCCUPANCY_SENSING, "Occupancy Sensing")
                .mandatory_attr(0x0000, "occupancy", TypeCode::Bitmap8, rp)
                .mandatory_attr(0x0001, "occupancy_sensor_type", TypeCode::Enum8, r),
        );

        registry.register(
            ClusterDef::new(id::IAS_ZONE, "IAS Zone")
                .mandatory_attr(0x0000, "zone_state", TypeCode::Enum8, r)
                .mandatory_attr(0x0001, "zone_type", TypeCode::Enum16, r)
                .mandatory_attr(0x0002, "zone_status", TypeCode::Bitmap16, r)
                .server_cmd(0x00, "enroll_response", None)
                .client_cmd(0x00, "status_change_notification", None)
                .client_cmd(0x01, "enroll", Some(0x00)),
        );

        registry.register(
            ClusterDef::new(id::METERING, "Metering")
                .attr(0x0000, "current_summ_delivered", TypeCode::Uint48, rp)
                .attr(0x0400, "instantaneous_demand", TypeCode::Int24, rp),
        );

        registry.register(
            ClusterDef::new(id::ELECTRICAL_MEASUREMENT, "Electrical Measurement")
                .attr(0x0505, "rms_voltage", TypeCode::Uint16, rp)
                .attr(0x0508, "rms_current", TypeCode::Uint16, rp)
                .attr(0x050B, "active_power", TypeCode::Int16, rp),
        );

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let registry = ClusterRegistry::builtin();
        let basic = registry.get(id::BASIC, None).expect("basic cluster");
        assert_eq!(basic.name, "Basic");
        assert_eq!(
            basic.attribute_type(basic_attrs::MANUFACTURER_NAME),
            Some(TypeCode::CharString)
        );

        assert!(registry.get(0xFC00, None).is_none());
    }

    #[test]
    fn test_manufacturer_specific_precedence() {
        let mut registry = ClusterRegistry::builtin();
        registry.register_manufacturer_specific(
            0x117C,
            ClusterDef::new(0xFC7C, "IKEA AirPurifier").attr(
                0x0004,
                "fan_mode",
                TypeCode::Uint8,
                Access::READ | Access::WRITE,
            ),
        );

        assert!(registry.get(0xFC7C, None).is_none());
        assert!(registry.get(0xFC7C, Some(0x117C)).is_some());
        // A manufacturer code never hides the standard definition
        assert!(registry.get(id::ON_OFF, Some(0x117C)).is_some());
    }

    #[test]
    fn test_command_response_mapping() {
        let registry = ClusterRegistry::builtin();
        let ota = registry.get(id::OTA_UPGRADE, None).unwrap();
        assert_eq!(ota.server_commands[&0x01].response, Some(0x02));
        assert_eq!(ota.server_commands[&0x06].response, Some(0x07));
        assert!(ota.client_commands[&0x00].response.is_none());
    }

    #[test]
    fn test_odd_width_metering_types() {
        let registry = ClusterRegistry::builtin();
        assert_eq!(
            registry.attribute_type(id::METERING, 0x0000),
            Some(TypeCode::Uint48)
        );
        assert_eq!(
            registry.attribute_type(id::METERING, 0x0400),
            Some(TypeCode::Int24)
        );
    }
}
