//! ZCL frame header and general (profile-wide) commands
//!
//! Frame format:
//! ```text
//! [Frame control: 1 byte]
//! [Manufacturer code: 2 bytes LE] (only if the MS bit is set)
//! [Transaction sequence number: 1 byte]
//! [Command ID: 1 byte]
//! [Payload: variable]
//! ```

use crate::error::WireError;
use crate::types::WireFormat;
use crate::value::{TypeCode, ZclValue};

/// ZCL frame type (frame control bits 0-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Global = 0b00,
    ClusterSpecific = 0b01,
}

/// ZCL frame direction (frame control bit 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    ClientToServer = 0,
    ServerToClient = 1,
}

impl Direction {
    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Self::ClientToServer => Self::ServerToClient,
            Self::ServerToClient => Self::ClientToServer,
        }
    }
}

/// Decoded ZCL frame control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameControl {
    pub frame_type: FrameType,
    pub manufacturer_specific: bool,
    pub direction: Direction,
    pub disable_default_response: bool,
}

impl FrameControl {
    #[must_use]
    pub fn general(direction: Direction) -> Self {
        Self {
            frame_type: FrameType::Global,
            manufacturer_specific: false,
            direction,
            // Replies never solicit a default response of their own
            disable_default_response: direction == Direction::ServerToClient,
        }
    }

    #[must_use]
    pub fn cluster(direction: Direction) -> Self {
        Self {
            frame_type: FrameType::ClusterSpecific,
            manufacturer_specific: false,
            direction,
            disable_default_response: direction == Direction::ServerToClient,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, WireError> {
        let frame_type = match byte & 0x03 {
            0b00 => FrameType::Global,
            0b01 => FrameType::ClusterSpecific,
            other => {
                return Err(WireError::InvalidFrame(format!(
                    "Reserved ZCL frame type: {other:#04b}"
                )))
            }
        };

        Ok(Self {
            frame_type,
            manufacturer_specific: (byte & 0x04) != 0,
            direction: if (byte & 0x08) != 0 {
                Direction::ServerToClient
            } else {
                Direction::ClientToServer
            },
            disable_default_response: (byte & 0x10) != 0,
        })
    }

    #[must_use]
    pub fn to_byte(self) -> u8 {
        let mut byte = self.frame_type as u8;
        if self.manufacturer_specific {
            byte |= 0x04;
        }
        if self.direction == Direction::ServerToClient {
            byte |= 0x08;
        }
        if self.disable_default_response {
            byte |= 0x10;
        }
        byte
    }
}

/// ZCL frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZclHeader {
    pub frame_control: FrameControl,
    pub manufacturer: Option<u16>,
    pub tsn: u8,
    pub command_id: u8,
}

impl ZclHeader {
    /// Header for a general (profile-wide) command
    #[must_use]
    pub fn general(tsn: u8, command_id: GeneralCommandId, direction: Direction) -> Self {
        Self {
            frame_control: FrameControl::general(direction),
            manufacturer: None,
            tsn,
            command_id: command_id as u8,
        }
    }

    /// Header for a cluster-specific command
    #[must_use]
    pub fn cluster(tsn: u8, command_id: u8, direction: Direction) -> Self {
        Self {
            frame_control: FrameControl::cluster(direction),
            manufacturer: None,
            tsn,
            command_id,
        }
    }

    #[must_use]
    pub fn with_manufacturer(mut self, manufacturer: u16) -> Self {
        self.frame_control.manufacturer_specific = true;
        self.manufacturer = Some(manufacturer);
        self
    }

    #[must_use]
    pub fn is_general(&self) -> bool {
        self.frame_control.frame_type == FrameType::Global
    }

    #[must_use]
    pub fn is_cluster(&self) -> bool {
        self.frame_control.frame_type == FrameType::ClusterSpecific
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.frame_control.direction
    }
}

impl WireFormat for ZclHeader {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.frame_control.to_byte());
        if self.frame_control.manufacturer_specific {
            if let Some(code) = self.manufacturer {
                code.serialize(out);
            }
        }
        out.push(self.tsn);
        out.push(self.command_id);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (control, data) = u8::deserialize(data)?;
        let frame_control = FrameControl::from_byte(control)?;

        let (manufacturer, data) = if frame_control.manufacturer_specific {
            let (code, rest) = u16::deserialize(data)?;
            (Some(code), rest)
        } else {
            (None, data)
        };

        let (tsn, data) = u8::deserialize(data)?;
        let (command_id, data) = u8::deserialize(data)?;

        Ok((
            Self {
                frame_control,
                manufacturer,
                tsn,
                command_id,
            },
            data,
        ))
    }
}

/// ZCL status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Success = 0x00,
    Failure = 0x01,
    NotAuthorized = 0x7E,
    MalformedCommand = 0x80,
    UnsupClusterCommand = 0x81,
    UnsupGeneralCommand = 0x82,
    UnsupManufClusterCommand = 0x83,
    UnsupManufGeneralCommand = 0x84,
    InvalidField = 0x85,
    UnsupportedAttribute = 0x86,
    InvalidValue = 0x87,
    ReadOnly = 0x88,
    InsufficientSpace = 0x89,
    DuplicateExists = 0x8A,
    NotFound = 0x8B,
    UnreportableAttribute = 0x8C,
    InvalidDataType = 0x8D,
    InvalidSelector = 0x8E,
    WriteOnly = 0x8F,
    InconsistentStartupState = 0x90,
    DefinedOutOfBand = 0x91,
    Inconsistent = 0x92,
    ActionDenied = 0x93,
    Timeout = 0x94,
    Abort = 0x95,
    InvalidImage = 0x96,
    WaitForData = 0x97,
    NoImageAvailable = 0x98,
    RequireMoreImage = 0x99,
    NotificationPending = 0x9A,
    HardwareFailure = 0xC0,
    SoftwareFailure = 0xC1,
    CalibrationError = 0xC2,
    UnsupportedCluster = 0xC3,
}

impl TryFrom<u8> for Status {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Success,
            0x01 => Self::Failure,
            0x7E => Self::NotAuthorized,
            0x80 => Self::MalformedCommand,
            0x81 => Self::UnsupClusterCommand,
            0x82 => Self::UnsupGeneralCommand,
            0x83 => Self::UnsupManufClusterCommand,
            0x84 => Self::UnsupManufGeneralCommand,
            0x85 => Self::InvalidField,
            0x86 => Self::UnsupportedAttribute,
            0x87 => Self::InvalidValue,
            0x88 => Self::ReadOnly,
            0x89 => Self::InsufficientSpace,
            0x8A => Self::DuplicateExists,
            0x8B => Self::NotFound,
            0x8C => Self::UnreportableAttribute,
            0x8D => Self::InvalidDataType,
            0x8E => Self::InvalidSelector,
            0x8F => Self::WriteOnly,
            0x90 => Self::InconsistentStartupState,
            0x91 => Self::DefinedOutOfBand,
            0x92 => Self::Inconsistent,
            0x93 => Self::ActionDenied,
            0x94 => Self::Timeout,
            0x95 => Self::Abort,
            0x96 => Self::InvalidImage,
            0x97 => Self::WaitForData,
            0x98 => Self::NoImageAvailable,
            0x99 => Self::RequireMoreImage,
            0x9A => Self::NotificationPending,
            0xC0 => Self::HardwareFailure,
            0xC1 => Self::SoftwareFailure,
            0xC2 => Self::CalibrationError,
            0xC3 => Self::UnsupportedCluster,
            other => {
                return Err(WireError::ValueOutOfRange {
                    context: "Status",
                    value: i128::from(other),
                })
            }
        })
    }
}

impl WireFormat for Status {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (byte, rest) = u8::deserialize(data)?;
        Ok((Status::try_from(byte)?, rest))
    }
}

/// ZCL general command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GeneralCommandId {
    ReadAttributes = 0x00,
    ReadAttributesResponse = 0x01,
    WriteAttributes = 0x02,
    WriteAttributesUndivided = 0x03,
    WriteAttributesResponse = 0x04,
    WriteAttributesNoResponse = 0x05,
    ConfigureReporting = 0x06,
    ConfigureReportingResponse = 0x07,
    ReadReportingConfiguration = 0x08,
    ReadReportingConfigurationResponse = 0x09,
    ReportAttributes = 0x0A,
    DefaultResponse = 0x0B,
    DiscoverAttributes = 0x0C,
    DiscoverAttributesResponse = 0x0D,
    DiscoverCommandsReceived = 0x11,
    DiscoverCommandsReceivedResponse = 0x12,
    DiscoverCommandsGenerated = 0x13,
    DiscoverCommandsGeneratedResponse = 0x14,
    DiscoverAttributesExtended = 0x15,
    DiscoverAttributesExtendedResponse = 0x16,
}

impl TryFrom<u8> for GeneralCommandId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::ReadAttributes,
            0x01 => Self::ReadAttributesResponse,
            0x02 => Self::WriteAttributes,
            0x03 => Self::WriteAttributesUndivided,
            0x04 => Self::WriteAttributesResponse,
            0x05 => Self::WriteAttributesNoResponse,
            0x06 => Self::ConfigureReporting,
            0x07 => Self::ConfigureReportingResponse,
            0x08 => Self::ReadReportingConfiguration,
            0x09 => Self::ReadReportingConfigurationResponse,
            0x0A => Self::ReportAttributes,
            0x0B => Self::DefaultResponse,
            0x0C => Self::DiscoverAttributes,
            0x0D => Self::DiscoverAttributesResponse,
            0x11 => Self::DiscoverCommandsReceived,
            0x12 => Self::DiscoverCommandsReceivedResponse,
            0x13 => Self::DiscoverCommandsGenerated,
            0x14 => Self::DiscoverCommandsGeneratedResponse,
            0x15 => Self::DiscoverAttributesExtended,
            0x16 => Self::DiscoverAttributesExtendedResponse,
            other => {
                return Err(WireError::ValueOutOfRange {
                    context: "GeneralCommandId",
                    value: i128::from(other),
                })
            }
        })
    }
}

fn read_remaining<T: WireFormat>(mut data: &[u8]) -> Result<Vec<T>, WireError> {
    let mut items = Vec::new();
    while !data.is_empty() {
        let (item, rest) = T::deserialize(data)?;
        items.push(item);
        data = rest;
    }
    Ok(items)
}

/// Read-Attributes request: the attribute ids fill the rest of the frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAttributes {
    pub attribute_ids: Vec<u16>,
}

impl WireFormat for ReadAttributes {
    fn serialize(&self, out: &mut Vec<u8>) {
        for id in &self.attribute_ids {
            id.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        Ok((
            Self {
                attribute_ids: read_remaining(data)?,
            },
            &[],
        ))
    }
}

/// One record of a Read-Attributes response
#[derive(Debug, Clone, PartialEq)]
pub struct ReadAttributeRecord {
    pub attrid: u16,
    pub status: Status,
    /// Present only when status is SUCCESS
    pub value: Option<ZclValue>,
}

impl WireFormat for ReadAttributeRecord {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.attrid.serialize(out);
        self.status.serialize(out);
        if let Some(value) = &self.value {
            value.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (attrid, data) = u16::deserialize(data)?;
        let (status, data) = Status::deserialize(data)?;
        let (value, data) = if status == Status::Success {
            let (value, rest) = ZclValue::deserialize(data)?;
            (Some(value), rest)
        } else {
            (None, data)
        };
        Ok((
            Self {
                attrid,
                status,
                value,
            },
            data,
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadAttributesResponse {
    pub records: Vec<ReadAttributeRecord>,
}

impl WireFormat for ReadAttributesResponse {
    fn serialize(&self, out: &mut Vec<u8>) {
        for record in &self.records {
            record.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        Ok((
            Self {
                records: read_remaining(data)?,
            },
            &[],
        ))
    }
}

/// An attribute id paired with its tagged value
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub attrid: u16,
    pub value: ZclValue,
}

impl WireFormat for Attribute {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.attrid.serialize(out);
        self.value.serialize(out);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (attrid, data) = u16::deserialize(data)?;
        let (value, data) = ZclValue::deserialize(data)?;
        Ok((Self { attrid, value }, data))
    }
}

/// Write-Attributes (plain, undivided and no-response variants share this body)
#[derive(Debug, Clone, PartialEq)]
pub struct WriteAttributes {
    pub attributes: Vec<Attribute>,
}

impl WireFormat for WriteAttributes {
    fn serialize(&self, out: &mut Vec<u8>) {
        for attribute in &self.attributes {
            attribute.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        Ok((
            Self {
                attributes: read_remaining(data)?,
            },
            &[],
        ))
    }
}

/// One failure record of a Write-Attributes response; the attribute id is
/// omitted in the all-success short form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAttributeStatusRecord {
    pub status: Status,
    pub attrid: Option<u16>,
}

/// Write-Attributes response. An all-success response collapses to a single
/// SUCCESS record without attribute ids; failures are listed individually.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAttributesResponse {
    pub records: Vec<WriteAttributeStatusRecord>,
}

impl WriteAttributesResponse {
    #[must_use]
    pub fn success() -> Self {
        Self {
            records: vec![WriteAttributeStatusRecord {
                status: Status::Success,
                attrid: None,
            }],
        }
    }
}

impl WireFormat for WriteAttributesResponse {
    fn serialize(&self, out: &mut Vec<u8>) {
        let failed: Vec<&WriteAttributeStatusRecord> = self
            .records
            .iter()
            .filter(|r| r.status != Status::Success)
            .collect();

        if failed.is_empty() {
            Status::Success.serialize(out);
            return;
        }

        for record in failed {
            record.status.serialize(out);
            if let Some(attrid) = record.attrid {
                attrid.serialize(out);
            }
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (status, mut data) = Status::deserialize(data)?;
        if status == Status::Success {
            return Ok((Self::success(), data));
        }

        let mut records = Vec::new();
        let (attrid, rest) = u16::deserialize(data)?;
        records.push(WriteAttributeStatusRecord {
            status,
            attrid: Some(attrid),
        });
        data = rest;

        while data.len() >= 3 {
            let (status, rest) = Status::deserialize(data)?;
            let (attrid, rest) = u16::deserialize(rest)?;
            records.push(WriteAttributeStatusRecord {
                status,
                attrid: Some(attrid),
            });
            data = rest;
        }

        Ok((Self { records }, data))
    }
}

/// Reporting direction discriminant in reporting configuration records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReportingDirection {
    SendReports = 0x00,
    ReceiveReports = 0x01,
}

/// One attribute reporting configuration record.
///
/// The `SendReports` form describes reports the sender will emit and carries
/// a `reportable_change` only for analog data types; the `ReceiveReports`
/// form only carries a timeout.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportingConfig {
    SendReports {
        attrid: u16,
        datatype: TypeCode,
        min_interval: u16,
        max_interval: u16,
        reportable_change: Option<ZclValue>,
    },
    ReceiveReports {
        attrid: u16,
        timeout: u16,
    },
}

impl ReportingConfig {
    #[must_use]
    pub fn attrid(&self) -> u16 {
        match self {
            Self::SendReports { attrid, .. } | Self::ReceiveReports { attrid, .. } => *attrid,
        }
    }

    #[must_use]
    pub fn direction(&self) -> ReportingDirection {
        match self {
            Self::SendReports { .. } => ReportingDirection::SendReports,
            Self::ReceiveReports { .. } => ReportingDirection::ReceiveReports,
        }
    }
}

impl WireFormat for ReportingConfig {
    fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            Self::SendReports {
                attrid,
                datatype,
                min_interval,
                max_interval,
                reportable_change,
            } => {
                out.push(ReportingDirection::SendReports as u8);
                attrid.serialize(out);
                out.push(*datatype as u8);
                min_interval.serialize(out);
                max_interval.serialize(out);
                if datatype.is_analog() {
                    if let Some(change) = reportable_change {
                        change.serialize_payload(out);
                    }
                }
            }
            Self::ReceiveReports { attrid, timeout } => {
                out.push(ReportingDirection::ReceiveReports as u8);
                attrid.serialize(out);
                timeout.serialize(out);
            }
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (direction, data) = u8::deserialize(data)?;
        let (attrid, data) = u16::deserialize(data)?;

        if direction == ReportingDirection::ReceiveReports as u8 {
            let (timeout, data) = u16::deserialize(data)?;
            return Ok((Self::ReceiveReports { attrid, timeout }, data));
        }

        let (code, data) = u8::deserialize(data)?;
        let datatype = TypeCode::try_from(code)?;
        let (min_interval, data) = u16::deserialize(data)?;
        let (max_interval, data) = u16::deserialize(data)?;

        let (reportable_change, data) = if datatype.is_analog() {
            let (value, rest) = ZclValue::deserialize_as(datatype, data)?;
            (Some(value), rest)
        } else {
            (None, data)
        };

        Ok((
            Self::SendReports {
                attrid,
                datatype,
                min_interval,
                max_interval,
                reportable_change,
            },
            data,
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureReporting {
    pub configs: Vec<ReportingConfig>,
}

impl WireFormat for ConfigureReporting {
    fn serialize(&self, out: &mut Vec<u8>) {
        for config in &self.configs {
            config.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        Ok((
            Self {
                configs: read_remaining(data)?,
            },
            &[],
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureReportingResponseRecord {
    pub status: Status,
    pub direction: ReportingDirection,
    pub attrid: u16,
}

/// Configure-Reporting response; all-success collapses to one SUCCESS byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureReportingResponse {
    pub records: Vec<ConfigureReportingResponseRecord>,
}

impl ConfigureReportingResponse {
    #[must_use]
    pub fn success() -> Self {
        Self { records: vec![] }
    }

    #[must_use]
    pub fn all_success(&self) -> bool {
        self.records.iter().all(|r| r.status == Status::Success)
    }
}

impl WireFormat for ConfigureReportingResponse {
    fn serialize(&self, out: &mut Vec<u8>) {
        let failed: Vec<&ConfigureReportingResponseRecord> = self
            .records
            .iter()
            .filter(|r| r.status != Status::Success)
            .collect();

        if failed.is_empty() {
            Status::Success.serialize(out);
            return;
        }

        for record in failed {
            record.status.serialize(out);
            out.push(record.direction as u8);
            record.attrid.serialize(out);
        }
    }

    fn deserialize(mut data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let mut records = Vec::new();

        while !data.is_empty() {
            let (status, rest) = Status::deserialize(data)?;
            if status == Status::Success && rest.is_empty() {
                // Short all-success form
                data = rest;
                break;
            }

            let (direction, rest) = u8::deserialize(rest)?;
            let direction = if direction == ReportingDirection::ReceiveReports as u8 {
                ReportingDirection::ReceiveReports
            } else {
                ReportingDirection::SendReports
            };
            let (attrid, rest) = u16::deserialize(rest)?;
            records.push(ConfigureReportingResponseRecord {
                status,
                direction,
                attrid,
            });
            data = rest;
        }

        Ok((Self { records }, data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReportingConfigRecord {
    pub direction: u8,
    pub attrid: u16,
}

impl WireFormat for ReadReportingConfigRecord {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.direction);
        self.attrid.serialize(out);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (direction, data) = u8::deserialize(data)?;
        let (attrid, data) = u16::deserialize(data)?;
        Ok((Self { direction, attrid }, data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReportingConfiguration {
    pub records: Vec<ReadReportingConfigRecord>,
}

impl WireFormat for ReadReportingConfiguration {
    fn serialize(&self, out: &mut Vec<u8>) {
        for record in &self.records {
            record.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        Ok((
            Self {
                records: read_remaining(data)?,
            },
            &[],
        ))
    }
}

/// Report-Attributes: unsolicited attribute pushes
#[derive(Debug, Clone, PartialEq)]
pub struct ReportAttributes {
    pub reports: Vec<Attribute>,
}

impl WireFormat for ReportAttributes {
    fn serialize(&self, out: &mut Vec<u8>) {
        for report in &self.reports {
            report.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        Ok((
            Self {
                reports: read_remaining(data)?,
            },
            &[],
        ))
    }
}

/// Default-Response: echoes the offending/acknowledged command id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultResponse {
    pub command_id: u8,
    pub status: Status,
}

impl WireFormat for DefaultResponse {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.command_id);
        self.status.serialize(out);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (command_id, data) = u8::deserialize(data)?;
        let (status, data) = Status::deserialize(data)?;
        Ok((Self { command_id, status }, data))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverAttributes {
    pub start_attribute_id: u16,
    pub max_attribute_ids: u8,
}

impl WireFormat for DiscoverAttributes {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.start_attribute_id.serialize(out);
        out.push(self.max_attribute_ids);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (start_attribute_id, data) = u16::deserialize(data)?;
        let (max_attribute_ids, data) = u8::deserialize(data)?;
        Ok((
            Self {
                start_attribute_id,
                max_attribute_ids,
            },
            data,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverAttributesRecord {
    pub attrid: u16,
    pub datatype: u8,
}

impl WireFormat for DiscoverAttributesRecord {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.attrid.serialize(out);
        out.push(self.datatype);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (attrid, data) = u16::deserialize(data)?;
        let (datatype, data) = u8::deserialize(data)?;
        Ok((Self { attrid, datatype }, data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverAttributesResponse {
    pub discovery_complete: bool,
    pub attributes: Vec<DiscoverAttributesRecord>,
}

impl WireFormat for DiscoverAttributesResponse {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.discovery_complete.serialize(out);
        for record in &self.attributes {
            record.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (discovery_complete, data) = bool::deserialize(data)?;
        Ok((
            Self {
                discovery_complete,
                attributes: read_remaining(data)?,
            },
            &[],
        ))
    }
}

/// Discover-Commands-Received and -Generated share one request shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverCommands {
    pub start_command_id: u8,
    pub max_command_ids: u8,
}

impl WireFormat for DiscoverCommands {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.start_command_id);
        out.push(self.max_command_ids);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (start_command_id, data) = u8::deserialize(data)?;
        let (max_command_ids, data) = u8::deserialize(data)?;
        Ok((
            Self {
                start_command_id,
                max_command_ids,
            },
            data,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverCommandsResponse {
    pub discovery_complete: bool,
    pub command_ids: Vec<u8>,
}

impl WireFormat for DiscoverCommandsResponse {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.discovery_complete.serialize(out);
        out.extend_from_slice(&self.command_ids);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (discovery_complete, data) = bool::deserialize(data)?;
        Ok((
            Self {
                discovery_complete,
                command_ids: data.to_vec(),
            },
            &[],
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverAttributesExtendedRecord {
    pub attrid: u16,
    pub datatype: u8,
    pub acl: u8,
}

impl WireFormat for DiscoverAttributesExtendedRecord {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.attrid.serialize(out);
        out.push(self.datatype);
        out.push(self.acl);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (attrid, data) = u16::deserialize(data)?;
        let (datatype, data) = u8::deserialize(data)?;
        let (acl, data) = u8::deserialize(data)?;
        Ok((
            Self {
                attrid,
                datatype,
                acl,
            },
            data,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverAttributesExtendedResponse {
    pub discovery_complete: bool,
    pub attributes: Vec<DiscoverAttributesExtendedRecord>,
}

impl WireFormat for DiscoverAttributesExtendedResponse {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.discovery_complete.serialize(out);
        for record in &self.attributes {
            record.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (discovery_complete, data) = bool::deserialize(data)?;
        Ok((
            Self {
                discovery_complete,
                attributes: read_remaining(data)?,
            },
            &[],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_control_bits() {
        let fc = FrameControl {
            frame_type: FrameType::ClusterSpecific,
            manufacturer_specific: true,
            direction: Direction::ServerToClient,
            disable_default_response: true,
        };
        assert_eq!(fc.to_byte(), 0b0001_1101);
        assert_eq!(FrameControl::from_byte(0b0001_1101).unwrap(), fc);

        assert!(FrameControl::from_byte(0b0000_0010).is_err());
    }

    #[test]
    fn test_header_roundtrip() {
        let hdr = ZclHeader::general(0x42, GeneralCommandId::ReadAttributes, Direction::ClientToServer);
        let bytes = hdr.to_bytes();
        assert_eq!(bytes, vec![0x00, 0x42, 0x00]);
        let (decoded, rest) = ZclHeader::deserialize(&bytes).unwrap();
        assert_eq!(decoded, hdr);
        assert!(rest.is_empty());

        let ms = ZclHeader::cluster(7, 0x01, Direction::ClientToServer).with_manufacturer(0x117C);
        let bytes = ms.to_bytes();
        assert_eq!(bytes, vec![0x05, 0x7C, 0x11, 0x07, 0x01]);
        let (decoded, _) = ZclHeader::deserialize(&bytes).unwrap();
        assert_eq!(decoded.manufacturer, Some(0x117C));
    }

    #[test]
    fn test_read_attributes_roundtrip() {
        let req = ReadAttributes {
            attribute_ids: vec![0x0004, 0x0005],
        };
        let (decoded, _) = ReadAttributes::deserialize(&req.to_bytes()).unwrap();
        assert_eq!(decoded, req);

        let rsp = ReadAttributesResponse {
            records: vec![
                ReadAttributeRecord {
                    attrid: 0x0004,
                    status: Status::Success,
                    value: Some(ZclValue::CharString("IKEA of Sweden".into())),
                },
                ReadAttributeRecord {
                    attrid: 0x0099,
                    status: Status::UnsupportedAttribute,
                    value: None,
                },
            ],
        };
        let (decoded, _) = ReadAttributesResponse::deserialize(&rsp.to_bytes()).unwrap();
        assert_eq!(decoded, rsp);
    }

    #[test]
    fn test_write_attributes_response_short_form() {
        let ok = WriteAttributesResponse::success();
        assert_eq!(ok.to_bytes(), vec![0x00]);
        let (decoded, _) = WriteAttributesResponse::deserialize(&[0x00]).unwrap();
        assert_eq!(decoded, ok);

        let failed = WriteAttributesResponse {
            records: vec![WriteAttributeStatusRecord {
                status: Status::ReadOnly,
                attrid: Some(0x0003),
            }],
        };
        let bytes = failed.to_bytes();
        assert_eq!(bytes, vec![0x88, 0x03, 0x00]);
        let (decoded, _) = WriteAttributesResponse::deserialize(&bytes).unwrap();
        assert_eq!(decoded, failed);
    }

    #[test]
    fn test_reporting_config_analog_vs_discrete() {
        let analog = ReportingConfig::SendReports {
            attrid: 0x0000,
            datatype: TypeCode::Int16,
            min_interval: 30,
            max_interval: 900,
            reportable_change: Some(ZclValue::Int16(10)),
        };
        let analog_bytes = analog.to_bytes();
        let (decoded, rest) = ReportingConfig::deserialize(&analog_bytes).unwrap();
        assert_eq!(decoded, analog);
        assert!(rest.is_empty());

        let discrete = ReportingConfig::SendReports {
            attrid: 0x0000,
            datatype: TypeCode::Bool,
            min_interval: 0,
            max_interval: 300,
            reportable_change: None,
        };
        let (decoded, _) = ReportingConfig::deserialize(&discrete.to_bytes()).unwrap();
        assert_eq!(decoded, discrete);

        let receive = ReportingConfig::ReceiveReports {
            attrid: 0x0021,
            timeout: 7200,
        };
        let (decoded, _) = ReportingConfig::deserialize(&receive.to_bytes()).unwrap();
        assert_eq!(decoded, receive);
    }

    #[test]
    fn test_default_response_roundtrip() {
        let rsp = DefaultResponse {
            command_id: 0x02,
            status: Status::Success,
        };
        assert_eq!(rsp.to_bytes(), vec![0x02, 0x00]);
        let (decoded, _) = DefaultResponse::deserialize(&rsp.to_bytes()).unwrap();
        assert_eq!(decoded, rsp);
    }

    #[test]
    fn test_report_attributes_roundtrip() {
        let report = ReportAttributes {
            reports: vec![Attribute {
                attrid: 0x0000,
                value: ZclValue::Bool(true),
            }],
        };
        let (decoded, _) = ReportAttributes::deserialize(&report.to_bytes()).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn test_discover_commands_roundtrip() {
        let rsp = DiscoverCommandsResponse {
            discovery_complete: true,
            command_ids: vec![0x00, 0x01, 0x02],
        };
        let (decoded, _) = DiscoverCommandsResponse::deserialize(&rsp.to_bytes()).unwrap();
        assert_eq!(decoded, rsp);
    }
}
