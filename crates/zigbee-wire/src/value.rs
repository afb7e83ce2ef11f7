//! The tagged ZCL attribute value
//!
//! ZCL attribute values travel as a one-byte type code followed by a payload
//! whose shape depends entirely on that byte. [`ZclValue`] is the decoded
//! form; [`TypeCode`] is the discriminant.

use crate::error::WireError;
use crate::types::{
    CalendarDate, CharString, Eui64, Half, KeyData, LongCharString, LongOctetString, OctetString,
    TimeOfDay, UtcTime, WireFormat, I24, I40, I48, I56, U24, U40, U48, U56,
};

/// ZCL data type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeCode {
    NoData = 0x00,
    Data8 = 0x08,
    Data16 = 0x09,
    Data24 = 0x0A,
    Data32 = 0x0B,
    Data40 = 0x0C,
    Data48 = 0x0D,
    Data56 = 0x0E,
    Data64 = 0x0F,
    Bool = 0x10,
    Bitmap8 = 0x18,
    Bitmap16 = 0x19,
    Bitmap24 = 0x1A,
    Bitmap32 = 0x1B,
    Bitmap40 = 0x1C,
    Bitmap48 = 0x1D,
    Bitmap56 = 0x1E,
    Bitmap64 = 0x1F,
    Uint8 = 0x20,
    Uint16 = 0x21,
    Uint24 = 0x22,
    Uint32 = 0x23,
    Uint40 = 0x24,
    Uint48 = 0x25,
    Uint56 = 0x26,
    Uint64 = 0x27,
    Int8 = 0x28,
    Int16 = 0x29,
    Int24 = 0x2A,
    Int32 = 0x2B,
    Int40 = 0x2C,
    Int48 = 0x2D,
    Int56 = 0x2E,
    Int64 = 0x2F,
    Enum8 = 0x30,
    Enum16 = 0x31,
    Half = 0x38,
    Single = 0x39,
    Double = 0x3A,
    OctetString = 0x41,
    CharString = 0x42,
    LongOctetString = 0x43,
    LongCharString = 0x44,
    Array = 0x48,
    Structure = 0x4C,
    Set = 0x50,
    Bag = 0x51,
    TimeOfDay = 0xE0,
    Date = 0xE1,
    UtcTime = 0xE2,
    ClusterId = 0xE8,
    AttributeId = 0xE9,
    BacnetOid = 0xEA,
    Ieee = 0xF0,
    SecurityKey = 0xF1,
    Unknown = 0xFF,
}

impl TryFrom<u8> for TypeCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::NoData,
            0x08 => Self::Data8,
            0x09 => Self::Data16,
            0x0A => Self::Data24,
            0x0B => Self::Data32,
            0x0C => Self::Data40,
            0x0D => Self::Data48,
            0x0E => Self::Data56,
            0x0F => Self::Data64,
            0x10 => Self::Bool,
            0x18 => Self::Bitmap8,
            0x19 => Self::Bitmap16,
            0x1A => Self::Bitmap24,
            0x1B => Self::Bitmap32,
            0x1C => Self::Bitmap40,
            0x1D => Self::Bitmap48,
            0x1E => Self::Bitmap56,
            0x1F => Self::Bitmap64,
            0x20 => Self::Uint8,
            0x21 => Self::Uint16,
            0x22 => Self::Uint24,
            0x23 => Self::Uint32,
            0x24 => Self::Uint40,
            0x25 => Self::Uint48,
            0x26 => Self::Uint56,
            0x27 => Self::Uint64,
            0x28 => Self::Int8,
            0x29 => Self::Int16,
            0x2A => Self::Int24,
            0x2B => Self::Int32,
            0x2C => Self::Int40,
            0x2D => Self::Int48,
            0x2E => Self::Int56,
            0x2F => Self::Int64,
            0x30 => Self::Enum8,
            0x31 => Self::Enum16,
            0x38 => Self::Half,
            0x39 => Self::Single,
            0x3A => Self::Double,
            0x41 => Self::OctetString,
            0x42 => Self::CharString,
            0x43 => Self::LongOctetString,
            0x44 => Self::LongCharString,
            0x48 => Self::Array,
            0x4C => Self::Structure,
            0x50 => Self::Set,
            0x51 => Self::Bag,
            0xE0 => Self::TimeOfDay,
            0xE1 => Self::Date,
            0xE2 => Self::UtcTime,
            0xE8 => Self::ClusterId,
            0xE9 => Self::AttributeId,
            0xEA => Self::BacnetOid,
            0xF0 => Self::Ieee,
            0xF1 => Self::SecurityKey,
            0xFF => Self::Unknown,
            other => return Err(WireError::UnknownTypeCode(other)),
        })
    }
}

impl TypeCode {
    /// Analog types carry a `reportable_change` in reporting configurations;
    /// discrete types do not.
    #[must_use]
    pub fn is_analog(self) -> bool {
        matches!(
            self,
            Self::Uint8
                | Self::Uint16
                | Self::Uint24
                | Self::Uint32
                | Self::Uint40
                | Self::Uint48
                | Self::Uint56
                | Self::Uint64
                | Self::Int8
                | Self::Int16
                | Self::Int24
                | Self::Int32
                | Self::Int40
                | Self::Int48
                | Self::Int56
                | Self::Int64
                | Self::Half
                | Self::Single
                | Self::Double
                | Self::TimeOfDay
                | Self::Date
                | Self::UtcTime
        )
    }
}

/// A decoded ZCL attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum ZclValue {
    NoData,
    Data8([u8; 1]),
    Data16([u8; 2]),
    Data24([u8; 3]),
    Data32([u8; 4]),
    Data40([u8; 5]),
    Data48([u8; 6]),
    Data56([u8; 7]),
    Data64([u8; 8]),
    Bool(bool),
    Bitmap8(u8),
    Bitmap16(u16),
    Bitmap24(U24),
    Bitmap32(u32),
    Bitmap40(U40),
    Bitmap48(U48),
    Bitmap56(U56),
    Bitmap64(u64),
    Uint8(u8),
    Uint16(u16),
    Uint24(U24),
    Uint32(u32),
    Uint40(U40),
    Uint48(U48),
    Uint56(U56),
    Uint64(u64),
    Int8(i8),
    Int16(i16),
    Int24(I24),
    Int32(i32),
    Int40(I40),
    Int48(I48),
    Int56(I56),
    Int64(i64),
    Enum8(u8),
    Enum16(u16),
    Half(Half),
    Single(f32),
    Double(f64),
    OctetString(OctetString),
    CharString(CharString),
    LongOctetString(LongOctetString),
    LongCharString(LongCharString),
    Array {
        element_type: TypeCode,
        elements: Vec<ZclValue>,
    },
    Structure(Vec<ZclValue>),
    Set {
        element_type: TypeCode,
        elements: Vec<ZclValue>,
    },
    Bag {
        element_type: TypeCode,
        elements: Vec<ZclValue>,
    },
    TimeOfDay(TimeOfDay),
    Date(CalendarDate),
    UtcTime(UtcTime),
    ClusterId(u16),
    AttributeId(u16),
    BacnetOid(u32),
    Ieee(Eui64),
    SecurityKey(KeyData),
    Unknown,
}

macro_rules! fixed_data {
    ($data:expr, $n:expr) => {{
        WireError::check_len($data, $n)?;
        let mut buf = [0u8; $n];
        buf.copy_from_slice(&$data[..$n]);
        (buf, &$data[$n..])
    }};
}

fn deserialize_collection(data: &[u8]) -> Result<((TypeCode, Vec<ZclValue>), &[u8]), WireError> {
    let (code, data) = u8::deserialize(data)?;
    let element_type = TypeCode::try_from(code)?;
    let (count, mut data) = u16::deserialize(data)?;

    let mut elements = Vec::with_capacity(usize::from(count.min(0x100)));
    for _ in 0..count {
        let (element, rest) = ZclValue::deserialize_as(element_type, data)?;
        elements.push(element);
        data = rest;
    }
    Ok(((element_type, elements), data))
}

fn serialize_collection(element_type: TypeCode, elements: &[ZclValue], out: &mut Vec<u8>) {
    out.push(element_type as u8);
    (elements.len() as u16).serialize(out);
    for element in elements {
        element.serialize_payload(out);
    }
}

impl ZclValue {
    /// The wire type code this value serializes under
    #[must_use]
    pub fn type_code(&self) -> TypeCode {
        match self {
            Self::NoData => TypeCode::NoData,
            Self::Data8(_) => TypeCode::Data8,
            Self::Data16(_) => TypeCode::Data16,
            Self::Data24(_) => TypeCode::Data24,
            Self::Data32(_) => TypeCode::Data32,
            Self::Data40(_) => TypeCode::Data40,
            Self::Data48(_) => TypeCode::Data48,
            Self::Data56(_) => TypeCode::Data56,
            Self::Data64(_) => TypeCode::Data64,
            Self::Bool(_) => TypeCode::Bool,
            Self::Bitmap8(_) => TypeCode::Bitmap8,
            Self::Bitmap16(_) => TypeCode::Bitmap16,
            Self::Bitmap24(_) => TypeCode::Bitmap24,
            Self::Bitmap32(_) => TypeCode::Bitmap32,
            Self::Bitmap40(_) => TypeCode::Bitmap40,
            Self::Bitmap48(_) => TypeCode::Bitmap48,
            Self::Bitmap56(_) => TypeCode::Bitmap56,
            Self::Bitmap64(_) => TypeCode::Bitmap64,
            Self::Uint8(_) => TypeCode::Uint8,
            Self::Uint16(_) => TypeCode::Uint16,
            Self::Uint24(_) => TypeCode::Uint24,
            Self::Uint32(_) => TypeCode::Uint32,
            Self::Uint40(_) => TypeCode::Uint40,
            Self::Uint48(_) => TypeCode::Uint48,
            Self::Uint56(_) => TypeCode::Uint56,
            Self::Uint64(_) => TypeCode::Uint64,
            Self::Int8(_) => TypeCode::Int8,
            Self::Int16(_) => TypeCode::Int16,
            Self::Int24(_) => TypeCode::Int24,
            Self::Int32(_) => TypeCode::Int32,
            Self::Int40(_) => TypeCode::Int40,
            Self::Int48(_) => TypeCode::Int48,
            Self::Int56(_) => TypeCode::Int56,
            Self::Int64(_) => TypeCode::Int64,
            Self::Enum8(_) => TypeCode::Enum8,
            Self::Enum16(_) => TypeCode::Enum16,
            Self::Half(_) => TypeCode::Half,
            Self::Single(_) => TypeCode::Single,
            Self::Double(_) => TypeCode::Double,
            Self::OctetString(_) => TypeCode::OctetString,
            Self::CharString(_) => TypeCode::CharString,
            Self::LongOctetString(_) => TypeCode::LongOctetString,
            Self::LongCharString(_) => TypeCode::LongCharString,
            Self::Array { .. } => TypeCode::Array,
            Self::Structure(_) => TypeCode::Structure,
            Self::Set { .. } => TypeCode::Set,
            Self::Bag { .. } => TypeCode::Bag,
            Self::TimeOfDay(_) => TypeCode::TimeOfDay,
            Self::Date(_) => TypeCode::Date,
            Self::UtcTime(_) => TypeCode::UtcTime,
            Self::ClusterId(_) => TypeCode::ClusterId,
            Self::AttributeId(_) => TypeCode::AttributeId,
            Self::BacnetOid(_) => TypeCode::BacnetOid,
            Self::Ieee(_) => TypeCode::Ieee,
            Self::SecurityKey(_) => TypeCode::SecurityKey,
            Self::Unknown => TypeCode::Unknown,
        }
    }

    /// Serialize the payload only, without the leading type code
    pub fn serialize_payload(&self, out: &mut Vec<u8>) {
        match self {
            Self::NoData | Self::Unknown => {}
            Self::Data8(b) => out.extend_from_slice(b),
            Self::Data16(b) => out.extend_from_slice(b),
            Self::Data24(b) => out.extend_from_slice(b),
            Self::Data32(b) => out.extend_from_slice(b),
            Self::Data40(b) => out.extend_from_slice(b),
            Self::Data48(b) => out.extend_from_slice(b),
            Self::Data56(b) => out.extend_from_slice(b),
            Self::Data64(b) => out.extend_from_slice(b),
            Self::Bool(v) => v.serialize(out),
            Self::Bitmap8(v) | Self::Uint8(v) | Self::Enum8(v) => v.serialize(out),
            Self::Bitmap16(v) | Self::Uint16(v) | Self::Enum16(v) => v.serialize(out),
            Self::Bitmap24(v) | Self::Uint24(v) => v.serialize(out),
            Self::Bitmap32(v) | Self::Uint32(v) => v.serialize(out),
            Self::Bitmap40(v) | Self::Uint40(v) => v.serialize(out),
            Self::Bitmap48(v) | Self::Uint48(v) => v.serialize(out),
            Self::Bitmap56(v) | Self::Uint56(v) => v.serialize(out),
            Self::Bitmap64(v) | Self::Uint64(v) => v.serialize(out),
            Self::Int8(v) => v.serialize(out),
            Self::Int16(v) => v.serialize(out),
            Self::Int24(v) => v.serialize(out),
            Self::Int32(v) => v.serialize(out),
            Self::Int40(v) => v.serialize(out),
            Self::Int48(v) => v.serialize(out),
            Self::Int56(v) => v.serialize(out),
            Self::Int64(v) => v.serialize(out),
            Self::Half(v) => v.serialize(out),
            Self::Single(v) => v.serialize(out),
            Self::Double(v) => v.serialize(out),
            Self::OctetString(v) => v.serialize(out),
            Self::CharString(v) => v.serialize(out),
            Self::LongOctetString(v) => v.serialize(out),
            Self::LongCharString(v) => v.serialize(out),
            Self::Array {
                element_type,
                elements,
            }
            | Self::Set {
                element_type,
                elements,
            }
            | Self::Bag {
                element_type,
                elements,
            } => serialize_collection(*element_type, elements, out),
            Self::Structure(members) => {
                (members.len() as u16).serialize(out);
                for member in members {
                    member.serialize(out);
                }
            }
            Self::TimeOfDay(v) => v.serialize(out),
            Self::Date(v) => v.serialize(out),
            Self::UtcTime(v) => v.serialize(out),
            Self::ClusterId(v) | Self::AttributeId(v) => v.serialize(out),
            Self::BacnetOid(v) => v.serialize(out),
            Self::Ieee(v) => v.serialize(out),
            Self::SecurityKey(v) => v.serialize(out),
        }
    }

    /// Decode a payload of the given type
    pub fn deserialize_as(code: TypeCode, data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        Ok(match code {
            TypeCode::NoData => (Self::NoData, data),
            TypeCode::Unknown => (Self::Unknown, data),
            TypeCode::Data8 => {
                let (buf, rest) = fixed_data!(data, 1);
                (Self::Data8(buf), rest)
            }
            TypeCode::Data16 => {
                let (buf, rest) = fixed_data!(data, 2);
                (Self::Data16(buf), rest)
            }
            TypeCode::Data24 => {
                let (buf, rest) = fixed_data!(data, 3);
                (Self::Data24(buf), rest)
            }
            TypeCode::Data32 => {
                let (buf, rest) = fixed_data!(data, 4);
                (Self::Data32(buf), rest)
            }
            TypeCode::Data40 => {
                let (buf, rest) = fixed_data!(data, 5);
                (Self::Data40(buf), rest)
            }
            TypeCode::Data48 => {
                let (buf, rest) = fixed_data!(data, 6);
                (Self::Data48(buf), rest)
            }
            TypeCode::Data56 => {
                let (buf, rest) = fixed_data!(data, 7);
                (Self::Data56(buf), rest)
            }
            TypeCode::Data64 => {
                let (buf, rest) = fixed_data!(data, 8);
                (Self::Data64(buf), rest)
            }
            TypeCode::Bool => {
                let (v, rest) = bool::deserialize(data)?;
                (Self::Bool(v), rest)
            }
            TypeCode::Bitmap8 => {
                let (v, rest) = u8::deserialize(data)?;
                (Self::Bitmap8(v), rest)
            }
            TypeCode::Bitmap16 => {
                let (v, rest) = u16::deserialize(data)?;
                (Self::Bitmap16(v), rest)
            }
            TypeCode::Bitmap24 => {
                let (v, rest) = U24::deserialize(data)?;
                (Self::Bitmap24(v), rest)
            }
            TypeCode::Bitmap32 => {
                let (v, rest) = u32::deserialize(data)?;
                (Self::Bitmap32(v), rest)
            }
            TypeCode::Bitmap40 => {
                let (v, rest) = U40::deserialize(data)?;
                (Self::Bitmap40(v), rest)
            }
            TypeCode::Bitmap48 => {
                let (v, rest) = U48::deserialize(data)?;
                (Self::Bitmap48(v), rest)
            }
            TypeCode::Bitmap56 => {
                let (v, rest) = U56::deserialize(data)?;
                (Self::Bitmap56(v), rest)
            }
            TypeCode::Bitmap64 => {
                let (v, rest) = u64::deserialize(data)?;
                (Self::Bitmap64(v), rest)
            }
            TypeCode::Uint8 => {
                let (v, rest) = u8::deserialize(data)?;
                (Self::Uint8(v), rest)
            }
            TypeCode::Uint16 => {
                let (v, rest) = u16::deserialize(data)?;
                (Self::Uint16(v), rest)
            }
            TypeCode::Uint24 => {
                let (v, rest) = U24::deserialize(data)?;
                (Self::Uint24(v), rest)
            }
            TypeCode::Uint32 => {
                let (v, rest) = u32::deserialize(data)?;
                (Self::Uint32(v), rest)
            }
            TypeCode::Uint40 => {
                let (v, rest) = U40::deserialize(data)?;
                (Self::Uint40(v), rest)
            }
            TypeCode::Uint48 => {
                let (v, rest) = U48::deserialize(data)?;
                (Self::Uint48(v), rest)
            }
            TypeCode::Uint56 => {
                let (v, rest) = U56::deserialize(data)?;
                (Self::Uint56(v), rest)
            }
            TypeCode::Uint64 => {
                let (v, rest) = u64::deserialize(data)?;
                (Self::Uint64(v), rest)
            }
            TypeCode::Int8 => {
                let (v, rest) = i8::deserialize(data)?;
                (Self::Int8(v), rest)
            }
            TypeCode::Int16 => {
                let (v, rest) = i16::deserialize(data)?;
                (Self::Int16(v), rest)
            }
            TypeCode::Int24 => {
                let (v, rest) = I24::deserialize(data)?;
                (Self::Int24(v), rest)
            }
            TypeCode::Int32 => {
                let (v, rest) = i32::deserialize(data)?;
                (Self::Int32(v), rest)
            }
            TypeCode::Int40 => {
                let (v, rest) = I40::deserialize(data)?;
                (Self::Int40(v), rest)
            }
            TypeCode::Int48 => {
                let (v, rest) = I48::deserialize(data)?;
                (Self::Int48(v), rest)
            }
            TypeCode::Int56 => {
                let (v, rest) = I56::deserialize(data)?;
                (Self::Int56(v), rest)
            }
            TypeCode::Int64 => {
                let (v, rest) = i64::deserialize(data)?;
                (Self::Int64(v), rest)
            }
            TypeCode::Enum8 => {
                let (v, rest) = u8::deserialize(data)?;
                (Self::Enum8(v), rest)
            }
            TypeCode::Enum16 => {
                let (v, rest) = u16::deserialize(data)?;
                (Self::Enum16(v), rest)
            }
            TypeCode::Half => {
                let (v, rest) = Half::deserialize(data)?;
                (Self::Half(v), rest)
            }
            TypeCode::Single => {
                let (v, rest) = f32::deserialize(data)?;
                (Self::Single(v), rest)
            }
            TypeCode::Double => {
                let (v, rest) = f64::deserialize(data)?;
                (Self::Double(v), rest)
            }
            TypeCode::OctetString => {
                let (v, rest) = OctetString::deserialize(data)?;
                (Self::OctetString(v), rest)
            }
            TypeCode::CharString => {
                let (v, rest) = CharString::deserialize(data)?;
                (Self::CharString(v), rest)
            }
            TypeCode::LongOctetString => {
                let (v, rest) = LongOctetString::deserialize(data)?;
                (Self::LongOctetString(v), rest)
            }
            TypeCode::LongCharString => {
                let (v, rest) = LongCharString::deserialize(data)?;
                (Self::LongCharString(v), rest)
            }
            TypeCode::Array => {
                let ((element_type, elements), rest) = deserialize_collection(data)?;
                (
                    Self::Array {
                        element_type,
                        elements,
                    },
                    rest,
                )
            }
            TypeCode::Set => {
                let ((element_type, elements), rest) = deserialize_collection(data)?;
                (
                    Self::Set {
                        element_type,
                        elements,
                    },
                    rest,
                )
            }
            TypeCode::Bag => {
                let ((element_type, elements), rest) = deserialize_collection(data)?;
                (
                    Self::Bag {
                        element_type,
                        elements,
                    },
                    rest,
                )
            }
            TypeCode::Structure => {
                let (count, mut data) = u16::deserialize(data)?;
                let mut members = Vec::with_capacity(usize::from(count.min(0x100)));
                for _ in 0..count {
                    let (member, rest) = ZclValue::deserialize(data)?;
                    members.push(member);
                    data = rest;
                }
                (Self::Structure(members), data)
            }
            TypeCode::TimeOfDay => {
                let (v, rest) = TimeOfDay::deserialize(data)?;
                (Self::TimeOfDay(v), rest)
            }
            TypeCode::Date => {
                let (v, rest) = CalendarDate::deserialize(data)?;
                (Self::Date(v), rest)
            }
            TypeCode::UtcTime => {
                let (v, rest) = UtcTime::deserialize(data)?;
                (Self::UtcTime(v), rest)
            }
            TypeCode::ClusterId => {
                let (v, rest) = u16::deserialize(data)?;
                (Self::ClusterId(v), rest)
            }
            TypeCode::AttributeId => {
                let (v, rest) = u16::deserialize(data)?;
                (Self::AttributeId(v), rest)
            }
            TypeCode::BacnetOid => {
                let (v, rest) = u32::deserialize(data)?;
                (Self::BacnetOid(v), rest)
            }
            TypeCode::Ieee => {
                let (v, rest) = Eui64::deserialize(data)?;
                (Self::Ieee(v), rest)
            }
            TypeCode::SecurityKey => {
                let (v, rest) = KeyData::deserialize(data)?;
                (Self::SecurityKey(v), rest)
            }
        })
    }

    /// The decoded string for character-string values, if valid
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::CharString(CharString(Some(s)))
            | Self::LongCharString(LongCharString(Some(s))) => Some(s),
            _ => None,
        }
    }
}

impl WireFormat for ZclValue {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.type_code() as u8);
        self.serialize_payload(out);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (code, data) = u8::deserialize(data)?;
        Self::deserialize_as(TypeCode::try_from(code)?, data)
    }
}
