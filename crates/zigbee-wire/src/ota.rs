//! Zigbee OTA upgrade file format
//!
//! File layout:
//! ```text
//! [Header: 56+ bytes, starts with magic 0x0BEEF11E]
//! [Sub-element: tag(2) + length(4) + data]*
//! ```
//! The header's `image_size` covers the header itself plus all sub-elements.

use crate::error::WireError;
use crate::types::{Eui64, WireFormat};
use bitflags::bitflags;

/// Upgrade file identifier, first four bytes of every OTA image
pub const UPGRADE_FILE_ID: u32 = 0x0BEE_F11E;

/// IKEA wraps plain OTA images in an `NGIS` container
const IKEA_CONTAINER_MAGIC: &[u8] = b"NGIS";

bitflags! {
    /// Optional-field mask in the OTA header
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldControl: u16 {
        const SECURITY_CREDENTIAL_VERSION_PRESENT = 0b001;
        const DEVICE_SPECIFIC_FILE_PRESENT = 0b010;
        const HARDWARE_VERSIONS_PRESENT = 0b100;
    }
}

/// Hardware version: major version in the high byte, revision in the low
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HwVersion(pub u16);

impl HwVersion {
    #[must_use]
    pub fn version(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[must_use]
    pub fn revision(self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

/// Sub-element tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ElementTag {
    UpgradeImage = 0x0000,
    EcdsaSignature = 0x0001,
    EcdsaCertificate = 0x0002,
    ImageIntegrityCode = 0x0003,
    PictureData = 0x0004,
    Unknown(u16),
}

impl From<u16> for ElementTag {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => Self::UpgradeImage,
            0x0001 => Self::EcdsaSignature,
            0x0002 => Self::EcdsaCertificate,
            0x0003 => Self::ImageIntegrityCode,
            0x0004 => Self::PictureData,
            other => Self::Unknown(other),
        }
    }
}

impl ElementTag {
    #[must_use]
    pub fn to_u16(self) -> u16 {
        match self {
            Self::UpgradeImage => 0x0000,
            Self::EcdsaSignature => 0x0001,
            Self::EcdsaCertificate => 0x0002,
            Self::ImageIntegrityCode => 0x0003,
            Self::PictureData => 0x0004,
            Self::Unknown(other) => other,
        }
    }
}

/// OTA file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaImageHeader {
    pub header_version: u16,
    pub header_length: u16,
    pub field_control: FieldControl,
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub stack_version: u16,
    /// 32 bytes, NUL padded
    pub header_string: [u8; 32],
    pub image_size: u32,
    pub security_credential_version: Option<u8>,
    pub upgrade_file_destination: Option<Eui64>,
    pub minimum_hardware_version: Option<HwVersion>,
    pub maximum_hardware_version: Option<HwVersion>,
}

impl OtaImageHeader {
    /// Build a header string field from text, NUL padded or truncated
    #[must_use]
    pub fn header_string_from(text: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        let bytes = text.as_bytes();
        let n = bytes.len().min(32);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }

    /// Whether this image matches the given hardware version constraints
    #[must_use]
    pub fn matches_hardware(&self, hw_version: Option<u16>) -> bool {
        match (hw_version, self.minimum_hardware_version, self.maximum_hardware_version) {
            (Some(hw), Some(min), Some(max)) => (min.0..=max.0).contains(&hw),
            _ => true,
        }
    }
}

impl WireFormat for OtaImageHeader {
    fn serialize(&self, out: &mut Vec<u8>) {
        UPGRADE_FILE_ID.serialize(out);
        self.header_version.serialize(out);
        self.header_length.serialize(out);
        self.field_control.bits().serialize(out);
        self.manufacturer_code.serialize(out);
        self.image_type.serialize(out);
        self.file_version.serialize(out);
        self.stack_version.serialize(out);
        out.extend_from_slice(&self.header_string);
        self.image_size.serialize(out);

        if let Some(version) = self.security_credential_version {
            out.push(version);
        }
        if let Some(destination) = self.upgrade_file_destination {
            destination.serialize(out);
        }
        if let Some(min) = self.minimum_hardware_version {
            min.0.serialize(out);
        }
        if let Some(max) = self.maximum_hardware_version {
            max.0.serialize(out);
        }
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (magic, data) = u32::deserialize(data)?;
        if magic != UPGRADE_FILE_ID {
            return Err(WireError::InvalidFrame(format!(
                "Wrong OTA file identifier: {magic:#010X}"
            )));
        }

        let (header_version, data) = u16::deserialize(data)?;
        let (header_length, data) = u16::deserialize(data)?;
        let (control_bits, data) = u16::deserialize(data)?;
        let field_control = FieldControl::from_bits_retain(control_bits);
        let (manufacturer_code, data) = u16::deserialize(data)?;
        let (image_type, data) = u16::deserialize(data)?;
        let (file_version, data) = u32::deserialize(data)?;
        let (stack_version, data) = u16::deserialize(data)?;

        WireError::check_len(data, 32)?;
        let mut header_string = [0u8; 32];
        header_string.copy_from_slice(&data[..32]);
        let data = &data[32..];

        let (image_size, mut data) = u32::deserialize(data)?;

        let mut security_credential_version = None;
        if field_control.contains(FieldControl::SECURITY_CREDENTIAL_VERSION_PRESENT) {
            let (version, rest) = u8::deserialize(data)?;
            security_credential_version = Some(version);
            data = rest;
        }

        let mut upgrade_file_destination = None;
        if field_control.contains(FieldControl::DEVICE_SPECIFIC_FILE_PRESENT) {
            let (destination, rest) = Eui64::deserialize(data)?;
            upgrade_file_destination = Some(destination);
            data = rest;
        }

        let mut minimum_hardware_version = None;
        let mut maximum_hardware_version = None;
        if field_control.contains(FieldControl::HARDWARE_VERSIONS_PRESENT) {
            let (min, rest) = u16::deserialize(data)?;
            let (max, rest) = u16::deserialize(rest)?;
            minimum_hardware_version = Some(HwVersion(min));
            maximum_hardware_version = Some(HwVersion(max));
            data = rest;
        }

        Ok((
            Self {
                header_version,
                header_length,
                field_control,
                manufacturer_code,
                image_type,
                file_version,
                stack_version,
                header_string,
                image_size,
                security_credential_version,
                upgrade_file_destination,
                minimum_hardware_version,
                maximum_hardware_version,
            },
            data,
        ))
    }
}

/// One tagged sub-element of the image body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubElement {
    pub tag: ElementTag,
    pub data: Vec<u8>,
}

impl WireFormat for SubElement {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.tag.to_u16().serialize(out);
        (self.data.len() as u32).serialize(out);
        out.extend_from_slice(&self.data);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (tag, data) = u16::deserialize(data)?;
        let (length, data) = u32::deserialize(data)?;
        let length = length as usize;
        WireError::check_len(data, length)?;
        Ok((
            Self {
                tag: ElementTag::from(tag),
                data: data[..length].to_vec(),
            },
            &data[length..],
        ))
    }
}

/// A parsed OTA upgrade file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaImage {
    pub header: OtaImageHeader,
    pub subelements: Vec<SubElement>,
}

impl OtaImage {
    /// Parse an image, unwrapping known vendor containers first
    pub fn parse(data: &[u8]) -> Result<OtaImage, WireError> {
        if data.starts_with(IKEA_CONTAINER_MAGIC) {
            // NGIS container: offset at 16..20, size at 20..24
            WireError::check_len(data, 24)?;
            let offset = u32::from_le_bytes([data[16], data[17], data[18], data[19]]) as usize;
            let size = u32::from_le_bytes([data[20], data[21], data[22], data[23]]) as usize;
            if data.len() < offset + size {
                return Err(WireError::BufferTooShort {
                    needed: offset + size,
                    available: data.len(),
                });
            }
            return Self::parse_plain(&data[offset..offset + size]);
        }

        Self::parse_plain(data)
    }

    fn parse_plain(data: &[u8]) -> Result<OtaImage, WireError> {
        let (header, rest) = OtaImageHeader::deserialize(data)?;

        let header_size = data.len() - rest.len();
        let elements_len = (header.image_size as usize)
            .checked_sub(header_size)
            .ok_or_else(|| {
                WireError::InvalidFrame("OTA image size smaller than header".to_string())
            })?;
        WireError::check_len(rest, elements_len)?;

        let mut element_data = &rest[..elements_len];
        let mut subelements = Vec::new();
        while !element_data.is_empty() {
            let (element, rest) = SubElement::deserialize(element_data)?;
            subelements.push(element);
            element_data = rest;
        }

        Ok(OtaImage {
            header,
            subelements,
        })
    }

    /// Serialize, re-validating the header's size field
    pub fn to_wire(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        self.header.serialize(&mut out);
        for element in &self.subelements {
            element.serialize(&mut out);
        }

        if out.len() != self.header.image_size as usize {
            return Err(WireError::InvalidFrame(format!(
                "OTA header image_size {} does not match serialized size {}",
                self.header.image_size,
                out.len()
            )));
        }
        Ok(out)
    }

    /// The firmware payload (tag 0x0000), if present
    #[must_use]
    pub fn upgrade_image(&self) -> Option<&[u8]> {
        self.subelements
            .iter()
            .find(|e| e.tag == ElementTag::UpgradeImage)
            .map(|e| e.data.as_slice())
    }
}
