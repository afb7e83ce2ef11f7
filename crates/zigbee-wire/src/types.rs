//! Zigbee wire primitives
//!
//! Everything on the wire is little-endian. Decoders take a byte slice and
//! return the decoded value together with the remaining bytes, so compound
//! parsers can be chained without cursor bookkeeping.

use crate::error::WireError;
use std::fmt;
use std::str::FromStr;

/// Serialization contract for every wire type
pub trait WireFormat: Sized {
    /// Append the wire representation to `out`
    fn serialize(&self, out: &mut Vec<u8>);

    /// Decode a value from the front of `data`, returning the rest
    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError>;

    /// Convenience wrapper producing a fresh buffer
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize(&mut out);
        out
    }
}

macro_rules! wire_primitive_int {
    ($($ty:ty),* $(,)?) => {$(
        impl WireFormat for $ty {
            fn serialize(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
                const SIZE: usize = std::mem::size_of::<$ty>();
                WireError::check_len(data, SIZE)?;
                let mut buf = [0u8; SIZE];
                buf.copy_from_slice(&data[..SIZE]);
                Ok((<$ty>::from_le_bytes(buf), &data[SIZE..]))
            }
        }
    )*};
}

wire_primitive_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl WireFormat for bool {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (byte, rest) = u8::deserialize(data)?;
        Ok((byte != 0, rest))
    }
}

impl WireFormat for f32 {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        WireError::check_len(data, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&data[..4]);
        Ok((f32::from_le_bytes(buf), &data[4..]))
    }
}

impl WireFormat for f64 {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        WireError::check_len(data, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&data[..8]);
        Ok((f64::from_le_bytes(buf), &data[8..]))
    }
}

macro_rules! wire_odd_uint {
    ($name:ident, $inner:ty, $bytes:expr) => {
        /// Unsigned integer carried in a non-native wire width
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $inner);

        impl $name {
            pub const MAX: $inner = ((1 as $inner) << ($bytes * 8)) - 1;

            pub fn new(value: $inner) -> Result<Self, WireError> {
                if value > Self::MAX {
                    return Err(WireError::ValueOutOfRange {
                        context: stringify!($name),
                        value: value as i128,
                    });
                }
                Ok(Self(value))
            }
        }

        impl From<$name> for $inner {
            fn from(value: $name) -> $inner {
                value.0
            }
        }

        impl WireFormat for $name {
            fn serialize(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.0.to_le_bytes()[..$bytes]);
            }

            fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
                WireError::check_len(data, $bytes)?;
                let mut buf = [0u8; std::mem::size_of::<$inner>()];
                buf[..$bytes].copy_from_slice(&data[..$bytes]);
                Ok((Self(<$inner>::from_le_bytes(buf)), &data[$bytes..]))
            }
        }
    };
}

wire_odd_uint!(U24, u32, 3);
wire_odd_uint!(U40, u64, 5);
wire_odd_uint!(U48, u64, 6);
wire_odd_uint!(U56, u64, 7);

macro_rules! wire_odd_int {
    ($name:ident, $inner:ty, $unsigned:ty, $bytes:expr) => {
        /// Signed integer carried in a non-native wire width
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $inner);

        impl $name {
            pub const MIN: $inner = -((1 as $inner) << ($bytes * 8 - 1));
            pub const MAX: $inner = ((1 as $inner) << ($bytes * 8 - 1)) - 1;

            pub fn new(value: $inner) -> Result<Self, WireError> {
                if !(Self::MIN..=Self::MAX).contains(&value) {
                    return Err(WireError::ValueOutOfRange {
                        context: stringify!($name),
                        value: value as i128,
                    });
                }
                Ok(Self(value))
            }
        }

        impl From<$name> for $inner {
            fn from(value: $name) -> $inner {
                value.0
            }
        }

        impl WireFormat for $name {
            fn serialize(&self, out: &mut Vec<u8>) {
                // Two's complement truncation keeps the low bytes
                out.extend_from_slice(&self.0.to_le_bytes()[..$bytes]);
            }

            fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
                WireError::check_len(data, $bytes)?;
                let mut buf = [0u8; std::mem::size_of::<$inner>()];
                buf[..$bytes].copy_from_slice(&data[..$bytes]);
                let raw = <$unsigned>::from_le_bytes(buf);
                let shift = (std::mem::size_of::<$inner>() - $bytes) * 8;
                let value = ((raw << shift) as $inner) >> shift;
                Ok((Self(value), &data[$bytes..]))
            }
        }
    };
}

wire_odd_int!(I24, i32, u32, 3);
wire_odd_int!(I40, i64, u64, 5);
wire_odd_int!(I48, i64, u64, 6);
wire_odd_int!(I56, i64, u64, 7);

/// IEEE EUI-64 address, stored in wire (little-endian) byte order.
///
/// Displayed and parsed in the conventional reversed colon-hex form,
/// e.g. `00:0d:6f:00:0a:bc:de:f0`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    pub const UNKNOWN: Eui64 = Eui64([0xFF; 8]);

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        *self == Self::UNKNOWN
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[7], b[6], b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl FromStr for Eui64 {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 8 {
            return Err(WireError::InvalidFrame(format!("Invalid EUI-64: {s:?}")));
        }

        let mut bytes = [0u8; 8];
        for (i, part) in parts.iter().enumerate() {
            bytes[7 - i] = u8::from_str_radix(part, 16)
                .map_err(|_| WireError::InvalidFrame(format!("Invalid EUI-64: {s:?}")))?;
        }
        Ok(Self(bytes))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Eui64 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Eui64 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <String as serde::Deserialize>::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

impl WireFormat for Eui64 {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        WireError::check_len(data, 8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&data[..8]);
        Ok((Self(bytes), &data[8..]))
    }
}

/// 128-bit security key
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyData(pub [u8; 16]);

impl WireFormat for KeyData {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        WireError::check_len(data, 16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&data[..16]);
        Ok((Self(bytes), &data[16..]))
    }
}

/// UTC time: seconds since 2000-01-01 00:00:00 UTC
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcTime(pub u32);

impl WireFormat for UtcTime {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.0.serialize(out);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (secs, rest) = u32::deserialize(data)?;
        Ok((Self(secs), rest))
    }
}

/// Time of day; 0xFF in any field means "unused"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeOfDay {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub hundredths: u8,
}

impl WireFormat for TimeOfDay {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.hours, self.minutes, self.seconds, self.hundredths]);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        WireError::check_len(data, 4)?;
        Ok((
            Self {
                hours: data[0],
                minutes: data[1],
                seconds: data[2],
                hundredths: data[3],
            },
            &data[4..],
        ))
    }
}

/// Calendar date; year is offset from 1900, 0xFF in any field means "unused"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CalendarDate {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub day_of_week: u8,
}

impl WireFormat for CalendarDate {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[self.year, self.month, self.day, self.day_of_week]);
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        WireError::check_len(data, 4)?;
        Ok((
            Self {
                year: data[0],
                month: data[1],
                day: data[2],
                day_of_week: data[3],
            },
            &data[4..],
        ))
    }
}

/// Character string with a one-byte length prefix.
///
/// A length byte of 0xFF marks the string as invalid/absent, which is
/// distinct from a zero-length string; that state is `None`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct CharString(pub Option<String>);

/// Character string with a two-byte length prefix; 0xFFFF marks invalid
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct LongCharString(pub Option<String>);

/// Octet string with a one-byte length prefix; 0xFF marks invalid
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct OctetString(pub Option<Vec<u8>>);

/// Octet string with a two-byte length prefix; 0xFFFF marks invalid
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct LongOctetString(pub Option<Vec<u8>>);

fn decode_text(raw: &[u8]) -> String {
    // Embedded NUL terminates; invalid UTF-8 is replaced rather than rejected
    let raw = raw.split(|&b| b == 0).next().unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

macro_rules! wire_short_lv {
    ($name:ident, $serialize_body:expr, $decode:expr) => {
        impl WireFormat for $name {
            #[allow(clippy::missing_panics_doc)] // Panic only on protocol-violating length
            fn serialize(&self, out: &mut Vec<u8>) {
                match &self.0 {
                    None => out.push(0xFF),
                    Some(value) => {
                        let bytes: &[u8] = $serialize_body(value);
                        assert!(bytes.len() < 0xFF, "string exceeds wire maximum");
                        out.push(bytes.len() as u8);
                        out.extend_from_slice(bytes);
                    }
                }
            }

            fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
                let (len, rest) = u8::deserialize(data)?;
                if len == 0xFF {
                    return Ok((Self(None), rest));
                }
                let len = len as usize;
                WireError::check_len(rest, len)?;
                Ok((Self(Some($decode(&rest[..len]))), &rest[len..]))
            }
        }
    };
}

macro_rules! wire_long_lv {
    ($name:ident, $serialize_body:expr, $decode:expr) => {
        impl WireFormat for $name {
            #[allow(clippy::missing_panics_doc)] // Panic only on protocol-violating length
            fn serialize(&self, out: &mut Vec<u8>) {
                match &self.0 {
                    None => out.extend_from_slice(&0xFFFFu16.to_le_bytes()),
                    Some(value) => {
                        let bytes: &[u8] = $serialize_body(value);
                        assert!(bytes.len() < 0xFFFF, "string exceeds wire maximum");
                        out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                        out.extend_from_slice(bytes);
                    }
                }
            }

            fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
                let (len, rest) = u16::deserialize(data)?;
                if len == 0xFFFF {
                    return Ok((Self(None), rest));
                }
                let len = len as usize;
                WireError::check_len(rest, len)?;
                Ok((Self(Some($decode(&rest[..len]))), &rest[len..]))
            }
        }
    };
}

fn char_string_bytes(s: &String) -> &[u8] {
    s.as_bytes()
}

fn octet_string_bytes(s: &Vec<u8>) -> &[u8] {
    s.as_slice()
}

wire_short_lv!(CharString, char_string_bytes, decode_text);
wire_long_lv!(LongCharString, char_string_bytes, decode_text);
wire_short_lv!(OctetString, octet_string_bytes, <[u8]>::to_vec);
wire_long_lv!(LongOctetString, octet_string_bytes, <[u8]>::to_vec);

impl From<&str> for CharString {
    fn from(s: &str) -> Self {
        Self(Some(s.to_string()))
    }
}

impl From<&str> for LongCharString {
    fn from(s: &str) -> Self {
        Self(Some(s.to_string()))
    }
}

/// Convert IEEE 754 half-precision bits to an `f32`.
///
/// NaN payloads, infinities and subnormals are preserved where the target
/// format can represent them.
pub fn f32_from_half_bits(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15);
    let exp = u32::from((bits >> 10) & 0x1F);
    let frac = u32::from(bits & 0x3FF);

    let out = if exp == 0x1F {
        // Infinity or NaN
        (sign << 31) | (0xFF << 23) | (frac << 13)
    } else if exp == 0 {
        if frac == 0 {
            sign << 31
        } else {
            // Subnormal half, normal in f32
            let mut exp32: i32 = 127 - 15 + 1;
            let mut frac32 = frac;
            while frac32 & 0x400 == 0 {
                frac32 <<= 1;
                exp32 -= 1;
            }
            (sign << 31) | ((exp32 as u32) << 23) | ((frac32 & 0x3FF) << 13)
        }
    } else {
        (sign << 31) | ((exp + 127 - 15) << 23) | (frac << 13)
    };

    f32::from_bits(out)
}

/// Narrow an `f32` to IEEE 754 half-precision bits, truncating excess
/// fraction bits and saturating the exponent.
pub fn half_bits_from_f32(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 31) as u16) << 15;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let frac = bits & 0x007F_FFFF;

    if exp == 0xFF {
        // Infinity or NaN; keep NaN distinguishable from infinity
        let mut frac16 = (frac >> 13) as u16;
        if frac != 0 && frac16 == 0 {
            frac16 = 1;
        }
        return sign | 0x7C00 | frac16;
    }

    let unbiased = exp - 127;
    if unbiased > 15 {
        return sign | 0x7C00;
    }
    if unbiased >= -14 {
        return sign | (((unbiased + 15) as u16) << 10) | ((frac >> 13) as u16);
    }
    if unbiased >= -24 {
        // Subnormal half
        let frac32 = frac | 0x0080_0000;
        let shift = 13 + (-14 - unbiased);
        return sign | ((frac32 >> shift) as u16);
    }

    sign
}

/// Half-precision float, widened to `f32` in memory and re-narrowed on the
/// wire so NaN and infinities round-trip.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Half(pub f32);

impl WireFormat for Half {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&half_bits_from_f32(self.0).to_le_bytes());
    }

    fn deserialize(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (bits, rest) = u16::deserialize(data)?;
        Ok((Self(f32_from_half_bits(bits)), rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: WireFormat + PartialEq + std::fmt::Debug + Clone>(value: T) {
        let bytes = value.to_bytes();
        let (decoded, rest) = T::deserialize(&bytes).expect("decode");
        assert_eq!(decoded, value);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_primitive_roundtrips() {
        roundtrip(0u8);
        roundtrip(0x1234u16);
        roundtrip(0xDEAD_BEEFu32);
        roundtrip(u64::MAX);
        roundtrip(-1i8);
        roundtrip(i16::MIN);
        roundtrip(-123_456i32);
        roundtrip(i64::MIN);
        roundtrip(true);
        roundtrip(1.5f32);
        roundtrip(-2.25f64);
    }

    #[test]
    fn test_odd_width_ints() {
        roundtrip(U24(0x00FF_FFFF));
        roundtrip(U40(0xFF_FFFF_FFFF));
        roundtrip(U48(0xFFFF_FFFF_FFFF));
        roundtrip(U56(0xFF_FFFF_FFFF_FFFF));
        roundtrip(I24(-1));
        roundtrip(I24(I24::MIN));
        roundtrip(I40(-42));
        roundtrip(I48(I48::MAX));
        roundtrip(I56(I56::MIN));

        // Exactly the original wire width
        assert_eq!(U24(0x123456).to_bytes(), vec![0x56, 0x34, 0x12]);
        assert_eq!(I24(-1).to_bytes(), vec![0xFF, 0xFF, 0xFF]);

        assert!(U24::new(0x0100_0000).is_err());
        assert!(I24::new(0x0080_0000).is_err());
    }

    #[test]
    fn test_strings() {
        roundtrip(CharString::from("TRADFRI control outlet"));
        roundtrip(CharString(None));
        roundtrip(CharString(Some(String::new())));
        roundtrip(LongCharString::from("x"));
        roundtrip(OctetString(Some(vec![1, 2, 3])));
        roundtrip(OctetString(None));
        roundtrip(LongOctetString(Some(vec![0xAA; 300])));

        // Invalid marker is distinct from empty
        assert_eq!(CharString(None).to_bytes(), vec![0xFF]);
        assert_eq!(CharString(Some(String::new())).to_bytes(), vec![0x00]);

        // Embedded NUL terminates the decoded text
        let (s, _) = CharString::deserialize(&[0x04, b'a', b'b', 0x00, b'c']).unwrap();
        assert_eq!(s, CharString::from("ab"));
    }

    #[test]
    fn test_string_too_short() {
        assert!(matches!(
            CharString::deserialize(&[0x05, b'a']),
            Err(WireError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_eui64_display_parse() {
        let ieee = Eui64([0x40, 0x4F, 0x54, 0xFE, 0xFF, 0xBD, 0x1B, 0xEC]);
        assert_eq!(ieee.to_string(), "ec:1b:bd:ff:fe:54:4f:40");
        assert_eq!("ec:1b:bd:ff:fe:54:4f:40".parse::<Eui64>().unwrap(), ieee);
        roundtrip(ieee);
    }

    #[test]
    fn test_half_float_special_values() {
        for value in [0.0f32, -0.0, 1.0, -2.5, 65504.0, f32::INFINITY, f32::NEG_INFINITY] {
            let (decoded, _) = Half::deserialize(&Half(value).to_bytes()).unwrap();
            assert_eq!(decoded.0.to_bits(), value.to_bits());
        }

        let (nan, _) = Half::deserialize(&Half(f32::NAN).to_bytes()).unwrap();
        assert!(nan.0.is_nan());

        // Values beyond half range saturate to infinity
        let (big, _) = Half::deserialize(&Half(1.0e9).to_bytes()).unwrap();
        assert!(big.0.is_infinite());
    }

    #[test]
    fn test_buffer_too_short() {
        assert!(matches!(
            u32::deserialize(&[1, 2]),
            Err(WireError::BufferTooShort { .. })
        ));
        assert!(matches!(
            Eui64::deserialize(&[0; 7]),
            Err(WireError::BufferTooShort { .. })
        ));
    }
}
