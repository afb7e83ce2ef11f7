//! Codec error types

use thiserror::Error;

/// Errors raised while encoding or decoding wire data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Buffer too short: need {needed} bytes, have {available}")]
    BufferTooShort { needed: usize, available: usize },

    #[error("Unknown ZCL type code: {0:#04X}")]
    UnknownTypeCode(u8),

    #[error("Value out of range for {context}: {value}")]
    ValueOutOfRange { context: &'static str, value: i128 },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl WireError {
    /// Shorthand for the length check every decoder performs
    pub fn check_len(data: &[u8], needed: usize) -> Result<(), WireError> {
        if data.len() < needed {
            return Err(WireError::BufferTooShort {
                needed,
                available: data.len(),
            });
        }
        Ok(())
    }
}
