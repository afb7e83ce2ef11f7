//! Zigbee application-layer wire formats
//!
//! This crate owns everything that crosses the air unchanged: primitive wire
//! types, the tagged ZCL attribute value, ZCL and ZDO frame formats, the
//! cluster schema registry and the OTA upgrade file codec. It performs no
//! I/O; the application controller in `zigbee-core` drives it.

pub mod error;
pub mod ota;
pub mod registry;
pub mod types;
pub mod value;
pub mod zcl;
pub mod zdo;

pub use error::WireError;
pub use types::{Eui64, KeyData, WireFormat};
pub use value::{TypeCode, ZclValue};
pub use zcl::{Direction, FrameControl, FrameType, GeneralCommandId, Status, ZclHeader};
