//! Protocol definitions for the sensor bridge.
//!
//! This module contains the low-level protocol types used by
//! [`BridgeChannel`](crate::transport::BridgeChannel):
//! - Line encoding/decoding
//! - Host commands and bridge messages

pub mod line;
pub mod message;

pub use line::{LineDecoder, MAX_LINE_LEN, encode as encode_line};
pub use message::{DeviceMessage, HostCommand};
