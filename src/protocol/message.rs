//! Message definitions for the sensor bridge protocol.
//!
//! Host to bridge:
//! ```text
//! open <channel> <timeout_ms>
//! close
//! ```
//!
//! Bridge to host:
//! ```text
//! ok
//! err <message>
//! vr <ratio>
//! ```

use bytes::Bytes;

use crate::error::LineError;
use crate::protocol::line::encode;

/// Commands sent from the host to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    /// Open the analog-ratio input channel.
    Open {
        /// Input channel index on the bridge.
        channel: u8,
        /// How long the bridge may take to attach the channel.
        timeout_ms: u64,
    },
    /// Stop streaming and release the channel.
    Close,
}

impl HostCommand {
    /// Encodes the command as a terminated line.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Open {
                channel,
                timeout_ms,
            } => encode(&format!("open {channel} {timeout_ms}")),
            Self::Close => encode("close"),
        }
    }
}

/// Messages received from the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// Last command succeeded.
    Ok,
    /// Last command failed, or the channel failed while streaming.
    Err { message: String },
    /// A voltage ratio sample.
    Ratio(f64),
}

impl DeviceMessage {
    /// Parses a decoded line.
    ///
    /// Keywords are case-insensitive. Ratios must be finite.
    pub fn parse(line: &str) -> Result<Self, LineError> {
        let line = line.trim();
        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (line, ""),
        };

        if keyword.eq_ignore_ascii_case("ok") && rest.is_empty() {
            Ok(Self::Ok)
        } else if keyword.eq_ignore_ascii_case("err") {
            let message = if rest.is_empty() {
                "unspecified bridge error".to_string()
            } else {
                rest.to_string()
            };
            Ok(Self::Err { message })
        } else if keyword.eq_ignore_ascii_case("vr") {
            rest.parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(Self::Ratio)
                .ok_or_else(|| LineError::InvalidRatio(rest.to_string()))
        } else {
            Err(LineError::Unrecognized(line.to_string()))
        }
    }
}
