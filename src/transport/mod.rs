//! Device channel adapters.
//!
//! [`DeviceChannel`] is the capability the [`Scale`](crate::Scale) uses to
//! reach the hardware. [`BridgeChannel`] talks to a line-oriented sensor bridge
//! over USB serial or TCP; [`mock::MockChannel`] is a scriptable stand-in.

pub mod bridge;
pub mod mock;

use std::fmt;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;

/// How the sensor is reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// USB serial device. `None` picks the first available port.
    Usb { port: Option<String> },
    /// Network bridge.
    Network { host: String, port: u16 },
}

impl TransportKind {
    /// USB transport on the first available port.
    #[must_use]
    pub const fn usb() -> Self {
        Self::Usb { port: None }
    }

    /// USB transport on a specific port (e.g. "/dev/ttyACM0" or "COM3").
    #[must_use]
    pub fn usb_port(port: impl Into<String>) -> Self {
        Self::Usb {
            port: Some(port.into()),
        }
    }

    /// Network transport.
    #[must_use]
    pub fn network(host: impl Into<String>, port: u16) -> Self {
        Self::Network {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb { port: Some(port) } => write!(f, "USB {port}"),
            Self::Usb { port: None } => f.write_str("USB"),
            Self::Network { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// A raw voltage ratio as delivered by the adapter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// Dimensionless ratio.
    pub ratio: f64,
    /// When the sample was received. Ordering only.
    pub received_at: Instant,
}

impl RawSample {
    /// Stamps a ratio with the current instant.
    #[must_use]
    pub fn now(ratio: f64) -> Self {
        Self {
            ratio,
            received_at: Instant::now(),
        }
    }
}

/// Events delivered on the channel returned by [`DeviceChannel::open_channel`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A new reading.
    Sample(RawSample),
    /// The transport or channel went away. No further events follow.
    Lost { reason: String },
}

/// Default capacity of the sample channel.
pub const SAMPLE_CHANNEL_CAPACITY: usize = 256;

/// Trait for device channel adapters.
pub trait DeviceChannel: Send {
    /// Describes the transport.
    fn kind(&self) -> &TransportKind;

    /// Establishes the transport connection.
    fn connect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Opens the analog-ratio input channel and starts delivering samples.
    ///
    /// Samples arrive in order on the returned receiver.
    fn open_channel(
        &mut self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<ChannelEvent>>>;

    /// Releases the channel and the transport. Safe to call in any state.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Returns true if the transport is connected.
    fn is_connected(&self) -> bool;
}

pub use bridge::{BridgeChannel, BridgeConfig, list_ports};
pub use mock::{MockChannel, MockHandle};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(TransportKind::usb().to_string(), "USB");
        assert_eq!(TransportKind::usb_port("COM3").to_string(), "USB COM3");
        assert_eq!(
            TransportKind::network("192.168.1.20", 5661).to_string(),
            "192.168.1.20:5661"
        );
    }
}
