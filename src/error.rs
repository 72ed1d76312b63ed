//! Error types for the loadcell library.

use thiserror::Error;

/// The main error type for loadcell operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Line encoding/decoding error.
    #[error("line error: {0}")]
    Line(#[from] LineError),

    /// The device access capability is missing or not ready yet.
    #[error("transport unavailable: {reason}")]
    TransportUnavailable { reason: String },

    /// The adapter failed to establish the transport connection.
    #[error("transport failure: {message}")]
    TransportFailure { message: String },

    /// The adapter failed to open the analog-ratio input channel.
    #[error("channel failure: {message}")]
    ChannelFailure { message: String },

    /// Operation timed out waiting for the device.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,
}

/// Errors from the line-oriented bridge protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    /// Line exceeds the maximum length and was discarded.
    #[error("line too long: {len} bytes exceeds maximum {max}")]
    TooLong { len: usize, max: usize },

    /// Line is not valid UTF-8.
    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    /// Line does not match any known message.
    #[error("unrecognized message: {0:?}")]
    Unrecognized(String),

    /// Ratio value could not be parsed as a finite number.
    #[error("invalid ratio: {0:?}")]
    InvalidRatio(String),
}

/// Rejected calibration requests.
///
/// These never change the connection state; the calibration parameters are
/// left exactly as they were.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum CalibrationError {
    /// Known mass is not a finite positive number.
    #[error("invalid known mass {0}: must be a finite positive number")]
    InvalidKnownMass(f64),

    /// The reading under the known mass is not above the tare offset.
    #[error(
        "invalid calibration span {span}: make sure the known mass is on the scale after taring"
    )]
    InvalidCalibrationSpan { span: f64 },
}

/// Result type alias for loadcell operations.
pub type Result<T> = std::result::Result<T, Error>;
