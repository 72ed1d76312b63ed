//! Observable readings and status.
//!
//! The [`Publisher`] rebuilds a full [`PublishedState`] snapshot whenever a
//! sample, a calibration change or a connection transition happens, and hands
//! it out through a `tokio::sync::watch` channel. It only projects; it never
//! changes the connection state or the calibration parameters.

use tokio::sync::watch;

use crate::calibration::CalibrationParameters;
use crate::error::CalibrationError;
use crate::state::ConnectionState;
use crate::transport::TransportKind;

/// Coarse status for the view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// No connection attempted yet.
    #[default]
    NotConnected,
    /// Waiting for the transport.
    Connecting,
    /// Waiting for the input channel.
    OpeningChannel,
    /// Readings are live.
    Streaming,
    /// Last attempt failed; see the message.
    Failed,
    /// Closed on request.
    Closed,
}

impl From<ConnectionState> for StatusCode {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Idle => Self::NotConnected,
            ConnectionState::Connecting => Self::Connecting,
            ConnectionState::ChannelOpening => Self::OpeningChannel,
            ConnectionState::Streaming => Self::Streaming,
            ConnectionState::Error => Self::Failed,
            ConnectionState::Closed => Self::Closed,
        }
    }
}

/// Builds the human-readable status line.
#[must_use]
pub fn status_message(
    state: ConnectionState,
    kind: Option<&TransportKind>,
    failure: Option<&str>,
) -> String {
    match state {
        ConnectionState::Idle => "Not connected".into(),
        ConnectionState::Connecting => match kind {
            Some(TransportKind::Network { host, port }) => format!("Connecting to {host}:{port}…"),
            Some(TransportKind::Usb { .. }) | None => "Requesting USB access…".into(),
        },
        ConnectionState::ChannelOpening => "Connected, opening channel…".into(),
        ConnectionState::Streaming => "Channel open, streaming data".into(),
        ConnectionState::Error => format!("Error: {}", failure.unwrap_or("unknown failure")),
        ConnectionState::Closed => "Connection closed".into(),
    }
}

/// Formats a weight for display with one decimal place.
#[must_use]
pub fn format_weight(weight: f64) -> String {
    format!("{weight:.1} g")
}

/// Formats a raw ratio for display with six decimal places.
#[must_use]
pub fn format_ratio(ratio: f64) -> String {
    format!("{ratio:.6}")
}

/// Everything a view needs to render, at full precision.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedState {
    /// Coarse status.
    pub status: StatusCode,
    /// Status line.
    pub message: String,
    /// Latest raw ratio (0 until the first sample).
    pub raw_ratio: f64,
    /// Weight of `raw_ratio` under `calibration`.
    pub weight: f64,
    /// Parameters used for `weight`.
    pub calibration: CalibrationParameters,
    /// Reference mass entered by the operator.
    pub known_mass: f64,
    /// Last rejected calibration, cleared by the next successful one or a tare.
    pub rejection: Option<CalibrationError>,
}

impl PublishedState {
    fn initial(calibration: CalibrationParameters, known_mass: f64) -> Self {
        Self {
            status: StatusCode::NotConnected,
            message: status_message(ConnectionState::Idle, None, None),
            raw_ratio: 0.0,
            weight: calibration.weight(0.0),
            calibration,
            known_mass,
            rejection: None,
        }
    }
}

/// Publishes [`PublishedState`] snapshots.
#[derive(Debug)]
pub struct Publisher {
    tx: watch::Sender<PublishedState>,
}

impl Publisher {
    /// Creates a publisher with an initial snapshot.
    #[must_use]
    pub fn new(calibration: CalibrationParameters, known_mass: f64) -> Self {
        let (tx, _) = watch::channel(PublishedState::initial(calibration, known_mass));
        Self { tx }
    }

    /// Returns a receiver for snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PublishedState> {
        self.tx.subscribe()
    }

    /// Returns a copy of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> PublishedState {
        self.tx.borrow().clone()
    }

    /// Latest raw ratio.
    #[must_use]
    pub fn raw_ratio(&self) -> f64 {
        self.tx.borrow().raw_ratio
    }

    /// Operator's reference mass.
    #[must_use]
    pub fn known_mass(&self) -> f64 {
        self.tx.borrow().known_mass
    }

    fn rebuild(&self, update: impl FnOnce(&mut PublishedState)) {
        let mut next = self.snapshot();
        update(&mut next);
        next.weight = next.calibration.weight(next.raw_ratio);
        self.tx.send_replace(next);
    }

    /// Publishes a new sample weighed with `calibration`.
    pub fn publish_sample(&self, raw_ratio: f64, calibration: &CalibrationParameters) {
        self.rebuild(|state| {
            state.raw_ratio = raw_ratio;
            state.calibration = *calibration;
        });
    }

    /// Publishes new calibration parameters and clears any rejection.
    pub fn publish_calibration(&self, calibration: &CalibrationParameters) {
        self.rebuild(|state| {
            state.calibration = *calibration;
            state.rejection = None;
        });
    }

    /// Publishes a rejected calibration request.
    pub fn publish_rejection(&self, error: CalibrationError) {
        self.rebuild(|state| state.rejection = Some(error));
    }

    /// Publishes the operator's reference mass.
    pub fn publish_known_mass(&self, known_mass: f64) {
        self.rebuild(|state| state.known_mass = known_mass);
    }

    /// Publishes a connection status change.
    pub fn publish_status(&self, status: StatusCode, message: String) {
        self.rebuild(|state| {
            state.status = status;
            state.message = message;
        });
    }
}
