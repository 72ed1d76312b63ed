//! # loadcell
//!
//! A Rust library for reading load-cell ratio sensors and turning them into
//! calibrated weight.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Connection lifecycle state machine with operator-driven retries
//! - Two-point (tare + span) calibration
//! - Observable readings through a `watch` channel, plus broadcast events
//! - USB serial and TCP sensor bridges behind one [`DeviceChannel`] trait
//!
//! ## Quick Start
//!
//! ```no_run
//! use loadcell::{ConnectionState, Scale, TransportKind};
//!
//! #[tokio::main]
//! async fn main() {
//!     let scale = Scale::bridge(TransportKind::usb_port("/dev/ttyACM0"));
//!
//!     if scale.connect().await != ConnectionState::Streaming {
//!         eprintln!("{}", scale.snapshot().message);
//!         return;
//!     }
//!
//!     // Empty scale
//!     scale.tare().await;
//!
//!     // ... place a 100 g reference mass, then:
//!     match scale.calibrate(100.0).await {
//!         Ok(params) => println!("factor: {}", params.calibration_factor),
//!         Err(e) => eprintln!("calibration rejected: {e}"),
//!     }
//!
//!     let mut readings = scale.watch();
//!     while readings.changed().await.is_ok() {
//!         let state = readings.borrow_and_update().clone();
//!         println!("{} ({})", loadcell::format_weight(state.weight), state.message);
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`state`] - Connection lifecycle state machine
//! - [`calibration`] - Tare offset, calibration factor and the weight transform
//! - [`publisher`] - Observable readings and status
//! - [`event`] - Broadcast notifications
//! - [`transport`] - Device channel adapters (sensor bridge, mock)
//! - [`protocol`] - Line protocol spoken by the sensor bridge
//! - [`client`] - High-level [`Scale`] client

pub mod calibration;
pub mod client;
pub mod error;
pub mod event;
pub mod protocol;
pub mod publisher;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use calibration::{CalibrationEngine, CalibrationParameters, DEFAULT_KNOWN_MASS, weight};
pub use client::{Scale, ScaleConfig};
pub use error::{CalibrationError, Error, LineError, Result};
pub use event::{Event, EventDispatcher, EventFilter, EventKind, Subscription};
pub use publisher::{PublishedState, StatusCode, format_ratio, format_weight};
pub use state::{ConnectionEvent, ConnectionState};
pub use transport::{
    BridgeChannel, BridgeConfig, ChannelEvent, DeviceChannel, MockChannel, MockHandle, RawSample,
    TransportKind, list_ports,
};
